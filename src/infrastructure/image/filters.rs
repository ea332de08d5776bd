//! Pixel operations the `image` crate does not provide directly.
//!
//! Every function takes and returns a [`DynamicImage`]. Colour operations
//! work on RGBA8 and restore the alpha layout of their input.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgba, RgbaImage};

use crate::domain::entities::{BooleanOperator, Channel, Color, Colorspace, Kernel};

const LUMA_R: f32 = 0.2126;
const LUMA_G: f32 = 0.7152;
const LUMA_B: f32 = 0.0722;

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn luma(p: [u8; 4]) -> f32 {
    LUMA_R * f32::from(p[0]) + LUMA_G * f32::from(p[1]) + LUMA_B * f32::from(p[2])
}

/// Converts back to RGB8 when the input had no alpha channel.
fn restore_layout(original: &DynamicImage, rgba: RgbaImage) -> DynamicImage {
    let out = DynamicImage::ImageRgba8(rgba);
    if original.color().has_alpha() {
        out
    } else {
        DynamicImage::ImageRgb8(out.to_rgb8())
    }
}

fn map_pixels(img: &DynamicImage, f: impl Fn([u8; 4]) -> [u8; 4]) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    for pixel in rgba.pixels_mut() {
        pixel.0 = f(pixel.0);
    }
    restore_layout(img, rgba)
}

fn map_colour_channels(img: &DynamicImage, f: impl Fn(u8) -> u8) -> DynamicImage {
    map_pixels(img, |[r, g, b, a]| [f(r), f(g), f(b), a])
}

pub fn negate(img: &DynamicImage, alpha: bool) -> DynamicImage {
    map_pixels(img, |[r, g, b, a]| {
        [255 - r, 255 - g, 255 - b, if alpha { 255 - a } else { a }]
    })
}

pub fn linear(img: &DynamicImage, a: f32, b: f32) -> DynamicImage {
    map_colour_channels(img, |v| clamp_u8(f32::from(v) * a + b))
}

pub fn gamma(img: &DynamicImage, gamma: f32, gamma_out: f32) -> DynamicImage {
    let exponent = gamma / gamma_out;
    let table: Vec<u8> = (0..=255u8)
        .map(|v| clamp_u8((f32::from(v) / 255.0).powf(exponent) * 255.0))
        .collect();
    map_colour_channels(img, |v| table[usize::from(v)])
}

pub fn recomb(img: &DynamicImage, matrix: &[[f32; 3]; 3]) -> DynamicImage {
    map_pixels(img, |[r, g, b, a]| {
        let rgb = [f32::from(r), f32::from(g), f32::from(b)];
        let row = |m: &[f32; 3]| clamp_u8(m[0] * rgb[0] + m[1] * rgb[1] + m[2] * rgb[2]);
        [row(&matrix[0]), row(&matrix[1]), row(&matrix[2]), a]
    })
}

/// Keeps each pixel's luminance and takes chroma from `color`.
pub fn tint(img: &DynamicImage, color: Color) -> DynamicImage {
    let tint_luma = luma([color.r, color.g, color.b, 255]).max(1.0);
    map_pixels(img, |p| {
        let scale = luma(p) / tint_luma;
        [
            clamp_u8(f32::from(color.r) * scale),
            clamp_u8(f32::from(color.g) * scale),
            clamp_u8(f32::from(color.b) * scale),
            p[3],
        ]
    })
}

pub fn threshold(img: &DynamicImage, level: u8, grayscale: bool) -> DynamicImage {
    let cut = |v: u8| if v >= level { 255 } else { 0 };
    if grayscale {
        let gray = img.to_luma8();
        let out: GrayImage = ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
            Luma([cut(gray.get_pixel(x, y).0[0])])
        });
        DynamicImage::ImageLuma8(out)
    } else {
        map_colour_channels(img, cut)
    }
}

/// Stretches luminance so the darkest pixel becomes black and the
/// brightest white.
pub fn normalize(img: &DynamicImage) -> DynamicImage {
    let rgba = img.to_rgba8();
    let (min, max) = rgba.pixels().fold((f32::MAX, f32::MIN), |(lo, hi), p| {
        let l = luma(p.0);
        (lo.min(l), hi.max(l))
    });
    if max - min < 1.0 {
        return img.clone();
    }
    let scale = 255.0 / (max - min);
    map_colour_channels(img, |v| clamp_u8((f32::from(v) - min) * scale))
}

/// Brightness and saturation multiply, hue rotates in degrees, lightness
/// is added on a 0..100 scale.
pub fn modulate(
    img: &DynamicImage,
    brightness: f32,
    saturation: f32,
    hue: f32,
    lightness: f32,
) -> DynamicImage {
    map_pixels(img, |[r, g, b, a]| {
        let scaled = |v: u8| (f32::from(v) / 255.0 * brightness).clamp(0.0, 1.0);
        let (h, s, l) = rgb_to_hsl(scaled(r), scaled(g), scaled(b));
        let h = (h + hue).rem_euclid(360.0);
        let s = (s * saturation).clamp(0.0, 1.0);
        let l = (l + lightness / 100.0).clamp(0.0, 1.0);
        let (r, g, b) = hsl_to_rgb(h, s, l);
        [clamp_u8(r * 255.0), clamp_u8(g * 255.0), clamp_u8(b * 255.0), a]
    })
}

fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;
    let d = max - min;
    if d == 0.0 {
        return (0.0, 0.0, l);
    }
    let s = d / (1.0 - (2.0 * l - 1.0).abs());
    let h = if max == r {
        60.0 * ((g - b) / d).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / d + 2.0)
    } else {
        60.0 * ((r - g) / d + 4.0)
    };
    (h, s, l)
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let x = c * (1.0 - ((h / 60.0).rem_euclid(2.0) - 1.0).abs());
    let m = l - c / 2.0;
    let (r, g, b) = match h {
        h if h < 60.0 => (c, x, 0.0),
        h if h < 120.0 => (x, c, 0.0),
        h if h < 180.0 => (0.0, c, x),
        h if h < 240.0 => (0.0, x, c),
        h if h < 300.0 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (r + m, g + m, b + m)
}

/// Composites over `background` and drops alpha.
pub fn flatten(img: &DynamicImage, background: Color) -> DynamicImage {
    if !img.color().has_alpha() {
        return img.clone();
    }
    let rgba = img.to_rgba8();
    let bg = [background.r, background.g, background.b];
    let out = ImageBuffer::from_fn(rgba.width(), rgba.height(), |x, y| {
        let p = rgba.get_pixel(x, y).0;
        let alpha = f32::from(p[3]) / 255.0;
        let blend = |i: usize| clamp_u8(f32::from(p[i]) * alpha + f32::from(bg[i]) * (1.0 - alpha));
        image::Rgb([blend(0), blend(1), blend(2)])
    });
    DynamicImage::ImageRgb8(out)
}

pub fn remove_alpha(img: &DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageLumaA8(_) => DynamicImage::ImageLuma8(img.to_luma8()),
        DynamicImage::ImageLumaA16(_) => DynamicImage::ImageLuma16(img.to_luma16()),
        DynamicImage::ImageRgba16(_) => DynamicImage::ImageRgb16(img.to_rgb16()),
        other if other.color().has_alpha() => DynamicImage::ImageRgb8(other.to_rgb8()),
        other => other.clone(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn ensure_alpha(img: &DynamicImage, alpha: f32) -> DynamicImage {
    if img.color().has_alpha() {
        return img.clone();
    }
    let value = (alpha * 255.0).round().clamp(0.0, 255.0) as u8;
    let mut rgba = img.to_rgba8();
    for pixel in rgba.pixels_mut() {
        pixel.0[3] = value;
    }
    DynamicImage::ImageRgba8(rgba)
}

pub fn extract_channel(img: &DynamicImage, channel: Channel) -> DynamicImage {
    let rgba = img.to_rgba8();
    let index = channel.index();
    let out: GrayImage = ImageBuffer::from_fn(rgba.width(), rgba.height(), |x, y| {
        Luma([rgba.get_pixel(x, y).0[index]])
    });
    DynamicImage::ImageLuma8(out)
}

/// Working precision for subsequent operations.
pub fn pipeline_colorspace(img: &DynamicImage, colorspace: Colorspace) -> DynamicImage {
    let alpha = img.color().has_alpha();
    match (colorspace, alpha) {
        (Colorspace::Srgb, true) => DynamicImage::ImageRgba8(img.to_rgba8()),
        (Colorspace::Srgb, false) => DynamicImage::ImageRgb8(img.to_rgb8()),
        (Colorspace::Rgb16, true) => DynamicImage::ImageRgba16(img.to_rgba16()),
        (Colorspace::Rgb16, false) => DynamicImage::ImageRgb16(img.to_rgb16()),
        (Colorspace::BW | Colorspace::Grey16, _) => to_colorspace(img, colorspace),
    }
}

/// Final interpretation of the pixels.
pub fn to_colorspace(img: &DynamicImage, colorspace: Colorspace) -> DynamicImage {
    let alpha = img.color().has_alpha();
    match (colorspace, alpha) {
        (Colorspace::BW, true) => DynamicImage::ImageLumaA8(img.to_luma_alpha8()),
        (Colorspace::BW, false) => DynamicImage::ImageLuma8(img.to_luma8()),
        (Colorspace::Grey16, true) => DynamicImage::ImageLumaA16(img.to_luma_alpha16()),
        (Colorspace::Grey16, false) => DynamicImage::ImageLuma16(img.to_luma16()),
        (Colorspace::Srgb | Colorspace::Rgb16, _) => pipeline_colorspace(img, colorspace),
    }
}

/// Combines `img` with `operand` channel by channel. The operand is
/// stretched to the image's dimensions first.
pub fn boolean(img: &DynamicImage, operand: &DynamicImage, operator: BooleanOperator) -> DynamicImage {
    let other = if operand.width() == img.width() && operand.height() == img.height() {
        operand.to_rgba8()
    } else {
        operand
            .resize_exact(img.width(), img.height(), FilterType::Triangle)
            .to_rgba8()
    };
    let mut rgba = img.to_rgba8();
    for (pixel, rhs) in rgba.pixels_mut().zip(other.pixels()) {
        for i in 0..3 {
            pixel.0[i] = operator.apply(pixel.0[i], rhs.0[i]);
        }
    }
    restore_layout(img, rgba)
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn sample(img: &RgbaImage, x: i64, y: i64) -> &Rgba<u8> {
    let cx = x.clamp(0, i64::from(img.width()) - 1) as u32;
    let cy = y.clamp(0, i64::from(img.height()) - 1) as u32;
    img.get_pixel(cx, cy)
}

/// Arbitrary kernel convolution with edge clamping. Alpha is preserved.
pub fn convolve(img: &DynamicImage, kernel: &Kernel) -> DynamicImage {
    let src = img.to_rgba8();
    let half_w = i64::from(kernel.width / 2);
    let half_h = i64::from(kernel.height / 2);
    let out = ImageBuffer::from_fn(src.width(), src.height(), |x, y| {
        let mut acc = [0.0_f32; 3];
        for ky in 0..kernel.height {
            for kx in 0..kernel.width {
                let weight = kernel.weights[(ky * kernel.width + kx) as usize];
                if weight == 0.0 {
                    continue;
                }
                let p = sample(
                    &src,
                    i64::from(x) + i64::from(kx) - half_w,
                    i64::from(y) + i64::from(ky) - half_h,
                );
                for (sum, v) in acc.iter_mut().zip(p.0) {
                    *sum += f32::from(v) * weight;
                }
            }
        }
        let channel = |sum: f32| clamp_u8(sum / kernel.scale + kernel.offset);
        Rgba([
            channel(acc[0]),
            channel(acc[1]),
            channel(acc[2]),
            src.get_pixel(x, y).0[3],
        ])
    });
    restore_layout(img, out)
}

/// Square median filter of side `size`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn median(img: &DynamicImage, size: u32) -> DynamicImage {
    let src = img.to_rgba8();
    let half = i64::from(size / 2);
    let window = (2 * half + 1).pow(2) as usize;
    let out = ImageBuffer::from_fn(src.width(), src.height(), |x, y| {
        let mut histograms = [[0u32; 256]; 3];
        for dy in -half..=half {
            for dx in -half..=half {
                let p = sample(&src, i64::from(x) + dx, i64::from(y) + dy);
                for (hist, v) in histograms.iter_mut().zip(p.0) {
                    hist[usize::from(v)] += 1;
                }
            }
        }
        let middle = |hist: &[u32; 256]| {
            let mut seen = 0usize;
            for (value, count) in (0..=255u8).zip(hist) {
                seen += *count as usize;
                if seen * 2 > window {
                    return value;
                }
            }
            255
        };
        Rgba([
            middle(&histograms[0]),
            middle(&histograms[1]),
            middle(&histograms[2]),
            src.get_pixel(x, y).0[3],
        ])
    });
    restore_layout(img, out)
}

/// Without a sigma, a fast 3x3 box blur.
pub fn blur(img: &DynamicImage, sigma: Option<f32>) -> DynamicImage {
    match sigma {
        Some(sigma) => img.blur(sigma),
        None => img.filter3x3(&[1.0 / 9.0; 9]),
    }
}

/// Unsharp mask. `flat` applies where the detail is at most two levels,
/// `jagged` elsewhere. Without a sigma, a fast 3x3 sharpen.
pub fn sharpen(img: &DynamicImage, sigma: Option<f32>, flat: f32, jagged: f32) -> DynamicImage {
    let Some(sigma) = sigma else {
        return img.filter3x3(&[0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0]);
    };
    let src = img.to_rgba8();
    let blurred = imageops::blur(&src, sigma);
    let mut out = src.clone();
    for (pixel, soft) in out.pixels_mut().zip(blurred.pixels()) {
        for i in 0..3 {
            let detail = f32::from(pixel.0[i]) - f32::from(soft.0[i]);
            let amount = if detail.abs() <= 2.0 { flat } else { jagged };
            pixel.0[i] = clamp_u8(f32::from(pixel.0[i]) + amount * detail);
        }
    }
    restore_layout(img, out)
}

/// Rotates by `angle` degrees clockwise. Right angles are lossless;
/// anything else expands the canvas and fills it with `background`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn rotate(img: &DynamicImage, angle: f32, background: Color) -> DynamicImage {
    let angle = angle.rem_euclid(360.0);
    if angle == 0.0 {
        return img.clone();
    }
    if angle == 90.0 {
        return img.rotate90();
    }
    if angle == 180.0 {
        return img.rotate180();
    }
    if angle == 270.0 {
        return img.rotate270();
    }

    let src = img.to_rgba8();
    let (sin, cos) = angle.to_radians().sin_cos();
    let (w, h) = (src.width() as f32, src.height() as f32);
    let out_w = (w * cos.abs() + h * sin.abs()).ceil().max(1.0) as u32;
    let out_h = (w * sin.abs() + h * cos.abs()).ceil().max(1.0) as u32;
    let (cx, cy) = (w / 2.0, h / 2.0);
    let (ocx, ocy) = (out_w as f32 / 2.0, out_h as f32 / 2.0);
    let fill = Rgba([background.r, background.g, background.b, background.a]);

    let out = ImageBuffer::from_fn(out_w, out_h, |x, y| {
        let dx = x as f32 + 0.5 - ocx;
        let dy = y as f32 + 0.5 - ocy;
        let sx = dx * cos + dy * sin + cx;
        let sy = -dx * sin + dy * cos + cy;
        if sx < 0.0 || sy < 0.0 || sx >= w || sy >= h {
            fill
        } else {
            *src.get_pixel(sx as u32, sy as u32)
        }
    });
    if img.color().has_alpha() || background.a < 255 {
        DynamicImage::ImageRgba8(out)
    } else {
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(out).to_rgb8())
    }
}

/// Contrast-limited adaptive histogram equalisation over `width` x
/// `height` tiles. A `max_slope` of zero disables clipping.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn clahe(img: &DynamicImage, width: u32, height: u32, max_slope: u32) -> DynamicImage {
    let src = img.to_rgba8();
    let (img_w, img_h) = src.dimensions();
    let tiles_x = img_w.div_ceil(width).max(1);
    let tiles_y = img_h.div_ceil(height).max(1);

    let lumas: Vec<u8> = src.pixels().map(|p| clamp_u8(luma(p.0))).collect();
    let mut maps = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let mut hist = [0u32; 256];
            let x_end = ((tx + 1) * width).min(img_w);
            let y_end = ((ty + 1) * height).min(img_h);
            for y in ty * height..y_end {
                for x in tx * width..x_end {
                    hist[usize::from(lumas[(y * img_w + x) as usize])] += 1;
                }
            }
            let count: u32 = hist.iter().sum();
            if count == 0 {
                continue;
            }
            if max_slope > 0 {
                let limit = (u64::from(max_slope) * u64::from(count) / 256).max(1) as u32;
                let mut excess = 0;
                for bin in &mut hist {
                    if *bin > limit {
                        excess += *bin - limit;
                        *bin = limit;
                    }
                }
                let share = excess / 256;
                for bin in &mut hist {
                    *bin += share;
                }
            }
            let total: u32 = hist.iter().sum::<u32>().max(1);
            let map = &mut maps[(ty * tiles_x + tx) as usize];
            let mut cdf = 0;
            for (slot, bin) in map.iter_mut().zip(hist) {
                cdf += bin;
                *slot = clamp_u8(cdf as f32 * 255.0 / total as f32);
            }
        }
    }

    // Bilinear interpolation between the four nearest tile centres.
    let tile_of = |pos: u32, size: u32, tiles: u32| {
        let f = (pos as f32 + 0.5) / size as f32 - 0.5;
        let lo = f.floor().clamp(0.0, (tiles - 1) as f32);
        let hi = (lo + 1.0).min((tiles - 1) as f32);
        (lo as u32, hi as u32, (f - lo).clamp(0.0, 1.0))
    };
    let mut out = src.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let l = lumas[(y * img_w + x) as usize];
        let (x0, x1, fx) = tile_of(x, width, tiles_x);
        let (y0, y1, fy) = tile_of(y, height, tiles_y);
        let at = |tx: u32, ty: u32| f32::from(maps[(ty * tiles_x + tx) as usize][usize::from(l)]);
        let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
        let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
        let delta = top * (1.0 - fy) + bottom * fy - f32::from(l);
        for i in 0..3 {
            pixel.0[i] = clamp_u8(f32::from(pixel.0[i]) + delta);
        }
    }
    restore_layout(img, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn solid(r: u8, g: u8, b: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, image::Rgb([r, g, b])))
    }

    fn first(img: &DynamicImage) -> [u8; 4] {
        img.to_rgba8().get_pixel(0, 0).0
    }

    #[test]
    fn test_negate_keeps_layout() {
        let out = negate(&solid(10, 20, 30), true);
        assert!(!out.color().has_alpha());
        assert_eq!(first(&out), [245, 235, 225, 255]);
    }

    #[test]
    fn test_linear_clamps() {
        assert_eq!(first(&linear(&solid(100, 200, 0), 2.0, 10.0)), [210, 255, 10, 255]);
    }

    #[test]
    fn test_threshold_grayscale() {
        let out = threshold(&solid(200, 200, 200), 128, true);
        assert_eq!(out.color(), image::ColorType::L8);
        assert_eq!(out.to_luma8().get_pixel(0, 0).0[0], 255);
    }

    #[test]
    fn test_flatten_blends_background() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([255, 255, 255, 0])));
        let out = flatten(&img, Color::rgb(0, 0, 255));
        assert!(!out.color().has_alpha());
        assert_eq!(first(&out), [0, 0, 255, 255]);
    }

    #[test]
    fn test_ensure_alpha_and_extract() {
        let out = ensure_alpha(&solid(1, 2, 3), 0.5);
        assert_eq!(first(&out)[3], 128);
        let alpha = extract_channel(&out, Channel::Alpha);
        assert_eq!(alpha.to_luma8().get_pixel(0, 0).0[0], 128);
    }

    #[test]
    fn test_boolean_and() {
        let out = boolean(&solid(0b1100, 0xff, 0), &solid(0b1010, 0x0f, 0xff), BooleanOperator::And);
        assert_eq!(first(&out), [0b1000, 0x0f, 0, 255]);
    }

    #[test]
    fn test_identity_kernel() {
        let kernel = Kernel {
            width: 3,
            height: 3,
            weights: vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            scale: 1.0,
            offset: 0.0,
        };
        assert_eq!(first(&convolve(&solid(9, 8, 7), &kernel)), [9, 8, 7, 255]);
    }

    #[test]
    fn test_median_removes_speck() {
        let mut img = RgbImage::from_pixel(5, 5, image::Rgb([0, 0, 0]));
        img.put_pixel(2, 2, image::Rgb([255, 255, 255]));
        let out = median(&DynamicImage::ImageRgb8(img), 3);
        assert_eq!(out.to_rgb8().get_pixel(2, 2).0, [0, 0, 0]);
    }

    #[test]
    fn test_rotate_expands_canvas() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(10, 4));
        let right = rotate(&img, 90.0, Color::BLACK);
        assert_eq!((right.width(), right.height()), (4, 10));
        let tilted = rotate(&img, 45.0, Color::BLACK);
        assert!(tilted.width() > 10 && tilted.height() > 4);
    }

    #[test]
    fn test_modulate_identity() {
        assert_eq!(first(&modulate(&solid(40, 120, 200), 1.0, 1.0, 0.0, 0.0)), [40, 120, 200, 255]);
    }

    #[test]
    fn test_normalize_stretches_range() {
        let mut img = RgbImage::from_pixel(2, 1, image::Rgb([100, 100, 100]));
        img.put_pixel(1, 0, image::Rgb([150, 150, 150]));
        let out = normalize(&DynamicImage::ImageRgb8(img)).to_rgb8();
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_clahe_keeps_dimensions() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(16, 16, |x, _| image::Rgb([(x * 8) as u8; 3])));
        let out = clahe(&img, 8, 8, 3);
        assert_eq!((out.width(), out.height()), (16, 16));
    }
}
