//! Pure Rust [`ImageEnginePort`] on top of the `image` crate.
//!
//! | Stage | Implementation |
//! |---|---|
//! | Decode (JPEG, PNG, WebP, GIF, TIFF) | `image::ImageReader` with [`Limits`] |
//! | Resize | `imageops` with `Lanczos3` |
//! | Operations | [`filters`](super::filters) plus `DynamicImage` built-ins |
//! | Encode | per-format encoders; JPEG 2000 and HEIF are not compiled in |

use std::collections::HashMap;
use std::io::Cursor;

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat as CodecFormat, ImageReader, Limits, RgbaImage};
use tracing::debug;

use super::filters;
use crate::domain::entities::{
    FitMode, ImageFormat, MAX_DIMENSION, Operation, PipelineSpec, ResizeStage,
};
use crate::domain::errors::EngineError;
use crate::domain::ports::{ImageEnginePort, OperandImages};

/// Largest accepted width or height, in pixels.
pub const DEFAULT_MAX_DIMENSION: u32 = MAX_DIMENSION;
/// Largest decoder allocation, in bytes.
pub const DEFAULT_MAX_ALLOC: u64 = 512 * 1024 * 1024;

const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_AVIF_QUALITY: u8 = 50;
const DEFAULT_AVIF_SPEED: u8 = 6;

/// Image engine backed by the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct ImageRsEngine {
    max_dimension: u32,
    max_alloc: u64,
}

impl ImageRsEngine {
    /// Creates an engine with default decode limits.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            max_alloc: DEFAULT_MAX_ALLOC,
        }
    }

    /// Overrides the decode limits.
    #[must_use]
    pub const fn with_limits(max_dimension: u32, max_alloc: u64) -> Self {
        Self {
            max_dimension,
            max_alloc,
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, EngineError> {
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        limits.max_alloc = Some(self.max_alloc);

        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        if reader.format().is_none() {
            return Err(EngineError::Decode("unrecognised image format".into()));
        }
        reader.limits(limits);
        reader
            .decode()
            .map_err(|e| EngineError::Decode(e.to_string()))
    }

    fn apply(
        &self,
        img: DynamicImage,
        operation: &Operation,
        operands: &HashMap<String, DynamicImage>,
    ) -> Result<DynamicImage, EngineError> {
        let out = match operation {
            Operation::Negate { alpha } => filters::negate(&img, *alpha),
            Operation::Clahe {
                width,
                height,
                max_slope,
            } => filters::clahe(&img, *width, *height, *max_slope),
            Operation::Convolve(kernel) => filters::convolve(&img, kernel),
            Operation::Modulate {
                brightness,
                saturation,
                hue,
                lightness,
            } => filters::modulate(&img, *brightness, *saturation, *hue, *lightness),
            Operation::Flip => img.flipv(),
            Operation::Flop => img.fliph(),
            Operation::Normalize => filters::normalize(&img),
            Operation::Grayscale => img.grayscale(),
            Operation::RemoveAlpha => filters::remove_alpha(&img),
            Operation::Rotate { angle, background } => filters::rotate(&img, *angle, *background),
            Operation::Threshold {
                threshold,
                grayscale,
            } => filters::threshold(&img, *threshold, *grayscale),
            Operation::Boolean { operand, operator } => {
                let other = operands.get(operand).ok_or_else(|| {
                    EngineError::InvalidInput(format!("operand image {operand} was not provided"))
                })?;
                filters::boolean(&img, other, *operator)
            }
            Operation::Linear { a, b } => filters::linear(&img, *a, *b),
            Operation::Recomb(matrix) => filters::recomb(&img, matrix),
            Operation::Sharpen {
                sigma,
                flat,
                jagged,
            } => filters::sharpen(&img, *sigma, *flat, *jagged),
            Operation::Median { size } => filters::median(&img, *size),
            Operation::Blur { sigma } => filters::blur(&img, *sigma),
            Operation::Flatten { background } => filters::flatten(&img, *background),
            Operation::Gamma { gamma, gamma_out } => filters::gamma(&img, *gamma, *gamma_out),
            Operation::Tint(color) => filters::tint(&img, *color),
            Operation::PipelineColorspace(colorspace) => {
                filters::pipeline_colorspace(&img, *colorspace)
            }
            Operation::ToColorspace(colorspace) => filters::to_colorspace(&img, *colorspace),
            Operation::EnsureAlpha { alpha } => filters::ensure_alpha(&img, *alpha),
            Operation::ExtractChannel(channel) => filters::extract_channel(&img, *channel),
        };
        if out.width() > self.max_dimension || out.height() > self.max_dimension {
            return Err(EngineError::InvalidInput(format!(
                "{} produced a {}x{} image, above the {} pixel limit",
                operation.name(),
                out.width(),
                out.height(),
                self.max_dimension
            )));
        }
        Ok(out)
    }
}

impl Default for ImageRsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageEnginePort for ImageRsEngine {
    fn render(
        &self,
        spec: &PipelineSpec,
        source: &[u8],
        operands: &OperandImages,
    ) -> Result<Vec<u8>, EngineError> {
        let mut img = self.decode(source)?;
        debug!(width = img.width(), height = img.height(), color = ?img.color(), "Decoded source");

        let decoded_operands = operands
            .iter()
            .map(|(url, bytes)| Ok((url.clone(), self.decode(bytes)?)))
            .collect::<Result<HashMap<_, _>, EngineError>>()?;

        if let Some(stage) = spec.resize {
            img = resize(&img, stage, self.max_dimension)?;
        }
        for operation in &spec.operations {
            img = self.apply(img, operation, &decoded_operands)?;
        }

        encode(&img, spec.output.format, spec.output.quality, spec.output.speed)
    }
}

/// Computes the output box for a resize stage.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn target_dimensions(src_w: u32, src_h: u32, stage: ResizeStage) -> (u32, u32) {
    let scaled = |value: f64| (value.round() as u32).max(1);
    match (stage.width, stage.height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, scaled(f64::from(src_h) * f64::from(w) / f64::from(src_w))),
        (None, Some(h)) => (scaled(f64::from(src_w) * f64::from(h) / f64::from(src_h)), h),
        (None, None) => (src_w, src_h),
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn resize(
    img: &DynamicImage,
    stage: ResizeStage,
    max_dimension: u32,
) -> Result<DynamicImage, EngineError> {
    if img.width() == 0 || img.height() == 0 {
        return Err(EngineError::InvalidInput("source image is empty".into()));
    }
    let (w, h) = target_dimensions(img.width(), img.height(), stage);
    check_dimensions(w, h, max_dimension)?;
    let filter = FilterType::Lanczos3;

    // A single dimension keeps the aspect ratio whatever the fit.
    if stage.width.is_none() || stage.height.is_none() {
        return Ok(img.resize_exact(w, h, filter));
    }

    let out = match stage.fit {
        FitMode::Cover => img.resize_to_fill(w, h, filter),
        FitMode::Fill => img.resize_exact(w, h, filter),
        FitMode::Inside => img.resize(w, h, filter),
        FitMode::Outside => {
            let ratio = (f64::from(w) / f64::from(img.width()))
                .max(f64::from(h) / f64::from(img.height()));
            let out_w = ((f64::from(img.width()) * ratio).round() as u32).max(w);
            let out_h = ((f64::from(img.height()) * ratio).round() as u32).max(h);
            check_dimensions(out_w, out_h, max_dimension)?;
            img.resize_exact(out_w, out_h, filter)
        }
        FitMode::Contain => {
            let inner = img.resize(w, h, filter);
            let mut canvas = RgbaImage::new(w, h);
            let x = i64::from((w - inner.width()) / 2);
            let y = i64::from((h - inner.height()) / 2);
            imageops::overlay(&mut canvas, &inner.to_rgba8(), x, y);
            DynamicImage::ImageRgba8(canvas)
        }
    };
    Ok(out)
}

/// Rejects a resize target before any pixel buffer is allocated.
fn check_dimensions(width: u32, height: u32, max_dimension: u32) -> Result<(), EngineError> {
    if width > max_dimension || height > max_dimension {
        return Err(EngineError::InvalidInput(format!(
            "resize to {width}x{height} is above the {max_dimension} pixel limit"
        )));
    }
    Ok(())
}

/// Narrows to a pixel layout the target encoder accepts.
fn for_encoder(img: &DynamicImage, format: ImageFormat) -> DynamicImage {
    let alpha = img.color().has_alpha();
    let gray = img.color().channel_count() <= 2;
    match format {
        ImageFormat::Jpeg if gray => DynamicImage::ImageLuma8(img.to_luma8()),
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
        ImageFormat::Gif => DynamicImage::ImageRgba8(img.to_rgba8()),
        ImageFormat::Webp | ImageFormat::Avif if alpha => DynamicImage::ImageRgba8(img.to_rgba8()),
        ImageFormat::Webp | ImageFormat::Avif => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img.clone(),
    }
}

fn encode(
    img: &DynamicImage,
    format: ImageFormat,
    quality: Option<u8>,
    speed: Option<u8>,
) -> Result<Vec<u8>, EngineError> {
    let img = for_encoder(img, format);
    let encode_err = |e: image::ImageError| EngineError::Encode(format!("{format}: {e}"));

    match format {
        ImageFormat::Jpeg => {
            let mut out = Vec::new();
            let encoder =
                JpegEncoder::new_with_quality(&mut out, quality.unwrap_or(DEFAULT_JPEG_QUALITY));
            img.write_with_encoder(encoder).map_err(encode_err)?;
            Ok(out)
        }
        ImageFormat::Avif => {
            let mut out = Vec::new();
            let encoder = AvifEncoder::new_with_speed_quality(
                &mut out,
                speed.unwrap_or(DEFAULT_AVIF_SPEED),
                quality.unwrap_or(DEFAULT_AVIF_QUALITY),
            );
            img.write_with_encoder(encoder).map_err(encode_err)?;
            Ok(out)
        }
        ImageFormat::Png | ImageFormat::Webp | ImageFormat::Gif | ImageFormat::Tiff => {
            let codec = match format {
                ImageFormat::Png => CodecFormat::Png,
                ImageFormat::Webp => CodecFormat::WebP,
                ImageFormat::Gif => CodecFormat::Gif,
                _ => CodecFormat::Tiff,
            };
            let mut out = Cursor::new(Vec::new());
            img.write_to(&mut out, codec).map_err(encode_err)?;
            Ok(out.into_inner())
        }
        ImageFormat::Raw => Ok(img.into_bytes()),
        ImageFormat::Jp2 | ImageFormat::Heif => Err(EngineError::Unsupported(format!(
            "encoding to {format} is not available"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{BooleanOperator, OutputStage};
    use image::{GenericImageView, Rgb, RgbImage};
    use test_case::test_case;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, CodecFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn spec(format: ImageFormat, resize: Option<ResizeStage>, operations: Vec<Operation>) -> PipelineSpec {
        PipelineSpec {
            resize,
            output: OutputStage {
                format,
                quality: None,
                speed: None,
            },
            operations,
        }
    }

    fn render(spec: &PipelineSpec, source: &[u8]) -> DynamicImage {
        let bytes = ImageRsEngine::new()
            .render(spec, source, &OperandImages::new())
            .unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    #[test_case(FitMode::Cover, 50, 50 ; "cover crops")]
    #[test_case(FitMode::Fill, 50, 50 ; "fill stretches")]
    #[test_case(FitMode::Contain, 50, 50 ; "contain pads")]
    #[test_case(FitMode::Inside, 50, 25 ; "inside shrinks within")]
    #[test_case(FitMode::Outside, 100, 50 ; "outside covers box")]
    fn test_resize_fit_modes(fit: FitMode, width: u32, height: u32) {
        let stage = ResizeStage {
            fit,
            width: Some(50),
            height: Some(50),
        };
        let out = render(&spec(ImageFormat::Png, Some(stage), vec![]), &png(200, 100));
        assert_eq!(out.dimensions(), (width, height));
    }

    #[test]
    fn test_single_dimension_keeps_aspect() {
        let stage = ResizeStage {
            fit: FitMode::Cover,
            width: Some(100),
            height: None,
        };
        let out = render(&spec(ImageFormat::Png, Some(stage), vec![]), &png(200, 100));
        assert_eq!(out.dimensions(), (100, 50));
    }

    #[test_case(ImageFormat::Jpeg, CodecFormat::Jpeg ; "jpeg")]
    #[test_case(ImageFormat::Png, CodecFormat::Png ; "png")]
    #[test_case(ImageFormat::Webp, CodecFormat::WebP ; "webp")]
    #[test_case(ImageFormat::Gif, CodecFormat::Gif ; "gif")]
    #[test_case(ImageFormat::Tiff, CodecFormat::Tiff ; "tiff")]
    fn test_encodes_requested_format(format: ImageFormat, codec: CodecFormat) {
        let bytes = ImageRsEngine::new()
            .render(&spec(format, None, vec![]), &png(8, 8), &OperandImages::new())
            .unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), codec);
    }

    #[test]
    fn test_raw_output_is_pixels() {
        let bytes = ImageRsEngine::new()
            .render(&spec(ImageFormat::Raw, None, vec![]), &png(4, 2), &OperandImages::new())
            .unwrap();
        assert_eq!(bytes.len(), 4 * 2 * 3);
    }

    #[test_case(ImageFormat::Heif ; "heif")]
    #[test_case(ImageFormat::Jp2 ; "jp2")]
    fn test_unavailable_encoders(format: ImageFormat) {
        let result = ImageRsEngine::new().render(&spec(format, None, vec![]), &png(4, 4), &OperandImages::new());
        assert!(matches!(result, Err(EngineError::Unsupported(_))));
    }

    #[test]
    fn test_operations_apply_in_order() {
        let ops = vec![Operation::Rotate {
            angle: 90.0,
            background: crate::domain::entities::Color::BLACK,
        }, Operation::Grayscale];
        let out = render(&spec(ImageFormat::Png, None, ops), &png(20, 10));
        assert_eq!(out.dimensions(), (10, 20));
        assert_eq!(out.color().channel_count(), 1);
    }

    #[test]
    fn test_undecodable_source() {
        let result = ImageRsEngine::new().render(
            &spec(ImageFormat::Png, None, vec![]),
            b"definitely not an image",
            &OperandImages::new(),
        );
        assert!(matches!(result, Err(EngineError::Decode(_))));
    }

    #[test_case(Some(u32::MAX), Some(u32::MAX), FitMode::Fill ; "huge fill box")]
    #[test_case(None, Some(64), FitMode::Cover ; "aspect derived width")]
    #[test_case(Some(64), Some(64), FitMode::Outside ; "outside grows past box")]
    fn test_resize_above_limit_is_rejected(width: Option<u32>, height: Option<u32>, fit: FitMode) {
        let engine = ImageRsEngine::with_limits(128, DEFAULT_MAX_ALLOC);
        let stage = ResizeStage { fit, width, height };
        let result = engine.render(&spec(ImageFormat::Png, Some(stage), vec![]), &png(40, 4), &OperandImages::new());
        assert!(matches!(result, Err(EngineError::InvalidInput(m)) if m.contains("pixel limit")));
    }

    #[test]
    fn test_source_above_limits() {
        let engine = ImageRsEngine::with_limits(16, DEFAULT_MAX_ALLOC);
        let result = engine.render(&spec(ImageFormat::Png, None, vec![]), &png(32, 8), &OperandImages::new());
        assert!(matches!(result, Err(EngineError::Decode(_))));
    }

    #[test]
    fn test_boolean_requires_operand() {
        let op = Operation::Boolean {
            operand: "https://img.test/mask.png".into(),
            operator: BooleanOperator::Or,
        };
        let engine = ImageRsEngine::new();
        let source = png(8, 8);
        let missing = engine.render(&spec(ImageFormat::Png, None, vec![op.clone()]), &source, &OperandImages::new());
        assert!(matches!(missing, Err(EngineError::InvalidInput(_))));

        let operands = OperandImages::from([("https://img.test/mask.png".to_string(), png(4, 4))]);
        assert!(engine.render(&spec(ImageFormat::Png, None, vec![op]), &source, &operands).is_ok());
    }
}
