//! Typed, validated transform pipeline.
//!
//! Built from a [`RequestDescriptor`](super::RequestDescriptor) before any
//! I/O happens. Every operation carries its own parameter record, so the
//! engine adapter never sees a raw name or an untyped option map.

use super::format::{FitMode, ImageFormat};

/// Largest width or height a pipeline may produce, in pixels.
pub const MAX_DIMENSION: u32 = 16_384;

/// RGBA color with 8-bit channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    /// Red.
    pub r: u8,
    /// Green.
    pub g: u8,
    /// Blue.
    pub b: u8,
    /// Alpha.
    pub a: u8,
}

impl Color {
    /// Opaque black.
    pub const BLACK: Self = Self::rgb(0, 0, 0);

    /// Creates an opaque color.
    #[must_use]
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// Parses `#rgb`, `#rrggbb` or `#rrggbbaa` (leading `#` optional).
    #[must_use]
    pub fn from_hex(raw: &str) -> Option<Self> {
        let hex = raw.strip_prefix('#').unwrap_or(raw);
        let channel = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            3 => {
                let mut digits = hex.chars().map(|c| c.to_digit(16));
                let mut next = || digits.next().flatten().map(|d| (d * 17) as u8);
                Some(Self::rgb(next()?, next()?, next()?))
            }
            6 | 8 => {
                let a = if hex.len() == 8 { channel(hex.get(6..8)?)? } else { 255 };
                Some(Self {
                    r: channel(hex.get(0..2)?)?,
                    g: channel(hex.get(2..4)?)?,
                    b: channel(hex.get(4..6)?)?,
                    a,
                })
            }
            _ => None,
        }
    }
}

/// Colour interpretation for `toColorspace`/`pipelineColorspace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    /// Standard RGB.
    Srgb,
    /// Single luminance channel.
    BW,
    /// 16-bit RGB.
    Rgb16,
    /// 16-bit luminance.
    Grey16,
}

impl Colorspace {
    /// Parses a colorspace keyword.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "srgb" | "rgb" => Some(Self::Srgb),
            "b-w" | "bw" | "grey" | "gray" => Some(Self::BW),
            "rgb16" => Some(Self::Rgb16),
            "grey16" | "gray16" => Some(Self::Grey16),
            _ => None,
        }
    }
}

/// Channel selector for `extractChannel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Red.
    Red,
    /// Green.
    Green,
    /// Blue.
    Blue,
    /// Alpha.
    Alpha,
}

impl Channel {
    /// Parses a channel name or index.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "red" | "0" => Some(Self::Red),
            "green" | "1" => Some(Self::Green),
            "blue" | "2" => Some(Self::Blue),
            "alpha" | "3" => Some(Self::Alpha),
            _ => None,
        }
    }

    /// Index into an RGBA pixel.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Red => 0,
            Self::Green => 1,
            Self::Blue => 2,
            Self::Alpha => 3,
        }
    }
}

/// Bitwise operator for `boolean`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanOperator {
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise exclusive or.
    Eor,
}

impl BooleanOperator {
    /// Parses an operator keyword.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            "eor" | "xor" => Some(Self::Eor),
            _ => None,
        }
    }

    /// Applies the operator to one channel value.
    #[must_use]
    pub const fn apply(self, a: u8, b: u8) -> u8 {
        match self {
            Self::And => a & b,
            Self::Or => a | b,
            Self::Eor => a ^ b,
        }
    }
}

/// Square convolution kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    /// Kernel width.
    pub width: u32,
    /// Kernel height.
    pub height: u32,
    /// Row-major weights, `width * height` long.
    pub weights: Vec<f32>,
    /// Divisor applied to the weighted sum.
    pub scale: f32,
    /// Offset added after scaling.
    pub offset: f32,
}

/// Resize stage parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeStage {
    /// Fit mode.
    pub fit: FitMode,
    /// Target width.
    pub width: Option<u32>,
    /// Target height.
    pub height: Option<u32>,
}

/// Encoder stage parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputStage {
    /// Target format.
    pub format: ImageFormat,
    /// Lossy quality, 1..=100.
    pub quality: Option<u8>,
    /// AVIF encoder speed, 1..=10.
    pub speed: Option<u8>,
}

/// One pipeline operation with its typed parameters.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Operation {
    Negate { alpha: bool },
    Clahe { width: u32, height: u32, max_slope: u32 },
    Convolve(Kernel),
    Modulate { brightness: f32, saturation: f32, hue: f32, lightness: f32 },
    Flip,
    Flop,
    Normalize,
    Grayscale,
    RemoveAlpha,
    Rotate { angle: f32, background: Color },
    Threshold { threshold: u8, grayscale: bool },
    Boolean { operand: String, operator: BooleanOperator },
    Linear { a: f32, b: f32 },
    Recomb([[f32; 3]; 3]),
    Sharpen { sigma: Option<f32>, flat: f32, jagged: f32 },
    Median { size: u32 },
    Blur { sigma: Option<f32> },
    Flatten { background: Color },
    Gamma { gamma: f32, gamma_out: f32 },
    Tint(Color),
    PipelineColorspace(Colorspace),
    ToColorspace(Colorspace),
    EnsureAlpha { alpha: f32 },
    ExtractChannel(Channel),
}

impl Operation {
    /// Canonical operation name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Negate { .. } => "negate",
            Self::Clahe { .. } => "clahe",
            Self::Convolve(_) => "convolve",
            Self::Modulate { .. } => "modulate",
            Self::Flip => "flip",
            Self::Flop => "flop",
            Self::Normalize => "normalize",
            Self::Grayscale => "grayscale",
            Self::RemoveAlpha => "removeAlpha",
            Self::Rotate { .. } => "rotate",
            Self::Threshold { .. } => "threshold",
            Self::Boolean { .. } => "boolean",
            Self::Linear { .. } => "linear",
            Self::Recomb(_) => "recomb",
            Self::Sharpen { .. } => "sharpen",
            Self::Median { .. } => "median",
            Self::Blur { .. } => "blur",
            Self::Flatten { .. } => "flatten",
            Self::Gamma { .. } => "gamma",
            Self::Tint(_) => "tint",
            Self::PipelineColorspace(_) => "pipelineColorspace",
            Self::ToColorspace(_) => "toColorspace",
            Self::EnsureAlpha { .. } => "ensureAlpha",
            Self::ExtractChannel(_) => "extractChannel",
        }
    }
}

/// Ordered, validated call sequence for the image engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    /// Applied first when present.
    pub resize: Option<ResizeStage>,
    /// Output encoding.
    pub output: OutputStage,
    /// Applied in order after resize.
    pub operations: Vec<Operation>,
}

impl PipelineSpec {
    /// URLs of secondary images referenced by `boolean` operations.
    #[must_use]
    pub fn operand_urls(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = self
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Boolean { operand, .. } => Some(operand.as_str()),
                _ => None,
            })
            .collect();
        urls.sort_unstable();
        urls.dedup();
        urls
    }
}
