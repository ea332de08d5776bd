//! Output formats and resize fit modes.

use std::fmt;

/// Image formats a descriptor may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// JPEG.
    Jpeg,
    /// PNG.
    Png,
    /// WebP.
    Webp,
    /// GIF.
    Gif,
    /// JPEG 2000.
    Jp2,
    /// TIFF.
    Tiff,
    /// AVIF.
    Avif,
    /// HEIF.
    Heif,
    /// Raw pixel data.
    Raw,
}

impl ImageFormat {
    /// All formats in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Jpeg,
        Self::Png,
        Self::Webp,
        Self::Gif,
        Self::Jp2,
        Self::Tiff,
        Self::Avif,
        Self::Heif,
        Self::Raw,
    ];

    /// Parses a format name. `jpg` is accepted as an alias of `jpeg`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "gif" => Some(Self::Gif),
            "jp2" => Some(Self::Jp2),
            "tiff" => Some(Self::Tiff),
            "avif" => Some(Self::Avif),
            "heif" => Some(Self::Heif),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }

    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Jp2 => "jp2",
            Self::Tiff => "tiff",
            Self::Avif => "avif",
            Self::Heif => "heif",
            Self::Raw => "raw",
        }
    }

    /// `Content-Type` value for responses in this format.
    #[must_use]
    pub fn content_type(self) -> String {
        format!("image/{}", self.as_str())
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a resized image fits the requested box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FitMode {
    /// Crop to cover both dimensions.
    #[default]
    Cover,
    /// Letterbox inside both dimensions.
    Contain,
    /// Stretch to exactly the given dimensions.
    Fill,
    /// Shrink to fit inside, preserving aspect ratio.
    Inside,
    /// Grow to cover, preserving aspect ratio, no crop.
    Outside,
}

impl FitMode {
    /// Accepted keywords, for error messages.
    pub const NAMES: &'static str = "cover, contain, fill, inside, outside";

    /// Parses a fit keyword.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cover" => Some(Self::Cover),
            "contain" => Some(Self::Contain),
            "fill" => Some(Self::Fill),
            "inside" => Some(Self::Inside),
            "outside" => Some(Self::Outside),
            _ => None,
        }
    }

    /// Canonical keyword.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cover => "cover",
            Self::Contain => "contain",
            Self::Fill => "fill",
            Self::Inside => "inside",
            Self::Outside => "outside",
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
