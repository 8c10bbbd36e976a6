//! Shared request DTOs.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::CaptureError;

pub const MIN_DIMENSION: u32 = 1;
pub const MAX_DIMENSION: u32 = 4096;

/// Output image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }

    /// File extension; identical to the wire name for all supported formats.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Encoder quality hint. PNG is lossless and takes none.
    pub fn quality(&self) -> Option<u32> {
        match self {
            ImageFormat::Png => None,
            ImageFormat::Jpeg | ImageFormat::Webp => Some(90),
        }
    }
}

impl FromStr for ImageFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_format() -> ImageFormat {
    ImageFormat::Png
}

/// A single screenshot request, shared by the single-shot and batch paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub url: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_format")]
    pub format: ImageFormat,
}

impl CaptureRequest {
    /// Validate ranges and URL shape. No resources are acquired before this
    /// passes.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&self.width) {
            return Err(CaptureError::validation(format!(
                "width {} out of range [{MIN_DIMENSION}, {MAX_DIMENSION}]",
                self.width
            )));
        }
        if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&self.height) {
            return Err(CaptureError::validation(format!(
                "height {} out of range [{MIN_DIMENSION}, {MAX_DIMENSION}]",
                self.height
            )));
        }
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| CaptureError::validation(format!("invalid url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CaptureError::validation(format!(
                "unsupported url scheme {:?}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none() {
            return Err(CaptureError::validation("url has no host"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(url: &str, width: u32, height: u32) -> CaptureRequest {
        CaptureRequest {
            url: url.to_string(),
            width,
            height,
            format: ImageFormat::Png,
        }
    }

    #[test]
    fn accepts_dimension_bounds() {
        assert!(req("https://example.com", 1, 1).validate().is_ok());
        assert!(req("https://example.com", 4096, 4096).validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_dimensions() {
        assert!(req("https://example.com", 0, 720).validate().is_err());
        assert!(req("https://example.com", 1280, 4097).validate().is_err());
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(req("ftp://example.com", 100, 100).validate().is_err());
        assert!(req("file:///etc/passwd", 100, 100).validate().is_err());
        assert!(req("nonsense", 100, 100).validate().is_err());
    }

    #[test]
    fn format_parsing_accepts_jpg_alias() {
        assert_eq!("jpg".parse::<ImageFormat>(), Ok(ImageFormat::Jpeg));
        assert_eq!("WEBP".parse::<ImageFormat>(), Ok(ImageFormat::Webp));
        assert!("gif".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn request_defaults_fill_in() {
        let r: CaptureRequest =
            serde_json::from_str(r#"{"url": "https://example.com"}"#).unwrap();
        assert_eq!(r.width, 1280);
        assert_eq!(r.height, 720);
        assert_eq!(r.format, ImageFormat::Png);
    }
}
