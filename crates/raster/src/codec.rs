//! Tile payload formats.
//!
//! Sources deliver PNG or JPEG for the most part; anything the `image` crate
//! can sniff is accepted on the way in. Encoding is limited to the formats
//! a tile cache or a mosaic export actually writes.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use image::{DynamicImage, ImageFormat, ImageOutputFormat, RgbaImage};
use map_common::{MapError, MapResult};
use serde::{Deserialize, Serialize};

/// JPEG quality used when writing tiles.
const JPEG_QUALITY: u8 = 90;

/// Output format of encoded tiles and mosaics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    #[default]
    Png,
    Jpeg,
}

impl TileFormat {
    /// Parse a layer format as written in source definitions:
    /// `png`, `jpeg`, `jpg` or a mime type such as `image/png`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        let value = value.strip_prefix("image/").unwrap_or(&value);
        match value {
            "png" | "png8" | "png24" | "png32" => Some(TileFormat::Png),
            "jpeg" | "jpg" => Some(TileFormat::Jpeg),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Jpeg => "jpg",
        }
    }

    fn output_format(&self) -> ImageOutputFormat {
        match self {
            TileFormat::Png => ImageOutputFormat::Png,
            TileFormat::Jpeg => ImageOutputFormat::Jpeg(JPEG_QUALITY),
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TileFormat {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TileFormat::parse(s)
            .ok_or_else(|| MapError::Configuration(format!("unsupported tile format '{}'", s)))
    }
}

/// Cheap check on the leading bytes, no decoding.
pub fn is_image(data: &[u8]) -> bool {
    image::guess_format(data).is_ok()
}

/// Sniffed container format, if any.
pub fn sniff(data: &[u8]) -> Option<ImageFormat> {
    image::guess_format(data).ok()
}

/// Decode a tile payload to RGBA.
pub fn decode(data: &[u8]) -> MapResult<RgbaImage> {
    image::load_from_memory(data)
        .map(|img| img.to_rgba8())
        .map_err(|e| MapError::CorruptData(e.to_string()))
}

/// Encode an RGBA buffer. JPEG drops the alpha channel.
pub fn encode(img: &RgbaImage, format: TileFormat) -> MapResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let result = match format {
        TileFormat::Png => img.write_to(&mut buf, format.output_format()),
        TileFormat::Jpeg => DynamicImage::ImageRgba8(img.clone())
            .to_rgb8()
            .write_to(&mut buf, format.output_format()),
    };
    result.map_err(|e| MapError::Image(format!("{} encoding failed: {}", format, e)))?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use test_utils::{corrupt_png, tile_color, tile_png};

    // ============================================================================
    // Format names
    // ============================================================================

    #[test]
    fn test_parse_format_names() {
        assert_eq!(TileFormat::parse("png"), Some(TileFormat::Png));
        assert_eq!(TileFormat::parse("image/jpeg"), Some(TileFormat::Jpeg));
        assert_eq!(TileFormat::parse("JPG"), Some(TileFormat::Jpeg));
        assert_eq!(TileFormat::parse("image/webp"), None);
        assert!("tiff".parse::<TileFormat>().is_err());
    }

    // ============================================================================
    // Decoding
    // ============================================================================

    #[test]
    fn test_decode_generated_tile() {
        let img = decode(&tile_png(4, 2, 1, 8)).unwrap();
        assert_eq!(img.dimensions(), (8, 8));
        assert_eq!(img.get_pixel(0, 0).0, tile_color(4, 2, 1));
    }

    #[test]
    fn test_corrupt_payload() {
        let data = corrupt_png();
        // The signature is valid, the body is not
        assert!(is_image(&data));
        assert!(matches!(decode(&data), Err(MapError::CorruptData(_))));
    }

    #[test]
    fn test_html_error_page_is_not_an_image() {
        assert!(!is_image(b"<html><body>404</body></html>"));
        assert!(sniff(b"").is_none());
    }

    // ============================================================================
    // Encoding
    // ============================================================================

    #[test]
    fn test_encode_png_keeps_alpha() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 0]));
        let data = encode(&img, TileFormat::Png).unwrap();
        assert_eq!(sniff(&data), Some(ImageFormat::Png));
        assert_eq!(decode(&data).unwrap().get_pixel(1, 1).0, [10, 20, 30, 0]);
    }

    #[test]
    fn test_encode_jpeg() {
        let img = RgbaImage::from_pixel(16, 16, Rgba([200, 100, 50, 255]));
        let data = encode(&img, TileFormat::Jpeg).unwrap();
        assert_eq!(sniff(&data), Some(ImageFormat::Jpeg));
        assert_eq!(decode(&data).unwrap().dimensions(), (16, 16));
    }
}
