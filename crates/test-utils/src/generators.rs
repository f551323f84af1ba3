//! Synthetic tile images.
//!
//! Tiles are solid colour squares whose colour is derived from their
//! address, which lets a test find out which tile ended up at which offset
//! of a mosaic by sampling a single pixel.

use std::io::Cursor;

use image::{ImageOutputFormat, Rgba, RgbaImage};

/// Colour for the tile at (col, row, zoom).
///
/// The alpha channel is always 255 and the blue channel never reaches 203,
/// so tile colours never collide with the grey, pink or red fillers.
pub fn tile_color(col: i64, row: i64, zoom: u32) -> [u8; 4] {
    [
        (col.rem_euclid(200) + 20) as u8,
        (row.rem_euclid(200) + 20) as u8,
        (zoom % 100) as u8,
        255,
    ]
}

/// Encode a solid square image of `size` pixels as PNG.
pub fn solid_png(size: u32, color: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(size, size, Rgba(color));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageOutputFormat::Png)
        .expect("PNG encoding of an in-memory image cannot fail");
    buf.into_inner()
}

/// PNG for the tile at (col, row, zoom), coloured with [`tile_color`].
pub fn tile_png(col: i64, row: i64, zoom: u32, size: u32) -> Vec<u8> {
    solid_png(size, tile_color(col, row, zoom))
}

/// Bytes that look like a PNG header but do not decode.
pub fn corrupt_png() -> Vec<u8> {
    let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend_from_slice(b"definitely not an image");
    data
}
