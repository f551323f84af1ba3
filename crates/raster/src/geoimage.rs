//! Georeferenced RGBA buffer.
//!
//! Georeferencing follows the pixel-corner convention: `origin` is the outer
//! upper-left corner of pixel (0, 0) and `res` is the signed pixel size, so a
//! north-up image has a negative `res.1`.

use image::{imageops, Rgba, RgbaImage};
use map_common::{BoundingBox, MapError, MapResult};

use crate::codec::{self, TileFormat};

/// Mosaic background where no tile has been pasted.
pub const BACKGROUND: Rgba<u8> = Rgba([128, 128, 128, 255]);

/// Filler for tiles that could not be obtained.
pub const EMPTY_TILE: Rgba<u8> = Rgba([255, 192, 203, 255]);

/// Filler for tiles whose bytes do not decode.
pub const CORRUPT_TILE: Rgba<u8> = Rgba([255, 0, 0, 255]);

/// No data; left where nothing can be sampled.
pub const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

#[derive(Debug, Clone, PartialEq)]
pub struct GeoImage {
    img: RgbaImage,
    origin: (f64, f64),
    res: (f64, f64),
}

impl GeoImage {
    pub fn new(img: RgbaImage, origin: (f64, f64), res: (f64, f64)) -> Self {
        Self { img, origin, res }
    }

    /// North-up image of `width` x `height` pixels filled with `color`.
    pub fn filled(
        width: u32,
        height: u32,
        color: Rgba<u8>,
        origin: (f64, f64),
        res: f64,
    ) -> MapResult<Self> {
        if width == 0 || height == 0 {
            return Err(MapError::Image(format!(
                "cannot allocate an empty {}x{} image",
                width, height
            )));
        }
        if !(res.is_finite() && res > 0.0) {
            return Err(MapError::Image(format!("invalid pixel size {}", res)));
        }
        Ok(Self {
            img: RgbaImage::from_pixel(width, height, color),
            origin,
            res: (res, -res),
        })
    }

    pub fn width(&self) -> u32 {
        self.img.width()
    }

    pub fn height(&self) -> u32 {
        self.img.height()
    }

    pub fn origin(&self) -> (f64, f64) {
        self.origin
    }

    pub fn res(&self) -> (f64, f64) {
        self.res
    }

    pub fn image(&self) -> &RgbaImage {
        &self.img
    }

    pub fn into_image(self) -> RgbaImage {
        self.img
    }

    /// Geographic extent covered by the pixels.
    pub fn bbox(&self) -> BoundingBox {
        let (x0, y0) = self.origin;
        let x1 = x0 + self.width() as f64 * self.res.0;
        let y1 = y0 + self.height() as f64 * self.res.1;
        BoundingBox::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    /// Coordinate of the upper-left corner of pixel `(px, py)`.
    /// Fractional values address points inside the pixel.
    pub fn pixel_to_geo(&self, px: f64, py: f64) -> (f64, f64) {
        (
            self.origin.0 + px * self.res.0,
            self.origin.1 + py * self.res.1,
        )
    }

    /// Continuous pixel position of a coordinate.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin.0) / self.res.0,
            (y - self.origin.1) / self.res.1,
        )
    }

    pub fn pixel(&self, px: u32, py: u32) -> Option<Rgba<u8>> {
        if px < self.width() && py < self.height() {
            Some(*self.img.get_pixel(px, py))
        } else {
            None
        }
    }

    /// Copy `tile` with its upper-left pixel at `(x, y)`; parts falling
    /// outside the image are clipped.
    pub fn paste(&mut self, tile: &RgbaImage, x: i64, y: i64) {
        imageops::replace(&mut self.img, tile, x, y);
    }

    /// Fill a `width` x `height` block at `(x, y)`, clipped to the image.
    pub fn fill_rect(&mut self, x: i64, y: i64, width: u32, height: u32, color: Rgba<u8>) {
        let x0 = x.clamp(0, self.width() as i64) as u32;
        let y0 = y.clamp(0, self.height() as i64) as u32;
        let x1 = (x + width as i64).clamp(0, self.width() as i64) as u32;
        let y1 = (y + height as i64).clamp(0, self.height() as i64) as u32;
        for py in y0..y1 {
            for px in x0..x1 {
                self.img.put_pixel(px, py, color);
            }
        }
    }

    /// ESRI world file content.
    ///
    /// World files reference the centre of the upper-left pixel, unlike the
    /// corner origin stored here.
    pub fn world_file(&self) -> String {
        let (rx, ry) = self.res;
        let (cx, cy) = self.pixel_to_geo(0.5, 0.5);
        format!("{}\n0\n0\n{}\n{}\n{}\n", rx, ry, cx, cy)
    }

    pub fn encode(&self, format: TileFormat) -> MapResult<Vec<u8>> {
        codec::encode(&self.img, format)
    }
}
