//! Image reprojection.
//!
//! Transforming every destination pixel through the reprojection backend is
//! too slow for the remote engine, so only a control grid of pixel centres
//! (every [`CONTROL_STEP`] pixels plus the last row and column) is sent in a
//! single batch. Source positions of the remaining pixels are interpolated
//! bilinearly inside each grid cell, then sampled on the rayon pool.

use std::time::Instant;

use image::{Rgba, RgbaImage};
use map_common::{BoundingBox, MapError, MapResult};
use projection::Reproj;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::geoimage::{GeoImage, TRANSPARENT};

/// Spacing of the control grid in destination pixels.
pub const CONTROL_STEP: u32 = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    Nearest,
    #[default]
    Bilinear,
}

/// Shape and georeferencing of a warped image, north-up with square pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarpTarget {
    pub origin: (f64, f64),
    pub width: u32,
    pub height: u32,
    pub res: f64,
}

impl WarpTarget {
    pub fn new(origin: (f64, f64), width: u32, height: u32, res: f64) -> Self {
        Self {
            origin,
            width,
            height,
            res,
        }
    }

    /// Target covering `bbox` with about as many pixels as `pixel_count`.
    pub fn covering(bbox: &BoundingBox, pixel_count: u64) -> MapResult<Self> {
        if !bbox.is_valid() || pixel_count == 0 {
            return Err(MapError::Image(format!(
                "cannot derive a raster for extent {:?}",
                bbox
            )));
        }
        let res = (bbox.width() * bbox.height() / pixel_count as f64).sqrt();
        let width = (bbox.width() / res).ceil().max(1.0) as u32;
        let height = (bbox.height() / res).ceil().max(1.0) as u32;
        Ok(Self::new((bbox.min_x, bbox.max_y), width, height, res))
    }

    fn centre(&self, px: u32, py: u32) -> (f64, f64) {
        (
            self.origin.0 + (px as f64 + 0.5) * self.res,
            self.origin.1 - (py as f64 + 0.5) * self.res,
        )
    }
}

/// Warp `src` onto `target`.
///
/// `reproj` goes from the target CRS to the CRS of `src`. Target pixels whose
/// source position falls outside `src` stay fully transparent.
#[instrument(skip(src, reproj), fields(src_crs = %reproj.dst(), dst_crs = %reproj.src()))]
pub async fn reproject(
    src: GeoImage,
    reproj: &Reproj,
    target: WarpTarget,
    resampling: Resampling,
) -> MapResult<GeoImage> {
    if target.width == 0 || target.height == 0 || !(target.res > 0.0) {
        return Err(MapError::Image(format!("invalid warp target {:?}", target)));
    }
    let start = Instant::now();

    let cols = control_positions(target.width);
    let rows = control_positions(target.height);
    let nodes: Vec<(f64, f64)> = rows
        .iter()
        .flat_map(|&py| cols.iter().map(move |&px| target.centre(px, py)))
        .collect();
    let nodes = reproj.points(&nodes).await?;
    let grid = ControlGrid { cols, rows, nodes };

    let img = tokio::task::spawn_blocking(move || sample_all(&src, &grid, &target, resampling))
        .await
        .map_err(|e| MapError::Image(format!("warp task failed: {}", e)))?;

    debug!(
        width = target.width,
        height = target.height,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Image reprojected"
    );
    Ok(GeoImage::new(
        img,
        target.origin,
        (target.res, -target.res),
    ))
}

/// Warp `src` into another CRS, keeping roughly the same pixel count.
///
/// `forward` maps the CRS of `src` to the output CRS and `inverse` maps it
/// back; the output extent is the envelope of the reprojected source corners.
pub async fn reproject_to(
    src: GeoImage,
    forward: &Reproj,
    inverse: &Reproj,
    resampling: Resampling,
) -> MapResult<GeoImage> {
    let extent = forward.bbox(&src.bbox()).await?;
    let pixels = src.width() as u64 * src.height() as u64;
    let target = WarpTarget::covering(&extent, pixels)?;
    reproject(src, inverse, target, resampling).await
}

fn control_positions(len: u32) -> Vec<u32> {
    let mut positions: Vec<u32> = (0..len).step_by(CONTROL_STEP as usize).collect();
    if positions.last() != Some(&(len - 1)) {
        positions.push(len - 1);
    }
    positions
}

/// Source coordinates of destination pixel centres at the control positions,
/// stored row-major.
struct ControlGrid {
    cols: Vec<u32>,
    rows: Vec<u32>,
    nodes: Vec<(f64, f64)>,
}

impl ControlGrid {
    fn source_coord(&self, px: u32, py: u32) -> (f64, f64) {
        let (i, tx) = locate(&self.cols, px);
        let (j, ty) = locate(&self.rows, py);
        let ncols = self.cols.len();
        let i1 = (i + 1).min(ncols - 1);
        let j1 = (j + 1).min(self.rows.len() - 1);

        let p00 = self.nodes[j * ncols + i];
        let p10 = self.nodes[j * ncols + i1];
        let p01 = self.nodes[j1 * ncols + i];
        let p11 = self.nodes[j1 * ncols + i1];

        let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;
        let top = (lerp(p00.0, p10.0, tx), lerp(p00.1, p10.1, tx));
        let bottom = (lerp(p01.0, p11.0, tx), lerp(p01.1, p11.1, tx));
        (lerp(top.0, bottom.0, ty), lerp(top.1, bottom.1, ty))
    }
}

/// Cell index and fractional position of `p` along the control positions.
fn locate(positions: &[u32], p: u32) -> (usize, f64) {
    if positions.len() < 2 {
        return (0, 0.0);
    }
    let i = ((p / CONTROL_STEP) as usize).min(positions.len() - 2);
    let (a, b) = (positions[i], positions[i + 1]);
    (i, (p - a) as f64 / (b - a) as f64)
}

fn sample_all(
    src: &GeoImage,
    grid: &ControlGrid,
    target: &WarpTarget,
    resampling: Resampling,
) -> RgbaImage {
    let width = target.width as usize;
    let mut buf = vec![0u8; width * target.height as usize * 4];

    buf.par_chunks_mut(width * 4)
        .enumerate()
        .for_each(|(py, row)| {
            for (px, out) in row.chunks_exact_mut(4).enumerate() {
                let (x, y) = grid.source_coord(px as u32, py as u32);
                let color = if x.is_finite() && y.is_finite() {
                    let (u, v) = src.geo_to_pixel(x, y);
                    sample(src.image(), u, v, resampling).unwrap_or(TRANSPARENT)
                } else {
                    TRANSPARENT
                };
                out.copy_from_slice(&color.0);
            }
        });

    RgbaImage::from_raw(target.width, target.height, buf)
        .unwrap_or_else(|| RgbaImage::new(target.width, target.height))
}

/// Sample `img` at continuous pixel position `(u, v)`, where pixel `i` spans
/// `[i, i + 1)`. `None` outside the image.
fn sample(img: &RgbaImage, u: f64, v: f64, resampling: Resampling) -> Option<Rgba<u8>> {
    let (w, h) = img.dimensions();
    if !(u >= 0.0 && v >= 0.0 && u < w as f64 && v < h as f64) {
        return None;
    }
    match resampling {
        Resampling::Nearest => Some(*img.get_pixel(u as u32, v as u32)),
        Resampling::Bilinear => {
            let cx = (u - 0.5).clamp(0.0, (w - 1) as f64);
            let cy = (v - 0.5).clamp(0.0, (h - 1) as f64);
            let (x0, y0) = (cx.floor() as u32, cy.floor() as u32);
            let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
            let (tx, ty) = (cx - x0 as f64, cy - y0 as f64);

            let (p00, p10) = (img.get_pixel(x0, y0).0, img.get_pixel(x1, y0).0);
            let (p01, p11) = (img.get_pixel(x0, y1).0, img.get_pixel(x1, y1).0);
            let mut out = [0u8; 4];
            for c in 0..4 {
                let top = p00[c] as f64 * (1.0 - tx) + p10[c] as f64 * tx;
                let bottom = p01[c] as f64 * (1.0 - tx) + p11[c] as f64 * tx;
                out[c] = (top * (1.0 - ty) + bottom * ty).round().clamp(0.0, 255.0) as u8;
            }
            Some(Rgba(out))
        }
    }
}
