//! Request URLs for TMS, WMS and WMTS sources.

use map_common::{AxisOrder, MapResult, TileAddress};
use raster::TileFormat;
use tile_grid::TileMatrix;

use crate::config::{LayerDefinition, ServiceKind, SourceDefinition};

/// URL of tile `tile`, expressed in the source grid `tm`.
pub fn build_url(
    source: &SourceDefinition,
    layer: &LayerDefinition,
    tm: &TileMatrix,
    tile: &TileAddress,
) -> MapResult<String> {
    let url = match source.service {
        ServiceKind::Tms => tms_url(source, layer, tile),
        ServiceKind::Wmts => {
            let params = [
                ("SERVICE", "WMTS".to_string()),
                ("VERSION", source.version().to_string()),
                ("REQUEST", "GetTile".to_string()),
                ("LAYER", layer.url_key.clone()),
                ("STYLE", layer.style.clone()),
                ("FORMAT", mime_type(layer)),
                ("TILEMATRIXSET", source.matrix.clone().unwrap_or_default()),
                ("TILEMATRIX", tile.zoom.to_string()),
                ("TILEROW", tile.row.to_string()),
                ("TILECOL", tile.col.to_string()),
            ];
            with_query(&source.url, &params)
        }
        ServiceKind::Wms => {
            let version = source.version();
            let crs_param = if version.starts_with("1.3") { "CRS" } else { "SRS" };
            let swap = tm.crs().wms_axis_order(version) == AxisOrder::LatLon;
            let bbox = tm.get_tile_bbox(tile.col, tile.row, tile.zoom);
            let size = tm.tile_size().to_string();
            let params = [
                ("SERVICE", "WMS".to_string()),
                ("VERSION", version.to_string()),
                ("REQUEST", "GetMap".to_string()),
                ("LAYERS", layer.url_key.clone()),
                ("STYLES", layer.style.clone()),
                ("FORMAT", mime_type(layer)),
                ("TRANSPARENT", "FALSE".to_string()),
                (crs_param, tm.crs().to_string()),
                ("WIDTH", size.clone()),
                ("HEIGHT", size),
                ("BBOX", bbox.to_query_string(swap)),
            ];
            with_query(&source.url, &params)
        }
    };
    Ok(url)
}

fn tms_url(source: &SourceDefinition, layer: &LayerDefinition, tile: &TileAddress) -> String {
    let url = source.url.replace("{LAY}", &layer.url_key);
    if source.quadkey {
        url.replace("{QUADKEY}", &tile.quadkey())
    } else {
        url.replace("{X}", &tile.col.to_string())
            .replace("{Y}", &tile.row.to_string())
            .replace("{Z}", &tile.zoom.to_string())
    }
}

fn mime_type(layer: &LayerDefinition) -> String {
    match TileFormat::parse(&layer.format) {
        Some(format) if !layer.format.contains('/') => format.mime_type().to_string(),
        _ => layer.format.clone(),
    }
}

/// Append `params` to `base`, adding the `?` or `&` separator it lacks.
fn with_query(base: &str, params: &[(&str, String)]) -> String {
    let base = base.trim();
    let mut url = String::with_capacity(base.len() + 256);
    url.push_str(base);
    if !url.contains('?') {
        url.push('?');
    } else if !url.ends_with('?') && !url.ends_with('&') {
        url.push('&');
    }
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    url.push_str(&query.join("&"));
    url
}
