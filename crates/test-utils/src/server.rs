//! Local HTTP servers for network-facing tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::generators::{corrupt_png, tile_png};

/// Serve `router` on an ephemeral localhost port and return its base URL.
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}

/// Behaviour of the mock tile server, shared with the test body.
#[derive(Debug, Default)]
pub struct TileServerState {
    /// Number of tile requests received.
    pub hits: AtomicUsize,
    /// Tiles answered with HTTP 404, as (col, row, zoom).
    pub missing: Mutex<HashSet<(i64, i64, u32)>>,
    /// Tiles answered with undecodable bytes.
    pub corrupt: Mutex<HashSet<(i64, i64, u32)>>,
    /// User agent and referer of the last request.
    pub last_headers: Mutex<Option<(String, String)>>,
    /// Edge of the generated tiles in pixels.
    pub tile_size: AtomicUsize,
}

impl TileServerState {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn fail(&self, col: i64, row: i64, zoom: u32) {
        self.missing
            .lock()
            .expect("tile server lock")
            .insert((col, row, zoom));
    }

    pub fn corrupt(&self, col: i64, row: i64, zoom: u32) {
        self.corrupt
            .lock()
            .expect("tile server lock")
            .insert((col, row, zoom));
    }
}

async fn serve_tile(
    State(state): State<Arc<TileServerState>>,
    Path((zoom, col, row)): Path<(u32, i64, String)>,
    headers: HeaderMap,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);

    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    *state.last_headers.lock().expect("tile server lock") =
        Some((header_value(header::USER_AGENT), header_value(header::REFERER)));

    let row: i64 = match row.trim_end_matches(".png").parse() {
        Ok(row) => row,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let key = (col, row, zoom);

    if state.missing.lock().expect("tile server lock").contains(&key) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = if state.corrupt.lock().expect("tile server lock").contains(&key) {
        corrupt_png()
    } else {
        let size = state.tile_size.load(Ordering::SeqCst).max(1) as u32;
        tile_png(col, row, zoom, size)
    };
    ([(header::CONTENT_TYPE, "image/png")], body).into_response()
}

/// Start an XYZ tile server answering `/{z}/{x}/{y}.png`.
///
/// Returns the URL template (with `{Z}`, `{X}`, `{Y}` placeholders) and the
/// shared state used to inject failures and count requests.
pub async fn spawn_tile_server(tile_size: u32) -> (String, Arc<TileServerState>) {
    let state = Arc::new(TileServerState::default());
    state.tile_size.store(tile_size as usize, Ordering::SeqCst);
    let router = Router::new()
        .route("/:z/:x/:y", get(serve_tile))
        .with_state(state.clone());
    let base = spawn_server(router).await;
    (format!("{}/{{Z}}/{{X}}/{{Y}}.png", base), state)
}
