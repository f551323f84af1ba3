//! GeoPackage cache against real SQLite files.

use std::collections::HashSet;
use std::path::Path;

use bytes::Bytes;
use chrono::Duration;
use map_common::{BoundingBox, Crs, MapError, TileAddress};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use storage::{GeoPackage, MatrixSet, APPLICATION_ID, QUERY_CHUNK_SIZE};
use tempfile::TempDir;
use test_utils::tile_png;
use tile_grid::{GridDefinition, TileMatrix};

fn matrix_set() -> MatrixSet {
    let def = GridDefinition::new("g", Crs::epsg(3857), BoundingBox::new(0.0, 0.0, 1024.0, 512.0))
        .with_progression(2.0, 2.0, 3);
    MatrixSet::try_from(&TileMatrix::new(&def).unwrap()).unwrap()
}

async fn raw(path: &Path) -> SqliteConnection {
    SqliteConnection::connect_with(&SqliteConnectOptions::new().filename(path))
        .await
        .unwrap()
}

fn tile(col: i64, row: i64, zoom: u32) -> TileAddress {
    TileAddress::new(col, row, zoom)
}

// ============================================================================
// Creation and validation
// ============================================================================

#[tokio::test]
async fn test_create_writes_catalog_rows() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("OSM_MAPNIK_WM.gpkg");
    let cache = GeoPackage::open(&path, &matrix_set()).await.unwrap();
    assert_eq!(cache.name(), "OSM_MAPNIK_WM");

    let mut conn = raw(&path).await;
    let app_id: i64 = sqlx::query_scalar("PRAGMA application_id")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(app_id, APPLICATION_ID);

    let (srs_name, org): (String, String) =
        sqlx::query_as("SELECT srs_name, organization FROM gpkg_spatial_ref_sys WHERE srs_id = 3857")
            .fetch_one(&mut conn)
            .await
            .unwrap();
    assert_eq!((srs_name.as_str(), org.as_str()), ("EPSG:3857", "EPSG"));

    let (identifier, max_x): (String, f64) =
        sqlx::query_as("SELECT identifier, max_x FROM gpkg_contents WHERE table_name = 'gpkg_tiles'")
            .fetch_one(&mut conn)
            .await
            .unwrap();
    assert_eq!(identifier, "OSM_MAPNIK_WM");
    assert_eq!(max_x, 1024.0);
    conn.close().await.unwrap();

    let levels = cache.matrix_levels().await.unwrap();
    assert_eq!(levels.len(), 3);
    // 512 units per tile at level 0
    assert_eq!((levels[0].matrix_width, levels[0].matrix_height), (2, 1));
    assert_eq!((levels[2].matrix_width, levels[2].matrix_height), (8, 4));
    assert_eq!(levels[2].pixel_x_size, 0.5);
    assert_eq!(levels[2].tile_width, 256);
}

#[tokio::test]
async fn test_reopen_keeps_tiles_and_catalog() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.gpkg");
    let cache = GeoPackage::open(&path, &matrix_set()).await.unwrap();
    cache.put_tile(&tile(0, 0, 0), b"tile").await.unwrap();

    let reopened = GeoPackage::open(&path, &matrix_set()).await.unwrap();
    assert_eq!(reopened.count_tiles().await.unwrap(), 1);
    assert_eq!(reopened.matrix_levels().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_foreign_file_is_rejected_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.gpkg");
    std::fs::write(&path, b"just some text, not a database").unwrap();

    let err = GeoPackage::open(&path, &matrix_set()).await.unwrap_err();
    assert!(matches!(err, MapError::CacheSchema { .. }), "{:?}", err);
    assert_eq!(std::fs::read(&path).unwrap(), b"just some text, not a database");
}

#[tokio::test]
async fn test_other_sqlite_database_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("other.gpkg");
    let mut conn = SqliteConnection::connect_with(
        &SqliteConnectOptions::new().filename(&path).create_if_missing(true),
    )
    .await
    .unwrap();
    sqlx::query("CREATE TABLE things (id INTEGER)")
        .execute(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();

    match GeoPackage::open(&path, &matrix_set()).await {
        Err(MapError::CacheSchema { path: p, reason }) => {
            assert_eq!(p, path);
            assert!(reason.contains("application id"), "{}", reason);
        }
        other => panic!("expected schema error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_table_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.gpkg");
    GeoPackage::open(&path, &matrix_set()).await.unwrap();

    let mut conn = raw(&path).await;
    sqlx::query("DROP TABLE gpkg_tiles").execute(&mut conn).await.unwrap();
    conn.close().await.unwrap();

    let err = GeoPackage::open(&path, &matrix_set()).await.unwrap_err();
    assert!(matches!(err, MapError::CacheSchema { .. }));
}

// ============================================================================
// Tiles
// ============================================================================

#[tokio::test]
async fn test_put_get_round_trip() {
    let dir = TempDir::new().unwrap();
    let cache = GeoPackage::open(dir.path().join("c.gpkg"), &matrix_set())
        .await
        .unwrap();
    let data = tile_png(1, 2, 3, 4);
    cache.put_tile(&tile(1, 2, 3), &data).await.unwrap();

    assert_eq!(cache.get_tile(&tile(1, 2, 3)).await.unwrap(), Some(Bytes::from(data)));
    assert_eq!(cache.get_tile(&tile(2, 1, 3)).await.unwrap(), None);
}

#[tokio::test]
async fn test_put_replaces_existing_tile() {
    let dir = TempDir::new().unwrap();
    let cache = GeoPackage::open(dir.path().join("c.gpkg"), &matrix_set())
        .await
        .unwrap();
    cache.put_tile(&tile(0, 0, 0), b"old").await.unwrap();
    cache.put_tile(&tile(0, 0, 0), b"new").await.unwrap();
    assert_eq!(cache.count_tiles().await.unwrap(), 1);
    assert_eq!(cache.get_tile(&tile(0, 0, 0)).await.unwrap().unwrap(), &b"new"[..]);
}

#[tokio::test]
async fn test_stale_tiles_are_absent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("c.gpkg");
    let cache = GeoPackage::open(&path, &matrix_set()).await.unwrap();
    cache
        .put_tiles(&[
            (tile(0, 0, 1), Bytes::from_static(b"a")),
            (tile(1, 0, 1), Bytes::from_static(b"b")),
        ])
        .await
        .unwrap();

    let mut conn = raw(&path).await;
    sqlx::query("UPDATE gpkg_tiles SET last_modified = '2001-01-01 00:00:00' WHERE tile_column = 0")
        .execute(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();

    let requested = [tile(0, 0, 1), tile(1, 0, 1)];
    assert_eq!(cache.get_tile(&tile(0, 0, 1)).await.unwrap(), None);
    let records = cache.get_tiles(&requested).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].address, tile(1, 0, 1));
    assert_eq!(
        cache.list_missing_tiles(&requested).await.unwrap(),
        HashSet::from([tile(0, 0, 1)])
    );
    // Still on disk until replaced
    assert_eq!(cache.count_tiles().await.unwrap(), 2);

    // A longer freshness limit brings it back
    let lenient = cache.clone().with_max_age(Duration::days(365 * 100));
    assert_eq!(lenient.get_tiles(&requested).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_list_missing_tiles() {
    let dir = TempDir::new().unwrap();
    let cache = GeoPackage::open(dir.path().join("c.gpkg"), &matrix_set())
        .await
        .unwrap();
    cache.put_tile(&tile(0, 0, 0), b"x").await.unwrap();

    let requested = [tile(0, 0, 0), tile(1, 0, 0)];
    assert_eq!(
        cache.list_missing_tiles(&requested).await.unwrap(),
        HashSet::from([tile(1, 0, 0)])
    );
    assert_eq!(
        cache.list_existing_tiles(&requested).await.unwrap(),
        HashSet::from([tile(0, 0, 0)])
    );
}

#[tokio::test]
async fn test_batches_larger_than_one_chunk() {
    let dir = TempDir::new().unwrap();
    let cache = GeoPackage::open(dir.path().join("c.gpkg"), &matrix_set())
        .await
        .unwrap();

    let n = QUERY_CHUNK_SIZE as i64 * 2 + 17;
    let stored: Vec<_> = (0..n)
        .map(|i| (tile(i, i % 7, 9), Bytes::from(i.to_string())))
        .collect();
    cache.put_tiles(&stored).await.unwrap();

    let mut requested: Vec<_> = stored.iter().map(|(t, _)| *t).collect();
    requested.push(tile(-1, 0, 9));

    let records = cache.get_tiles(&requested).await.unwrap();
    assert_eq!(records.len(), n as usize);
    for record in &records {
        assert_eq!(record.data, Bytes::from(record.address.col.to_string()));
    }
    assert_eq!(
        cache.list_missing_tiles(&requested).await.unwrap(),
        HashSet::from([tile(-1, 0, 9)])
    );

    let deleted = cache.delete_tiles(&requested[..QUERY_CHUNK_SIZE + 1]).await.unwrap();
    assert_eq!(deleted, QUERY_CHUNK_SIZE as u64 + 1);
    assert_eq!(cache.count_tiles().await.unwrap(), n as u64 - deleted);
}

#[tokio::test]
async fn test_empty_requests() {
    let dir = TempDir::new().unwrap();
    let cache = GeoPackage::open(dir.path().join("c.gpkg"), &matrix_set())
        .await
        .unwrap();
    assert!(cache.get_tiles(&[]).await.unwrap().is_empty());
    assert!(cache.list_missing_tiles(&[]).await.unwrap().is_empty());
    cache.put_tiles(&[]).await.unwrap();
    assert_eq!(cache.delete_tiles(&[]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_creates_missing_cache_folder() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("deeper").join("c.gpkg");
    GeoPackage::open(&path, &matrix_set()).await.unwrap();
    assert!(path.exists());
}
