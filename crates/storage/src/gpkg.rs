//! Tile reads and writes against a GeoPackage file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use map_common::{MapError, MapResult, TileAddress, TileRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Connection, Row, SqliteConnection};
use tracing::{debug, info, instrument, warn};

use crate::schema::{self, MatrixSet, APPLICATION_ID, TILES_TABLE};

/// Tiles older than this are treated as absent.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 90;

/// Keys per statement for batched lookups; 3 parameters each stays well
/// under the SQLite variable limit.
pub const QUERY_CHUNK_SIZE: usize = 300;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn cache_err(context: &str) -> impl Fn(sqlx::Error) -> MapError + '_ {
    move |e| MapError::Cache(format!("{}: {}", context, e))
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// One row of `gpkg_tile_matrix`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixLevel {
    pub zoom_level: i64,
    pub matrix_width: i64,
    pub matrix_height: i64,
    pub tile_width: i64,
    pub tile_height: i64,
    pub pixel_x_size: f64,
    pub pixel_y_size: f64,
}

/// Handle on a tile cache file. Cheap to clone, holds no connection.
#[derive(Debug, Clone)]
pub struct GeoPackage {
    path: PathBuf,
    name: String,
    max_age: Duration,
}

impl GeoPackage {
    /// Open the cache at `path`, creating it for `matrix` when the file does
    /// not exist yet.
    ///
    /// An existing file that is not a GeoPackage tile cache is rejected with
    /// [`MapError::CacheSchema`] and left untouched.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, matrix: &MatrixSet) -> MapResult<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let cache = Self {
            path,
            name,
            max_age: Duration::days(DEFAULT_MAX_AGE_DAYS),
        };

        if tokio::fs::try_exists(&cache.path).await? {
            if let Err(reason) = cache.check_schema().await {
                warn!(reason = %reason, "Existing file is not a tile cache");
                return Err(MapError::CacheSchema {
                    path: cache.path.clone(),
                    reason,
                });
            }
            debug!("Reusing tile cache");
        } else {
            if let Some(parent) = cache.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            cache.create(matrix).await?;
            info!(levels = matrix.resolutions.len(), "Created tile cache");
        }
        Ok(cache)
    }

    /// Override the freshness limit (90 days by default).
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File stem, recorded as the contents identifier.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    async fn connect(&self, create: bool) -> MapResult<SqliteConnection> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(create);
        SqliteConnection::connect_with(&options)
            .await
            .map_err(cache_err("open failed"))
    }

    /// Reason why the existing file cannot be used, if any. Read-only.
    async fn check_schema(&self) -> Result<(), String> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .read_only(true);
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| format!("cannot open as SQLite: {}", e))?;

        let result = async {
            let app_id: i64 = sqlx::query_scalar("PRAGMA application_id")
                .fetch_one(&mut conn)
                .await
                .map_err(|e| format!("cannot read application id: {}", e))?;
            if app_id != APPLICATION_ID {
                return Err(format!("application id is {}, expected {}", app_id, APPLICATION_ID));
            }
            for probe in schema::PROBES {
                sqlx::query(probe)
                    .fetch_optional(&mut conn)
                    .await
                    .map_err(|e| format!("incorrect schema: {}", e))?;
            }
            Ok(())
        }
        .await;

        let _ = conn.close().await;
        result
    }

    /// Schema plus catalog rows, in one transaction.
    async fn create(&self, matrix: &MatrixSet) -> MapResult<()> {
        let mut conn = self.connect(true).await?;
        let mut tx = conn.begin().await.map_err(cache_err("begin failed"))?;

        sqlx::query(&format!("PRAGMA application_id = {}", APPLICATION_ID))
            .execute(&mut *tx)
            .await
            .map_err(cache_err("set application id failed"))?;

        for ddl in schema::CREATE_TABLES {
            sqlx::query(ddl)
                .execute(&mut *tx)
                .await
                .map_err(cache_err("create table failed"))?;
        }

        let srs_id = matrix.code as i64;
        sqlx::query(
            r#"
            INSERT INTO gpkg_spatial_ref_sys
                (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
            VALUES (?, ?, ?, ?, ?, '')
            "#,
        )
        .bind(format!("{}:{}", matrix.auth, matrix.code))
        .bind(srs_id)
        .bind(&matrix.auth)
        .bind(srs_id)
        .bind("undefined")
        .execute(&mut *tx)
        .await
        .map_err(cache_err("insert srs failed"))?;

        let b = &matrix.bbox;
        sqlx::query(
            r#"
            INSERT INTO gpkg_contents
                (table_name, data_type, identifier, description, min_x, min_y, max_x, max_y, srs_id)
            VALUES (?, 'tiles', ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(TILES_TABLE)
        .bind(&self.name)
        .bind("Tile cache")
        .bind(b.min_x)
        .bind(b.min_y)
        .bind(b.max_x)
        .bind(b.max_y)
        .bind(srs_id)
        .execute(&mut *tx)
        .await
        .map_err(cache_err("insert contents failed"))?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO gpkg_tile_matrix_set
                (table_name, srs_id, min_x, min_y, max_x, max_y)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(TILES_TABLE)
        .bind(srs_id)
        .bind(b.min_x)
        .bind(b.min_y)
        .bind(b.max_x)
        .bind(b.max_y)
        .execute(&mut *tx)
        .await
        .map_err(cache_err("insert tile matrix set failed"))?;

        for (level, &res) in matrix.resolutions.iter().enumerate() {
            let (width, height) = matrix.matrix_size(res);
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO gpkg_tile_matrix
                    (table_name, zoom_level, matrix_width, matrix_height,
                     tile_width, tile_height, pixel_x_size, pixel_y_size)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(TILES_TABLE)
            .bind(level as i64)
            .bind(width)
            .bind(height)
            .bind(matrix.tile_size as i64)
            .bind(matrix.tile_size as i64)
            .bind(res)
            .bind(res)
            .execute(&mut *tx)
            .await
            .map_err(cache_err("insert tile matrix failed"))?;
        }

        tx.commit().await.map_err(cache_err("commit failed"))?;
        conn.close().await.map_err(cache_err("close failed"))?;
        Ok(())
    }

    /// Rows of `gpkg_tile_matrix`, by zoom level.
    pub async fn matrix_levels(&self) -> MapResult<Vec<MatrixLevel>> {
        let mut conn = self.connect(false).await?;
        let rows = sqlx::query(
            r#"
            SELECT zoom_level, matrix_width, matrix_height, tile_width, tile_height,
                   pixel_x_size, pixel_y_size
            FROM gpkg_tile_matrix ORDER BY zoom_level
            "#,
        )
        .fetch_all(&mut conn)
        .await
        .map_err(cache_err("read tile matrix failed"))?;
        conn.close().await.map_err(cache_err("close failed"))?;

        rows.iter()
            .map(|row| {
                Ok(MatrixLevel {
                    zoom_level: row.try_get("zoom_level")?,
                    matrix_width: row.try_get("matrix_width")?,
                    matrix_height: row.try_get("matrix_height")?,
                    tile_width: row.try_get("tile_width")?,
                    tile_height: row.try_get("tile_height")?,
                    pixel_x_size: row.try_get("pixel_x_size")?,
                    pixel_y_size: row.try_get("pixel_y_size")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(cache_err("decode tile matrix failed"))
    }

    fn cutoff(&self) -> String {
        format_timestamp(Utc::now() - self.max_age)
    }

    /// Bytes of a fresh tile, `None` when missing or stale.
    pub async fn get_tile(&self, tile: &TileAddress) -> MapResult<Option<Bytes>> {
        let mut conn = self.connect(false).await?;
        let row = sqlx::query(
            r#"
            SELECT tile_data FROM gpkg_tiles
            WHERE zoom_level = ? AND tile_column = ? AND tile_row = ? AND last_modified > ?
            "#,
        )
        .bind(tile.zoom as i64)
        .bind(tile.col)
        .bind(tile.row)
        .bind(self.cutoff())
        .fetch_optional(&mut conn)
        .await
        .map_err(cache_err("get tile failed"))?;
        conn.close().await.map_err(cache_err("close failed"))?;

        row.map(|r| r.try_get::<Vec<u8>, _>("tile_data").map(Bytes::from))
            .transpose()
            .map_err(cache_err("decode tile failed"))
    }

    /// Fresh records among `tiles`, in no particular order.
    #[instrument(skip(self, tiles), fields(cache = %self.name, requested = tiles.len()))]
    pub async fn get_tiles(&self, tiles: &[TileAddress]) -> MapResult<Vec<TileRecord>> {
        let rows = self
            .select_chunked(tiles, "tile_column, tile_row, zoom_level, tile_data, last_modified")
            .await?;
        rows.iter()
            .map(|row| {
                let address = decode_address(row)?;
                let data: Vec<u8> = row.try_get("tile_data")?;
                let stamp: String = row.try_get("last_modified")?;
                Ok((address, data, stamp))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(cache_err("decode tiles failed"))?
            .into_iter()
            .map(|(address, data, stamp)| {
                let last_modified = parse_timestamp(&stamp).ok_or_else(|| {
                    MapError::Cache(format!("bad last_modified '{}' for {}", stamp, address))
                })?;
                Ok(TileRecord {
                    address,
                    data: Bytes::from(data),
                    last_modified,
                })
            })
            .collect()
    }

    /// Fresh tiles among `tiles`.
    pub async fn list_existing_tiles(&self, tiles: &[TileAddress]) -> MapResult<HashSet<TileAddress>> {
        let rows = self
            .select_chunked(tiles, "tile_column, tile_row, zoom_level")
            .await?;
        rows.iter()
            .map(decode_address)
            .collect::<Result<_, _>>()
            .map_err(cache_err("decode tiles failed"))
    }

    /// Tiles of `tiles` absent or stale in the cache.
    pub async fn list_missing_tiles(&self, tiles: &[TileAddress]) -> MapResult<HashSet<TileAddress>> {
        let existing = self.list_existing_tiles(tiles).await?;
        Ok(tiles
            .iter()
            .filter(|t| !existing.contains(t))
            .copied()
            .collect())
    }

    /// Fresh rows for `tiles`, queried in chunks of [`QUERY_CHUNK_SIZE`].
    async fn select_chunked(&self, tiles: &[TileAddress], columns: &str) -> MapResult<Vec<SqliteRow>> {
        if tiles.is_empty() {
            return Ok(Vec::new());
        }
        let cutoff = self.cutoff();
        let mut conn = self.connect(false).await?;
        let mut rows = Vec::new();

        for chunk in tiles.chunks(QUERY_CHUNK_SIZE) {
            let sql = format!(
                "SELECT {} FROM gpkg_tiles WHERE last_modified > ? \
                 AND (zoom_level, tile_column, tile_row) IN (VALUES {})",
                columns,
                vec!["(?, ?, ?)"; chunk.len()].join(", ")
            );
            let mut query = sqlx::query(&sql).bind(&cutoff);
            for tile in chunk {
                query = query.bind(tile.zoom as i64).bind(tile.col).bind(tile.row);
            }
            rows.extend(
                query
                    .fetch_all(&mut conn)
                    .await
                    .map_err(cache_err("select tiles failed"))?,
            );
        }

        conn.close().await.map_err(cache_err("close failed"))?;
        Ok(rows)
    }

    pub async fn put_tile(&self, tile: &TileAddress, data: &[u8]) -> MapResult<()> {
        self.put_tiles(&[(*tile, Bytes::copy_from_slice(data))]).await
    }

    /// Insert or replace tiles, all stamped with the current time.
    #[instrument(skip(self, tiles), fields(cache = %self.name, count = tiles.len()))]
    pub async fn put_tiles(&self, tiles: &[(TileAddress, Bytes)]) -> MapResult<()> {
        if tiles.is_empty() {
            return Ok(());
        }
        let now = format_timestamp(Utc::now());
        let mut conn = self.connect(false).await?;
        let mut tx = conn.begin().await.map_err(cache_err("begin failed"))?;

        for (tile, data) in tiles {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO gpkg_tiles
                    (tile_column, tile_row, zoom_level, tile_data, last_modified)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(tile.col)
            .bind(tile.row)
            .bind(tile.zoom as i64)
            .bind(data.as_ref())
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(cache_err("put tile failed"))?;
        }

        tx.commit().await.map_err(cache_err("commit failed"))?;
        conn.close().await.map_err(cache_err("close failed"))?;
        debug!("Tiles written");
        Ok(())
    }

    /// Remove tiles whatever their age; returns the number of rows deleted.
    pub async fn delete_tiles(&self, tiles: &[TileAddress]) -> MapResult<u64> {
        if tiles.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect(false).await?;
        let mut deleted = 0;
        for chunk in tiles.chunks(QUERY_CHUNK_SIZE) {
            let sql = format!(
                "DELETE FROM gpkg_tiles WHERE (zoom_level, tile_column, tile_row) IN (VALUES {})",
                vec!["(?, ?, ?)"; chunk.len()].join(", ")
            );
            let mut query = sqlx::query(&sql);
            for tile in chunk {
                query = query.bind(tile.zoom as i64).bind(tile.col).bind(tile.row);
            }
            deleted += query
                .execute(&mut conn)
                .await
                .map_err(cache_err("delete tiles failed"))?
                .rows_affected();
        }
        conn.close().await.map_err(cache_err("close failed"))?;
        Ok(deleted)
    }

    /// Number of stored tiles, stale ones included.
    pub async fn count_tiles(&self) -> MapResult<u64> {
        let mut conn = self.connect(false).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM gpkg_tiles")
            .fetch_one(&mut conn)
            .await
            .map_err(cache_err("count tiles failed"))?;
        conn.close().await.map_err(cache_err("close failed"))?;
        Ok(count as u64)
    }
}

fn decode_address(row: &SqliteRow) -> Result<TileAddress, sqlx::Error> {
    let zoom: i64 = row.try_get("zoom_level")?;
    Ok(TileAddress::new(
        row.try_get("tile_column")?,
        row.try_get("tile_row")?,
        zoom as u32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 1).unwrap();
        assert_eq!(format_timestamp(ts), "2024-02-29 23:59:01");
        assert_eq!(parse_timestamp("2024-02-29 23:59:01"), Some(ts));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let older = format_timestamp(Utc.with_ymd_and_hms(2023, 12, 31, 9, 0, 0).unwrap());
        let newer = format_timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap());
        assert!(older < newer);
    }
}
