//! Tile addressing and cached tile records.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tile address in a tile matrix: column, row and zoom level.
///
/// Columns and rows are signed so that indices computed for areas outside
/// the grid can be represented and rejected explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileAddress {
    /// Column (x)
    pub col: i64,
    /// Row (y)
    pub row: i64,
    /// Zoom level
    pub zoom: u32,
}

impl TileAddress {
    pub fn new(col: i64, row: i64, zoom: u32) -> Self {
        Self { col, row, zoom }
    }

    /// Bing-style quadkey: one base-4 digit per zoom level, most significant
    /// level first, column bit as 1 and row bit as 2.
    pub fn quadkey(&self) -> String {
        (1..=self.zoom)
            .rev()
            .map(|i| {
                let mask = 1i64 << (i - 1);
                let mut digit = 0u8;
                if self.col & mask != 0 {
                    digit += 1;
                }
                if self.row & mask != 0 {
                    digit += 2;
                }
                char::from(b'0' + digit)
            })
            .collect()
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.col, self.row)
    }
}

impl From<(i64, i64, u32)> for TileAddress {
    fn from((col, row, zoom): (i64, i64, u32)) -> Self {
        Self { col, row, zoom }
    }
}

/// Encoded tile bytes with the time they were stored.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRecord {
    pub address: TileAddress,
    pub data: Bytes,
    pub last_modified: DateTime<Utc>,
}
