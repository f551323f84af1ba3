//! Shared test utilities for the basemap cache workspace.
//!
//! This crate provides common testing infrastructure including:
//! - Approximate float assertions
//! - Synthetic tile images whose colour encodes their address
//! - Local HTTP servers standing in for tile and reprojection services
//! - Common test fixtures
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```
//!
//! Then import in your tests:
//!
//! ```ignore
//! use test_utils::{assert_approx_eq, fixtures, spawn_server};
//! ```

pub mod fixtures;
pub mod generators;
pub mod server;

// Re-export commonly used items at the crate root
pub use fixtures::*;
pub use generators::*;
pub use server::*;

/// Macro for approximate floating-point equality assertions.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_approx_eq;
///
/// assert_approx_eq!(1.0001_f64, 1.0_f64, 0.001_f64); // passes
/// assert_approx_eq!(1.1_f32, 1.0_f32, 0.001_f32);    // fails
/// ```
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: f64 = $left as f64;
        let right: f64 = $right as f64;
        let epsilon: f64 = $epsilon as f64;
        let diff = (left - right).abs();
        if diff > epsilon {
            panic!(
                "assertion failed: `(left ≈ right)`\n  left: `{:?}`,\n right: `{:?}`,\n  diff: `{:?}` > epsilon `{:?}`",
                left, right, diff, epsilon
            );
        }
    }};
}

/// Approximate equality of a bounding box against `(min_x, min_y, max_x, max_y)`.
///
/// Works with any value exposing `min_x`, `min_y`, `max_x` and `max_y` fields.
///
/// ```ignore
/// assert_bbox_approx_eq!(bbox, (0.0, 0.0, 256.0, 256.0), 1e-9);
/// ```
#[macro_export]
macro_rules! assert_bbox_approx_eq {
    ($bbox:expr, ($min_x:expr, $min_y:expr, $max_x:expr, $max_y:expr), $epsilon:expr) => {{
        let bbox = &$bbox;
        $crate::assert_approx_eq!(bbox.min_x, $min_x, $epsilon);
        $crate::assert_approx_eq!(bbox.min_y, $min_y, $epsilon);
        $crate::assert_approx_eq!(bbox.max_x, $max_x, $epsilon);
        $crate::assert_approx_eq!(bbox.max_y, $max_y, $epsilon);
    }};
}

#[cfg(test)]
mod tests {
    struct Extent {
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    }

    #[test]
    fn test_assert_approx_eq_passes() {
        assert_approx_eq!(1.0001, 1.0, 0.001);
        assert_approx_eq!(-20037508.3427892, -20037508.342789244, 1e-6);
    }

    #[test]
    #[should_panic(expected = "assertion failed")]
    fn test_assert_approx_eq_fails() {
        assert_approx_eq!(1.1, 1.0, 0.001);
    }

    #[test]
    fn test_assert_bbox_approx_eq_passes() {
        let extent = Extent {
            min_x: 0.0,
            min_y: -1.0,
            max_x: 256.00001,
            max_y: 1.0,
        };
        assert_bbox_approx_eq!(extent, (0.0, -1.0, 256.0, 1.0), 1e-3);
    }
}
