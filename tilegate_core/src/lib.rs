//! Core building blocks of the tilegate tile proxy.
//!
//! Contains the coordinate algebra (tile coordinates, bounding boxes, grids),
//! the spatial reference abstraction, geometric coverages, per-fingerprint
//! locking and the shared configuration values. Everything in this crate is
//! immutable after configuration and free of network or cache I/O; the only
//! filesystem interaction is the lock directory.

pub mod config;
pub mod coverage;
pub mod error;
pub mod grid;
pub mod lock;
pub mod srs;
pub mod types;

pub use config::*;
pub use coverage::{Coverage, PolygonGeom, Ring};
pub use error::*;
pub use grid::{GridOpts, GridOrigin, MetaGrid, MetaTile, ResFactor, TileGrid, TileRange};
pub use lock::{TileLockGuard, TileLocker};
pub use srs::{Projection, Srs, SrsRegistry};
pub use types::*;
