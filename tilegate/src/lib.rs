//! tilegate — a caching tile proxy and on-demand tile-pyramid builder.
//!
//! Sits between map clients and heterogeneous upstream map sources and
//! answers requests from a multi-backend tile cache whenever possible.
//! Cache misses trigger minimum-work upstream fetches: neighboring misses
//! coalesce into meta-tiles computed once under a per-fingerprint lock,
//! composed, re-tiled and stored.
//!
//! The crates split the concerns: `tilegate_core` (grids, SRS, coverages,
//! locks), `tilegate_image` (raster pipeline), `tilegate_cache` (storage
//! backends) and this crate (sources, layers, the tile manager, the
//! seeder and the service facade).

pub mod client;
pub mod layer;
pub mod manager;
pub mod seed;
pub mod service;
pub mod source;

pub use client::{HttpClient, HttpClientOpts};
pub use layer::{Layer, LayerEntry};
pub use manager::{CreationMode, TileManager, TileManagerBuilder};
pub use seed::{seed, cleanup, SeedProgress, SeedStats, SeedTask};
pub use service::TileService;
pub use source::{Source, SourceResponse};

pub use tilegate_cache as cache;
pub use tilegate_core as core;
pub use tilegate_image as img;
