//! Tile cache backends.
//!
//! Every backend implements the same async [`CacheBackend`] contract:
//! atomic `store`, `load` that distinguishes the empty marker from a miss,
//! `remove`, `is_cached` and an optional bulk `load_many`. Readers never
//! observe partial tiles; filesystem backends publish via temp-write plus
//! rename, the SQLite family uses single transactions, CouchDB relies on
//! document replacement.

mod compact;
mod couchdb;
mod file;
mod geopackage;
mod layout;
mod mbtiles;
mod memory;
mod sqlite_level;
mod sqlite_pool;
mod traits;

pub use compact::{CompactCache, CompactVersion, DefragStats};
pub use couchdb::CouchDbCache;
pub use file::FileCache;
pub use geopackage::GeoPackageCache;
pub use layout::CacheLayout;
pub use mbtiles::MBTilesCache;
pub use memory::MemoryCache;
pub use sqlite_level::SqliteLevelCache;
pub use traits::{BackendCapabilities, CacheBackend};
