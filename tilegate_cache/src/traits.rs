//! The backend contract.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::SystemTime;
use tilegate_core::{Tile, TileCoord};

/// What a backend can and cannot do; the tile manager adapts around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
	/// Identical single-color tiles can be stored as links to one shared
	/// file (filesystem caches on unix).
	pub supports_link_identical: bool,
	/// Whether stored tiles survive process restarts.
	pub is_persistent: bool,
	/// Whether the backend tracks per-tile modification times.
	pub supports_mtime: bool,
}

impl Default for BackendCapabilities {
	fn default() -> Self {
		BackendCapabilities {
			supports_link_identical: false,
			is_persistent: true,
			supports_mtime: true,
		}
	}
}

/// Uniform async store contract for tile caches.
///
/// Implementations must make `store` atomic (a concurrent reader sees the
/// old tile or the new tile, never a torn write) and `load` read-your-write
/// within one process. Concurrent stores of the same coordinate are
/// last-writer-wins.
#[async_trait]
pub trait CacheBackend: Debug + Send + Sync {
	/// A short identifier of the backend kind (`file`, `mbtiles`, …).
	fn backend_name(&self) -> &str;

	/// The path/id schema this cache uses, for interoperability checks.
	fn cache_layout(&self) -> &str;

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities::default()
	}

	/// Loads one tile. A missing tile is returned as `TileData::Missing`,
	/// the stored blank marker as `TileData::Empty`; both are `Ok`.
	/// `with_metadata` asks for the mtime when the backend tracks one.
	async fn load(&self, coord: &TileCoord, with_metadata: bool) -> Result<Tile>;

	/// Stores one tile (bytes or the empty marker). Overwrites silently.
	async fn store(&self, tile: &Tile) -> Result<()>;

	/// Removes one tile; removing a missing tile is not an error.
	async fn remove(&self, coord: &TileCoord) -> Result<()>;

	async fn is_cached(&self, coord: &TileCoord) -> bool {
		match self.load(coord, false).await {
			Ok(tile) => tile.is_cached(),
			Err(_) => false,
		}
	}

	/// Bulk load; backends with a cheaper batch path override this.
	async fn load_many(&self, coords: &[TileCoord], with_metadata: bool) -> Result<Vec<Tile>> {
		let mut tiles = Vec::with_capacity(coords.len());
		for coord in coords {
			tiles.push(self.load(coord, with_metadata).await?);
		}
		Ok(tiles)
	}

	/// Bulk store; transactional backends override this with one commit.
	async fn store_many(&self, tiles: &[Tile]) -> Result<()> {
		for tile in tiles {
			self.store(tile).await?;
		}
		Ok(())
	}

	/// Bumps the stored mtime without rewriting the tile, when supported.
	/// Backends without mtime tracking ignore this.
	async fn set_mtime(&self, _coord: &TileCoord, _mtime: SystemTime) -> Result<()> {
		Ok(())
	}
}
