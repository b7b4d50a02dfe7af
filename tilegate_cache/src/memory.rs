//! In-process tile cache, for tests and for fronting `disable_storage`
//! caches.

use crate::{BackendCapabilities, CacheBackend};
use anyhow::Result;
use async_trait::async_trait;
use std::{
	collections::HashMap,
	sync::Mutex,
	time::SystemTime,
};
use tilegate_core::{Tile, TileCoord, TileData};

#[derive(Debug, Default)]
pub struct MemoryCache {
	tiles: Mutex<HashMap<TileCoord, (TileData, SystemTime)>>,
}

impl MemoryCache {
	pub fn new() -> MemoryCache {
		MemoryCache::default()
	}

	pub fn len(&self) -> usize {
		self.tiles.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl CacheBackend for MemoryCache {
	fn backend_name(&self) -> &str {
		"memory"
	}

	fn cache_layout(&self) -> &str {
		"memory"
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities {
			supports_link_identical: false,
			is_persistent: false,
			supports_mtime: true,
		}
	}

	async fn load(&self, coord: &TileCoord, with_metadata: bool) -> Result<Tile> {
		let tiles = self.tiles.lock().unwrap();
		Ok(match tiles.get(coord) {
			Some((data, mtime)) => {
				let mut tile = Tile::new(*coord, data.clone());
				if with_metadata {
					tile.mtime = Some(*mtime);
				}
				tile
			}
			None => Tile::missing(*coord),
		})
	}

	async fn store(&self, tile: &Tile) -> Result<()> {
		if tile.data.is_missing() {
			return Ok(());
		}
		let mtime = tile.mtime.unwrap_or_else(SystemTime::now);
		self
			.tiles
			.lock()
			.unwrap()
			.insert(tile.coord, (tile.data.clone(), mtime));
		Ok(())
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		self.tiles.lock().unwrap().remove(coord);
		Ok(())
	}

	async fn set_mtime(&self, coord: &TileCoord, mtime: SystemTime) -> Result<()> {
		if let Some(entry) = self.tiles.lock().unwrap().get_mut(coord) {
			entry.1 = mtime;
		}
		Ok(())
	}
}
