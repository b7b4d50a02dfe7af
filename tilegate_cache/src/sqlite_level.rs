//! SQLite-per-level cache backend.
//!
//! One SQLite database per zoom level under a directory (`<z>.mbtile`),
//! each with a `tiles` table carrying a `last_modified` column. Tracks
//! mtimes (unlike plain MBTiles) and supports an optional TTL after which
//! entries read as missing.

use crate::sqlite_pool::{open_pool, SqlitePool};
use crate::{BackendCapabilities, CacheBackend};
use anyhow::Result;
use async_trait::async_trait;
use rusqlite::params;
use std::{
	collections::HashMap,
	fmt::Debug,
	fs,
	path::{Path, PathBuf},
	sync::Mutex,
	time::{Duration, SystemTime, UNIX_EPOCH},
};
use tilegate_core::{CacheError, Tile, TileCoord, TileData, TileFormat};

pub struct SqliteLevelCache {
	dir: PathBuf,
	format: TileFormat,
	timeout: Duration,
	wal: bool,
	ttl: Option<Duration>,
	pools: Mutex<HashMap<u8, SqlitePool>>,
}

impl SqliteLevelCache {
	pub fn new(dir: &Path, format: TileFormat, timeout: Duration, wal: bool) -> SqliteLevelCache {
		SqliteLevelCache {
			dir: dir.to_path_buf(),
			format,
			timeout,
			wal,
			ttl: None,
			pools: Mutex::new(HashMap::new()),
		}
	}

	/// Entries older than `ttl` read as missing.
	pub fn with_ttl(mut self, ttl: Duration) -> SqliteLevelCache {
		self.ttl = Some(ttl);
		self
	}

	fn pool(&self, z: u8) -> Result<SqlitePool> {
		let mut pools = self.pools.lock().unwrap();
		if let Some(pool) = pools.get(&z) {
			return Ok(pool.clone());
		}
		if !self.dir.exists() {
			fs::create_dir_all(&self.dir).map_err(CacheError::Io)?;
		}
		let pool = open_pool(&self.dir.join(format!("{z}.mbtile")), self.timeout, self.wal)?;
		{
			let conn = pool.get()?;
			conn.execute_batch(
				"CREATE TABLE IF NOT EXISTS tiles (
					tile_column INTEGER NOT NULL,
					tile_row INTEGER NOT NULL,
					tile_data BLOB,
					last_modified INTEGER NOT NULL,
					PRIMARY KEY (tile_column, tile_row)
				);",
			)?;
		}
		pools.insert(z, pool.clone());
		Ok(pool)
	}

	fn is_expired(&self, stored_at: SystemTime) -> bool {
		match self.ttl {
			Some(ttl) => SystemTime::now().duration_since(stored_at).unwrap_or_default() > ttl,
			None => false,
		}
	}

	/// Removes all entries of all levels older than `cutoff`. Returns the
	/// number of removed tiles.
	pub fn remove_older_than(&self, cutoff: SystemTime) -> Result<usize> {
		let cutoff_secs = cutoff.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
		let mut removed = 0usize;
		if !self.dir.exists() {
			return Ok(0);
		}
		for entry in fs::read_dir(&self.dir).map_err(CacheError::Io)? {
			let entry = entry.map_err(CacheError::Io)?;
			let name = entry.file_name();
			let Some(z) = name
				.to_str()
				.and_then(|n| n.strip_suffix(".mbtile"))
				.and_then(|n| n.parse::<u8>().ok())
			else {
				continue;
			};
			let pool = self.pool(z)?;
			let conn = pool.get()?;
			removed += conn.execute("DELETE FROM tiles WHERE last_modified < ?1", params![cutoff_secs])?;
		}
		Ok(removed)
	}
}

fn to_epoch(mtime: SystemTime) -> i64 {
	mtime.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn from_epoch(secs: i64) -> SystemTime {
	UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

#[async_trait]
impl CacheBackend for SqliteLevelCache {
	fn backend_name(&self) -> &str {
		"sqlite"
	}

	fn cache_layout(&self) -> &str {
		"sqlite"
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities {
			supports_link_identical: false,
			is_persistent: true,
			supports_mtime: true,
		}
	}

	async fn load(&self, coord: &TileCoord, with_metadata: bool) -> Result<Tile> {
		let pool = self.pool(coord.z)?;
		let conn = pool.get()?;
		let mut stmt = conn.prepare_cached(
			"SELECT tile_data, last_modified FROM tiles WHERE tile_column = ?1 AND tile_row = ?2",
		)?;
		let result = stmt.query_row(params![coord.x, coord.y], |row| {
			Ok((row.get::<_, Option<Vec<u8>>>(0)?, row.get::<_, i64>(1)?))
		});
		match result {
			Ok((blob, modified)) => {
				let stored_at = from_epoch(modified);
				if self.is_expired(stored_at) {
					return Ok(Tile::missing(*coord));
				}
				let data = match blob {
					Some(bytes) if !bytes.is_empty() => TileData::bytes(bytes, self.format),
					_ => TileData::Empty,
				};
				let mut tile = Tile::new(*coord, data);
				if with_metadata {
					tile.mtime = Some(stored_at);
				}
				Ok(tile)
			}
			Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Tile::missing(*coord)),
			Err(err) => Err(CacheError::Backend(err.to_string()).into()),
		}
	}

	async fn store(&self, tile: &Tile) -> Result<()> {
		self.store_many(std::slice::from_ref(tile)).await
	}

	async fn store_many(&self, tiles: &[Tile]) -> Result<()> {
		// group by level, one transaction per database
		let mut by_level: HashMap<u8, Vec<&Tile>> = HashMap::new();
		for tile in tiles {
			if !tile.data.is_missing() {
				by_level.entry(tile.coord.z).or_default().push(tile);
			}
		}
		for (z, level_tiles) in by_level {
			let pool = self.pool(z)?;
			let mut conn = pool.get()?;
			let tx = conn.transaction()?;
			{
				let mut stmt = tx.prepare_cached(
					"INSERT OR REPLACE INTO tiles (tile_column, tile_row, tile_data, last_modified)
					 VALUES (?1, ?2, ?3, ?4)",
				)?;
				for tile in level_tiles {
					let blob: &[u8] = match &tile.data {
						TileData::Bytes { bytes, .. } => bytes,
						_ => &[],
					};
					let mtime = to_epoch(tile.mtime.unwrap_or_else(SystemTime::now));
					stmt.execute(params![tile.coord.x, tile.coord.y, blob, mtime])?;
				}
			}
			tx.commit()?;
		}
		Ok(())
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		let pool = self.pool(coord.z)?;
		let conn = pool.get()?;
		conn.execute(
			"DELETE FROM tiles WHERE tile_column = ?1 AND tile_row = ?2",
			params![coord.x, coord.y],
		)?;
		Ok(())
	}

	async fn set_mtime(&self, coord: &TileCoord, mtime: SystemTime) -> Result<()> {
		let pool = self.pool(coord.z)?;
		let conn = pool.get()?;
		conn.execute(
			"UPDATE tiles SET last_modified = ?1 WHERE tile_column = ?2 AND tile_row = ?3",
			params![to_epoch(mtime), coord.x, coord.y],
		)?;
		Ok(())
	}
}

impl Debug for SqliteLevelCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SqliteLevelCache")
			.field("dir", &self.dir)
			.field("format", &self.format)
			.field("ttl", &self.ttl)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cache(dir: &assert_fs::TempDir) -> SqliteLevelCache {
		SqliteLevelCache::new(dir.path(), TileFormat::PNG, Duration::from_secs(5), true)
	}

	#[tokio::test]
	async fn one_database_per_level() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = cache(&dir);
		for z in [3u8, 7u8] {
			let tile = Tile::new(TileCoord::new(z, 1, 1), TileData::bytes(vec![z], TileFormat::PNG));
			cache.store(&tile).await.unwrap();
		}
		assert!(dir.path().join("3.mbtile").exists());
		assert!(dir.path().join("7.mbtile").exists());
	}

	#[tokio::test]
	async fn round_trip_with_mtime() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = cache(&dir);
		let coord = TileCoord::new(5, 9, 9);
		cache
			.store(&Tile::new(coord, TileData::bytes(vec![1], TileFormat::PNG)))
			.await
			.unwrap();

		let loaded = cache.load(&coord, true).await.unwrap();
		assert!(loaded.mtime.is_some());
		assert!(loaded.age() < Duration::from_secs(10));
	}

	#[tokio::test]
	async fn set_mtime_updates() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = cache(&dir);
		let coord = TileCoord::new(5, 1, 1);
		cache
			.store(&Tile::new(coord, TileData::bytes(vec![1], TileFormat::PNG)))
			.await
			.unwrap();

		let past = SystemTime::now() - Duration::from_secs(9000);
		cache.set_mtime(&coord, past).await.unwrap();
		let loaded = cache.load(&coord, true).await.unwrap();
		assert!(loaded.age() > Duration::from_secs(8000));
	}

	#[tokio::test]
	async fn expired_entries_read_as_missing() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = cache(&dir).with_ttl(Duration::from_secs(3600));
		let coord = TileCoord::new(4, 2, 2);
		cache
			.store(&Tile::new(coord, TileData::bytes(vec![1], TileFormat::PNG)))
			.await
			.unwrap();
		assert!(cache.is_cached(&coord).await);

		cache
			.set_mtime(&coord, SystemTime::now() - Duration::from_secs(7200))
			.await
			.unwrap();
		assert!(cache.load(&coord, false).await.unwrap().data.is_missing());
	}

	#[tokio::test]
	async fn cleanup_removes_old_tiles() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = cache(&dir);
		let old = TileCoord::new(4, 0, 0);
		let fresh = TileCoord::new(4, 1, 0);
		cache
			.store(&Tile::new(old, TileData::bytes(vec![1], TileFormat::PNG)))
			.await
			.unwrap();
		cache
			.store(&Tile::new(fresh, TileData::bytes(vec![2], TileFormat::PNG)))
			.await
			.unwrap();
		cache
			.set_mtime(&old, SystemTime::now() - Duration::from_secs(100_000))
			.await
			.unwrap();

		let removed = cache
			.remove_older_than(SystemTime::now() - Duration::from_secs(86_400))
			.unwrap();
		assert_eq!(removed, 1);
		assert!(!cache.is_cached(&old).await);
		assert!(cache.is_cached(&fresh).await);
	}
}
