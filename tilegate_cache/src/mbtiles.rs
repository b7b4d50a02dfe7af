//! MBTiles cache backend.
//!
//! One SQLite file per cache, `tiles` + `metadata` tables per the MBTiles
//! spec. Row numbers on disk are TMS (south origin); incoming coordinates
//! use XYZ rows by default and are flipped, assuming the square
//! power-of-two pyramid MBTiles is defined for. Writes run in single
//! transactions, reads and writes survive `database is locked` through the
//! configured busy timeout.

use crate::sqlite_pool::{open_pool, SqlitePool};
use crate::{BackendCapabilities, CacheBackend};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::trace;
use rusqlite::params;
use std::{fmt::Debug, path::Path, time::Duration};
use tilegate_core::{CacheError, Tile, TileCoord, TileData, TileFormat};

pub struct MBTilesCache {
	name: String,
	pool: SqlitePool,
	format: TileFormat,
	/// Flip incoming XYZ rows to TMS on disk.
	flip_rows: bool,
}

impl MBTilesCache {
	/// Opens or creates the MBTiles file. `timeout` is the SQLite busy
	/// timeout, `wal` enables write-ahead logging.
	pub fn open(path: &Path, format: TileFormat, timeout: Duration, wal: bool) -> Result<MBTilesCache> {
		let pool = open_pool(path, timeout, wal)?;
		let cache = MBTilesCache {
			name: path.display().to_string(),
			pool,
			format,
			flip_rows: true,
		};
		cache.init_schema()?;
		Ok(cache)
	}

	/// Treats incoming rows as TMS already (south-west origin grids).
	pub fn with_tms_rows(mut self) -> MBTilesCache {
		self.flip_rows = false;
		self
	}

	fn init_schema(&self) -> Result<()> {
		let conn = self.pool.get()?;
		conn.execute_batch(
			"CREATE TABLE IF NOT EXISTS tiles (
				zoom_level INTEGER NOT NULL,
				tile_column INTEGER NOT NULL,
				tile_row INTEGER NOT NULL,
				tile_data BLOB
			);
			CREATE UNIQUE INDEX IF NOT EXISTS tiles_index
				ON tiles (zoom_level, tile_column, tile_row);
			CREATE TABLE IF NOT EXISTS metadata (name TEXT NOT NULL, value TEXT);",
		)?;
		let count: i64 = conn.query_row("SELECT COUNT(*) FROM metadata", [], |row| row.get(0))?;
		if count == 0 {
			let format = match self.format {
				TileFormat::JPEG => "jpg",
				_ => "png",
			};
			conn.execute("INSERT INTO metadata (name, value) VALUES ('format', ?1)", params![format])?;
		}
		Ok(())
	}

	fn row(&self, coord: &TileCoord) -> u32 {
		if self.flip_rows {
			let max_index = (1u32 << coord.z) - 1;
			max_index - coord.y
		} else {
			coord.y
		}
	}

	fn tile_from_blob(&self, coord: &TileCoord, blob: Option<Vec<u8>>) -> Tile {
		match blob {
			Some(bytes) if bytes.is_empty() => Tile::new(*coord, TileData::Empty),
			Some(bytes) => {
				let format = self.stored_format(&bytes_probe(&bytes));
				Tile::new(*coord, TileData::bytes(bytes, format))
			}
			None => Tile::new(*coord, TileData::Empty),
		}
	}

	/// `mixed` caches hold PNG and JPEG side by side; the payload header
	/// decides the effective format.
	fn stored_format(&self, probed: &Option<TileFormat>) -> TileFormat {
		match self.format {
			TileFormat::MIXED => probed.unwrap_or(TileFormat::PNG),
			format => format,
		}
	}
}

fn bytes_probe(bytes: &[u8]) -> Option<TileFormat> {
	if bytes.len() >= 3 && bytes[..3] == [0xff, 0xd8, 0xff] {
		Some(TileFormat::JPEG)
	} else if bytes.len() >= 8 && bytes[..4] == [0x89, b'P', b'N', b'G'] {
		Some(TileFormat::PNG)
	} else {
		None
	}
}

#[async_trait]
impl CacheBackend for MBTilesCache {
	fn backend_name(&self) -> &str {
		"mbtiles"
	}

	fn cache_layout(&self) -> &str {
		"mbtiles"
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities {
			supports_link_identical: false,
			is_persistent: true,
			supports_mtime: false,
		}
	}

	async fn load(&self, coord: &TileCoord, _with_metadata: bool) -> Result<Tile> {
		trace!("load {coord:?} from {}", self.name);
		let conn = self.pool.get()?;
		let mut stmt = conn.prepare_cached(
			"SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
		)?;
		let result = stmt.query_row(
			params![coord.z, coord.x, self.row(coord)],
			|row| row.get::<_, Option<Vec<u8>>>(0),
		);
		match result {
			Ok(blob) => Ok(self.tile_from_blob(coord, blob)),
			Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Tile::missing(*coord)),
			Err(err) => Err(CacheError::Backend(err.to_string()).into()),
		}
	}

	async fn store(&self, tile: &Tile) -> Result<()> {
		self.store_many(std::slice::from_ref(tile)).await
	}

	async fn store_many(&self, tiles: &[Tile]) -> Result<()> {
		let mut conn = self.pool.get()?;
		let tx = conn.transaction()?;
		{
			let mut stmt = tx.prepare_cached(
				"INSERT OR REPLACE INTO tiles (zoom_level, tile_column, tile_row, tile_data)
				 VALUES (?1, ?2, ?3, ?4)",
			)?;
			for tile in tiles {
				let blob: &[u8] = match &tile.data {
					TileData::Bytes { bytes, .. } => bytes,
					TileData::Empty => &[],
					TileData::Missing => continue,
				};
				stmt.execute(params![tile.coord.z, tile.coord.x, self.row(&tile.coord), blob])?;
			}
		}
		tx.commit().context("mbtiles transaction")?;
		Ok(())
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		let conn = self.pool.get()?;
		conn.execute(
			"DELETE FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
			params![coord.z, coord.x, self.row(coord)],
		)?;
		Ok(())
	}

	async fn load_many(&self, coords: &[TileCoord], _with_metadata: bool) -> Result<Vec<Tile>> {
		if coords.is_empty() {
			return Ok(Vec::new());
		}
		let conn = self.pool.get()?;

		let mut sql = String::from(
			"SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles WHERE ",
		);
		let mut params_vec: Vec<i64> = Vec::with_capacity(coords.len() * 3);
		for (i, coord) in coords.iter().enumerate() {
			if i > 0 {
				sql.push_str(" OR ");
			}
			sql.push_str("(zoom_level = ? AND tile_column = ? AND tile_row = ?)");
			params_vec.push(i64::from(coord.z));
			params_vec.push(i64::from(coord.x));
			params_vec.push(i64::from(self.row(coord)));
		}

		let mut stmt = conn.prepare(&sql)?;
		let mut found: std::collections::HashMap<(u8, u32, u32), Option<Vec<u8>>> =
			std::collections::HashMap::new();
		let rows = stmt.query_map(rusqlite::params_from_iter(params_vec), |row| {
			Ok((
				row.get::<_, u8>(0)?,
				row.get::<_, u32>(1)?,
				row.get::<_, u32>(2)?,
				row.get::<_, Option<Vec<u8>>>(3)?,
			))
		})?;
		for row in rows {
			let (z, x, row_y, blob) = row?;
			found.insert((z, x, row_y), blob);
		}

		Ok(coords
			.iter()
			.map(|coord| match found.remove(&(coord.z, coord.x, self.row(coord))) {
				Some(blob) => self.tile_from_blob(coord, blob),
				None => Tile::missing(*coord),
			})
			.collect())
	}
}

impl Debug for MBTilesCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MBTilesCache")
			.field("name", &self.name)
			.field("format", &self.format)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn open(dir: &assert_fs::TempDir) -> MBTilesCache {
		MBTilesCache::open(
			&dir.path().join("test.mbtiles"),
			TileFormat::PNG,
			Duration::from_secs(5),
			true,
		)
		.unwrap()
	}

	#[tokio::test]
	async fn round_trip() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = open(&dir);
		let coord = TileCoord::new(3, 1, 2);

		cache
			.store(&Tile::new(coord, TileData::bytes(vec![1, 2, 3], TileFormat::PNG)))
			.await
			.unwrap();
		let loaded = cache.load(&coord, false).await.unwrap();
		assert_eq!(loaded.data.len(), 3);

		cache.remove(&coord).await.unwrap();
		assert!(cache.load(&coord, false).await.unwrap().data.is_missing());
	}

	#[tokio::test]
	async fn rows_are_stored_tms() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = open(&dir);
		let coord = TileCoord::new(3, 1, 2);
		cache
			.store(&Tile::new(coord, TileData::bytes(vec![9], TileFormat::PNG)))
			.await
			.unwrap();

		let conn = cache.pool.get().unwrap();
		let row: u32 = conn
			.query_row(
				"SELECT tile_row FROM tiles WHERE zoom_level = 3 AND tile_column = 1",
				[],
				|row| row.get(0),
			)
			.unwrap();
		// 2^3 - 1 - 2
		assert_eq!(row, 5);
	}

	#[tokio::test]
	async fn batched_store_and_bulk_load() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = open(&dir);
		let coords: Vec<TileCoord> = (0..8).map(|x| TileCoord::new(4, x, 3)).collect();
		let tiles: Vec<Tile> = coords
			.iter()
			.map(|c| Tile::new(*c, TileData::bytes(vec![c.x as u8], TileFormat::PNG)))
			.collect();
		cache.store_many(&tiles).await.unwrap();

		let mut wanted = coords.clone();
		wanted.push(TileCoord::new(4, 15, 15));
		let loaded = cache.load_many(&wanted, false).await.unwrap();
		assert_eq!(loaded.len(), 9);
		for (i, tile) in loaded[..8].iter().enumerate() {
			assert_eq!(tile.data.len(), 1, "tile {i}");
		}
		assert!(loaded[8].data.is_missing());
	}

	#[tokio::test]
	async fn empty_marker_round_trip() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = open(&dir);
		let coord = TileCoord::new(2, 0, 0);
		cache.store(&Tile::new(coord, TileData::Empty)).await.unwrap();
		assert!(cache.load(&coord, false).await.unwrap().data.is_empty_marker());
	}

	#[tokio::test]
	async fn metadata_has_format() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = open(&dir);
		let conn = cache.pool.get().unwrap();
		let format: String = conn
			.query_row("SELECT value FROM metadata WHERE name = 'format'", [], |row| row.get(0))
			.unwrap();
		assert_eq!(format, "png");
	}

	#[tokio::test]
	async fn concurrent_writers_survive_locking() {
		let dir = assert_fs::TempDir::new().unwrap();
		let path = dir.path().join("shared.mbtiles");
		let mut handles = Vec::new();
		for worker in 0..4u32 {
			let path = path.clone();
			handles.push(tokio::task::spawn_blocking(move || {
				let cache =
					MBTilesCache::open(&path, TileFormat::PNG, Duration::from_secs(10), true).unwrap();
				let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
				for i in 0..16u32 {
					let coord = TileCoord::new(8, worker * 16 + i, 0);
					let tile = Tile::new(coord, TileData::bytes(vec![worker as u8, i as u8], TileFormat::PNG));
					rt.block_on(cache.store(&tile)).unwrap();
				}
			}));
		}
		for handle in handles {
			handle.await.unwrap();
		}

		let cache = MBTilesCache::open(&path, TileFormat::PNG, Duration::from_secs(5), true).unwrap();
		let conn = cache.pool.get().unwrap();
		let count: i64 = conn.query_row("SELECT COUNT(*) FROM tiles", [], |row| row.get(0)).unwrap();
		assert_eq!(count, 64);
	}
}
