//! GeoPackage cache backend.
//!
//! Creates the `gpkg_*` registry rows and a tile matrix derived from the
//! grid, so the produced file opens in GeoPackage-aware tools. Tile rows
//! are counted top-down as the spec demands, matching north-west origin
//! grids directly.

use crate::sqlite_pool::{open_pool, SqlitePool};
use crate::{BackendCapabilities, CacheBackend};
use anyhow::{ensure, Result};
use async_trait::async_trait;
use rusqlite::params;
use std::{fmt::Debug, path::Path, time::Duration};
use tilegate_core::{CacheError, Tile, TileCoord, TileData, TileFormat, TileGrid};

pub struct GeoPackageCache {
	name: String,
	table: String,
	pool: SqlitePool,
	format: TileFormat,
}

impl GeoPackageCache {
	pub fn open(
		path: &Path,
		table: &str,
		grid: &TileGrid,
		format: TileFormat,
		timeout: Duration,
	) -> Result<GeoPackageCache> {
		ensure!(
			table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
			"invalid GeoPackage table name '{table}'"
		);
		let pool = open_pool(path, timeout, false)?;
		let cache = GeoPackageCache {
			name: path.display().to_string(),
			table: table.to_string(),
			pool,
			format,
		};
		cache.init_schema(grid)?;
		Ok(cache)
	}

	fn init_schema(&self, grid: &TileGrid) -> Result<()> {
		let conn = self.pool.get()?;
		conn.execute_batch(&format!(
			"PRAGMA application_id = 0x47504B47;
			CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
				srs_name TEXT NOT NULL,
				srs_id INTEGER NOT NULL PRIMARY KEY,
				organization TEXT NOT NULL,
				organization_coordsys_id INTEGER NOT NULL,
				definition TEXT NOT NULL,
				description TEXT
			);
			CREATE TABLE IF NOT EXISTS gpkg_contents (
				table_name TEXT NOT NULL PRIMARY KEY,
				data_type TEXT NOT NULL,
				identifier TEXT UNIQUE,
				description TEXT DEFAULT '',
				last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
				min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE,
				srs_id INTEGER
			);
			CREATE TABLE IF NOT EXISTS gpkg_tile_matrix_set (
				table_name TEXT NOT NULL PRIMARY KEY,
				srs_id INTEGER NOT NULL,
				min_x DOUBLE NOT NULL, min_y DOUBLE NOT NULL,
				max_x DOUBLE NOT NULL, max_y DOUBLE NOT NULL
			);
			CREATE TABLE IF NOT EXISTS gpkg_tile_matrix (
				table_name TEXT NOT NULL,
				zoom_level INTEGER NOT NULL,
				matrix_width INTEGER NOT NULL,
				matrix_height INTEGER NOT NULL,
				tile_width INTEGER NOT NULL,
				tile_height INTEGER NOT NULL,
				pixel_x_size DOUBLE NOT NULL,
				pixel_y_size DOUBLE NOT NULL,
				CONSTRAINT pk_ttm PRIMARY KEY (table_name, zoom_level)
			);
			CREATE TABLE IF NOT EXISTS \"{table}\" (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				zoom_level INTEGER NOT NULL,
				tile_column INTEGER NOT NULL,
				tile_row INTEGER NOT NULL,
				tile_data BLOB NOT NULL,
				UNIQUE (zoom_level, tile_column, tile_row)
			);",
			table = self.table,
		))?;

		let srs_id = grid.srs().code() as i64;
		conn.execute(
			"INSERT OR IGNORE INTO gpkg_spatial_ref_sys
			 (srs_name, srs_id, organization, organization_coordsys_id, definition)
			 VALUES (?1, ?2, 'EPSG', ?3, 'undefined')",
			params![grid.srs().to_string(), srs_id, srs_id],
		)?;

		let bbox = grid.bbox();
		conn.execute(
			"INSERT OR IGNORE INTO gpkg_contents (table_name, data_type, identifier, min_x, min_y, max_x, max_y, srs_id)
			 VALUES (?1, 'tiles', ?1, ?2, ?3, ?4, ?5, ?6)",
			params![self.table, bbox.0, bbox.1, bbox.2, bbox.3, srs_id],
		)?;
		conn.execute(
			"INSERT OR IGNORE INTO gpkg_tile_matrix_set (table_name, srs_id, min_x, min_y, max_x, max_y)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
			params![self.table, srs_id, bbox.0, bbox.1, bbox.2, bbox.3],
		)?;

		let (tile_w, tile_h) = grid.tile_size();
		for z in 0..grid.num_levels() {
			let res = grid.resolution(z)?;
			let (w, h) = grid.grid_sizes(z)?;
			conn.execute(
				"INSERT OR IGNORE INTO gpkg_tile_matrix
				 (table_name, zoom_level, matrix_width, matrix_height, tile_width, tile_height, pixel_x_size, pixel_y_size)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
				params![self.table, z, w, h, tile_w, tile_h, res, res],
			)?;
		}
		Ok(())
	}
}

#[async_trait]
impl CacheBackend for GeoPackageCache {
	fn backend_name(&self) -> &str {
		"geopackage"
	}

	fn cache_layout(&self) -> &str {
		"geopackage"
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities {
			supports_link_identical: false,
			is_persistent: true,
			supports_mtime: false,
		}
	}

	async fn load(&self, coord: &TileCoord, _with_metadata: bool) -> Result<Tile> {
		let conn = self.pool.get()?;
		let mut stmt = conn.prepare_cached(&format!(
			"SELECT tile_data FROM \"{}\" WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
			self.table
		))?;
		let result = stmt.query_row(params![coord.z, coord.x, coord.y], |row| row.get::<_, Vec<u8>>(0));
		match result {
			Ok(bytes) if bytes.is_empty() => Ok(Tile::new(*coord, TileData::Empty)),
			Ok(bytes) => Ok(Tile::new(*coord, TileData::bytes(bytes, self.format))),
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
			let mut stmt = tx.prepare_cached(&format!(
				"INSERT OR REPLACE INTO \"{}\" (zoom_level, tile_column, tile_row, tile_data)
				 VALUES (?1, ?2, ?3, ?4)",
				self.table
			))?;
			for tile in tiles {
				let blob: &[u8] = match &tile.data {
					TileData::Bytes { bytes, .. } => bytes,
					TileData::Empty => &[],
					TileData::Missing => continue,
				};
				stmt.execute(params![tile.coord.z, tile.coord.x, tile.coord.y, blob])?;
			}
		}
		tx.commit()?;
		Ok(())
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		let conn = self.pool.get()?;
		conn.execute(
			&format!(
				"DELETE FROM \"{}\" WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
				self.table
			),
			params![coord.z, coord.x, coord.y],
		)?;
		Ok(())
	}
}

impl Debug for GeoPackageCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("GeoPackageCache")
			.field("name", &self.name)
			.field("table", &self.table)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use lazy_static::lazy_static;

	lazy_static! {
		static ref GRID: TileGrid = TileGrid::web_mercator();
	}

	fn open(dir: &assert_fs::TempDir) -> GeoPackageCache {
		GeoPackageCache::open(
			&dir.path().join("tiles.gpkg"),
			"osm_tiles",
			&GRID,
			TileFormat::PNG,
			Duration::from_secs(5),
		)
		.unwrap()
	}

	#[tokio::test]
	async fn registry_tables_are_populated() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = open(&dir);
		let conn = cache.pool.get().unwrap();

		let srs: i64 = conn
			.query_row("SELECT srs_id FROM gpkg_contents WHERE table_name = 'osm_tiles'", [], |r| r.get(0))
			.unwrap();
		assert_eq!(srs, 3857);

		let levels: i64 = conn
			.query_row("SELECT COUNT(*) FROM gpkg_tile_matrix WHERE table_name = 'osm_tiles'", [], |r| {
				r.get(0)
			})
			.unwrap();
		assert_eq!(levels, 20);

		let (w, h): (i64, i64) = conn
			.query_row(
				"SELECT matrix_width, matrix_height FROM gpkg_tile_matrix WHERE zoom_level = 3",
				[],
				|r| Ok((r.get(0)?, r.get(1)?)),
			)
			.unwrap();
		assert_eq!((w, h), (8, 8));
	}

	#[tokio::test]
	async fn round_trip() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = open(&dir);
		let coord = TileCoord::new(3, 4, 5);
		cache
			.store(&Tile::new(coord, TileData::bytes(vec![7, 8], TileFormat::PNG)))
			.await
			.unwrap();
		assert_eq!(cache.load(&coord, false).await.unwrap().data.len(), 2);
		cache.remove(&coord).await.unwrap();
		assert!(cache.load(&coord, false).await.unwrap().data.is_missing());
	}

	#[test]
	fn rejects_sql_injection_table_names() {
		let dir = assert_fs::TempDir::new().unwrap();
		let result = GeoPackageCache::open(
			&dir.path().join("evil.gpkg"),
			"tiles; DROP TABLE x",
			&GRID,
			TileFormat::PNG,
			Duration::from_secs(5),
		);
		assert!(result.is_err());
	}
}
