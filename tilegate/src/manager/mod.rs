//! The tile manager: the scheduler between cache and sources.
//!
//! Accepts tile and map requests against one cache/grid pair. Cache
//! misses are grouped into meta-tiles, each computed at most once per
//! fingerprint under the tile locker, rendered from the sources, split
//! back into tiles and stored. The manager itself is stateless apart
//! from the locker and the backend handle, so it can be used reentrantly
//! (a cache acting as the source of another cache goes through a second
//! manager instance).

mod creation;

use crate::source::{MapQuery, Source};
use anyhow::{ensure, Context, Result};
use image::DynamicImage;
use log::{debug, warn};
use std::{sync::Arc, time::SystemTime};
use tilegate_cache::CacheBackend;
use tilegate_core::{
	CacheOpts, Coverage, GlobalConfig, MapBBox, MetaGrid, Srs, SrsRegistry, Tile, TileCoord,
	TileData, TileFormat, TileGrid, TileLocker,
};
use tilegate_image::{apply_watermark, ImageOpts, ImageTransformer, MapImage};
use tokio::sync::Semaphore;

/// Whether a request comes from live serving or from the seeder; seeding
/// retries transient source failures much longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationMode {
	Live,
	Seed,
}

impl CreationMode {
	pub(crate) fn attempts(&self) -> u32 {
		match self {
			CreationMode::Live => 2,
			CreationMode::Seed => 100,
		}
	}
}

/// Builds a [`TileManager`]; everything not set falls back to the global
/// configuration.
pub struct TileManagerBuilder {
	name: String,
	grid: Arc<TileGrid>,
	cache: Arc<dyn CacheBackend>,
	sources: Vec<Arc<dyn Source>>,
	globals: Arc<GlobalConfig>,
	registry: Arc<SrsRegistry>,
	opts: CacheOpts,
	locker: Option<Arc<TileLocker>>,
	coverage: Option<Coverage>,
	image_opts: Option<ImageOpts>,
}

impl TileManagerBuilder {
	pub fn new(
		name: &str,
		grid: Arc<TileGrid>,
		cache: Arc<dyn CacheBackend>,
		sources: Vec<Arc<dyn Source>>,
		globals: Arc<GlobalConfig>,
		registry: Arc<SrsRegistry>,
	) -> TileManagerBuilder {
		let opts = CacheOpts::new(name, &globals);
		TileManagerBuilder {
			name: name.to_string(),
			grid,
			cache,
			sources,
			globals,
			registry,
			opts,
			locker: None,
			coverage: None,
			image_opts: None,
		}
	}

	pub fn with_opts(mut self, opts: CacheOpts) -> TileManagerBuilder {
		self.opts = opts;
		self
	}

	pub fn with_locker(mut self, locker: Arc<TileLocker>) -> TileManagerBuilder {
		self.locker = Some(locker);
		self
	}

	/// Restricts where tiles are computed and stored.
	pub fn with_coverage(mut self, coverage: Coverage) -> TileManagerBuilder {
		self.coverage = Some(coverage);
		self
	}

	pub fn with_image_opts(mut self, image_opts: ImageOpts) -> TileManagerBuilder {
		self.image_opts = Some(image_opts);
		self
	}

	pub fn build(self) -> Result<Arc<TileManager>> {
		let meta_size = if self.opts.bulk_meta_tiles {
			(1, 1)
		} else {
			self.opts.meta_size
		};
		let meta_grid = MetaGrid::new(self.grid.clone(), meta_size, self.opts.meta_buffer)?;
		let locker = self.locker.unwrap_or_else(|| {
			Arc::new(TileLocker::new(std::time::Duration::from_secs(60)))
		});
		let image_opts = self.image_opts.unwrap_or_else(|| ImageOpts {
			format: self.opts.format,
			transparent: true,
			jpeg_quality: self.globals.image.jpeg_quality,
			resampling: self.globals.image.resampling,
			..ImageOpts::default()
		});
		let coverage = match self.coverage {
			// the gate runs in grid coordinates
			Some(coverage) => Some(coverage.transform_to(self.grid.srs(), &self.registry)?),
			None => None,
		};

		Ok(Arc::new(TileManager {
			name: self.name,
			meta_grid,
			grid: self.grid,
			cache: self.cache,
			sources: self.sources,
			locker,
			transformer: ImageTransformer::new(self.registry.clone()),
			registry: self.registry,
			creators: Arc::new(Semaphore::new(self.opts.concurrent_tile_creators.max(1))),
			renderers: Arc::new(Semaphore::new(num_cpus::get().max(2))),
			coverage,
			image_opts,
			opts: self.opts,
			globals: self.globals,
		}))
	}
}

/// See the module documentation.
pub struct TileManager {
	name: String,
	grid: Arc<TileGrid>,
	meta_grid: MetaGrid,
	cache: Arc<dyn CacheBackend>,
	sources: Vec<Arc<dyn Source>>,
	locker: Arc<TileLocker>,
	transformer: ImageTransformer,
	registry: Arc<SrsRegistry>,
	/// Bounds concurrently built meta-tiles (`concurrent_tile_creators`).
	creators: Arc<Semaphore>,
	/// Bounds parallel source calls composing one image.
	renderers: Arc<Semaphore>,
	coverage: Option<Coverage>,
	image_opts: ImageOpts,
	opts: CacheOpts,
	globals: Arc<GlobalConfig>,
}

impl TileManager {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn grid(&self) -> &Arc<TileGrid> {
		&self.grid
	}

	pub fn cache(&self) -> &Arc<dyn CacheBackend> {
		&self.cache
	}

	pub fn opts(&self) -> &CacheOpts {
		&self.opts
	}

	pub fn sources(&self) -> &[Arc<dyn Source>] {
		&self.sources
	}

	pub(crate) fn registry(&self) -> &Arc<SrsRegistry> {
		&self.registry
	}

	/// The joint coverage of cache and sources, if any restricts.
	pub fn coverage(&self) -> Option<&Coverage> {
		self.coverage.as_ref()
	}

	/// Loads one tile, creating it on a miss.
	pub async fn get_tile(self: &Arc<Self>, coord: TileCoord) -> Result<Tile> {
		ensure!(
			self.grid.contains_coord(&coord),
			"tile {coord:?} outside grid '{}'",
			self.grid.name()
		);
		let mut tiles = self.load_tiles(&[coord], CreationMode::Live).await?;
		Ok(tiles.remove(0))
	}

	/// Loads `coords`, creating misses via the meta-tile machinery.
	/// The returned vector parallels `coords`.
	pub async fn load_tiles(
		self: &Arc<Self>,
		coords: &[TileCoord],
		mode: CreationMode,
	) -> Result<Vec<Tile>> {
		let mut tiles = self.cache.load_many(coords, true).await?;

		let mut missing: Vec<TileCoord> = Vec::new();
		let mut stale: Vec<TileCoord> = Vec::new();
		for tile in &tiles {
			match self.classify(tile) {
				TileState::Fresh => {}
				TileState::Missing => missing.push(tile.coord),
				TileState::Stale => stale.push(tile.coord),
			}
		}

		if !stale.is_empty() {
			if self.opts.refresh_while_serving && mode == CreationMode::Live {
				// serve stale data now, refresh behind the request
				self.spawn_refresh(stale);
			} else {
				missing.extend(stale);
			}
		}

		if !missing.is_empty() {
			let created = self.create_tiles(&missing, mode).await?;
			let refreshed = self.cache.load_many(coords, true).await?;
			for (slot, fresh) in tiles.iter_mut().zip(refreshed) {
				if missing.contains(&slot.coord) {
					*slot = if fresh.is_cached() {
						fresh
					} else {
						// not stored (disable_storage, error substitution,
						// outside coverage): serve the in-memory result
						created
							.iter()
							.find(|t| t.coord == slot.coord)
							.cloned()
							.unwrap_or_else(|| Tile::missing(slot.coord))
					};
				}
			}
		}

		Ok(tiles)
	}

	fn classify(&self, tile: &Tile) -> TileState {
		if !tile.is_cached() {
			return TileState::Missing;
		}
		if let (Some(policy), Some(mtime)) = (&self.opts.remove_before, tile.mtime) {
			if policy.is_expired(mtime) {
				return TileState::Missing;
			}
		}
		if let (Some(policy), Some(mtime)) = (&self.opts.refresh_before, tile.mtime) {
			if policy.is_expired(mtime) {
				return TileState::Stale;
			}
		}
		TileState::Fresh
	}

	fn spawn_refresh(self: &Arc<Self>, coords: Vec<TileCoord>) {
		let manager = self.clone();
		tokio::spawn(async move {
			debug!("background refresh of {} tiles", coords.len());
			if let Err(err) = manager.create_tiles(&coords, CreationMode::Live).await {
				warn!("background refresh failed: {err:#}");
			}
		});
	}

	/// Whether a map request at `res`/`level` bypasses the cache.
	pub fn use_direct(&self, res: f64, level: u8) -> bool {
		if let Some(direct_level) = self.opts.use_direct_from_level {
			if level >= direct_level {
				return true;
			}
		}
		if let Some(direct_res) = self.opts.use_direct_from_res {
			if res <= direct_res {
				return true;
			}
		}
		false
	}

	/// Produces a map image for an arbitrary bbox/SRS/size request from
	/// cached tiles (creating misses as needed).
	pub async fn get_map(
		self: &Arc<Self>,
		bbox: &MapBBox,
		srs: Srs,
		size: (u32, u32),
		mode: CreationMode,
	) -> Result<MapImage> {
		let grid_bbox = self.registry.transform_bbox(srs, self.grid.srs(), bbox)?;
		let res = grid_bbox.resolution_for_size(size);
		let level = self.grid.level_for_res(res);

		if self.use_direct(res, level) {
			let query = MapQuery {
				bbox: *bbox,
				size,
				srs,
				format: self.opts.request_format(),
				transparent: self.image_opts.transparent,
			};
			let rendered = self
				.render_sources(&query, mode)
				.await?
				.map(|r| r.image)
				.unwrap_or_else(|| MapImage::blank(size, *bbox, srs, self.image_opts.clone()));
			return Ok(rendered);
		}

		let range = self.grid.tiles_for_bbox(&grid_bbox, level)?;
		ensure!(
			range.len() <= self.globals.cache.max_tile_limit,
			"request covers {} tiles, limit is {}",
			range.len(),
			self.globals.cache.max_tile_limit
		);
		if range.is_empty() {
			return Ok(MapImage::blank(size, *bbox, srs, self.image_opts.clone()));
		}

		let coords: Vec<TileCoord> = range.iter().collect();
		let tiles = self.load_tiles(&coords, mode).await?;

		// assemble the canvas in grid space, then transform to the request
		let canvas_bbox = self.grid.range_bbox(&range);
		let (tile_w, tile_h) = self.grid.tile_size();
		let canvas_size = (
			(range.x1 - range.x0 + 1) * tile_w,
			(range.y1 - range.y0 + 1) * tile_h,
		);
		let mut canvas = MapImage::blank(
			canvas_size,
			canvas_bbox,
			self.grid.srs(),
			self.image_opts.clone(),
		)
		.to_rgba();

		for tile in &tiles {
			let TileData::Bytes { bytes, .. } = &tile.data else {
				continue;
			};
			let decoded = match tilegate_image::decode(bytes) {
				Ok(decoded) => decoded.to_rgba8(),
				Err(err) => {
					warn!("corrupt tile {:?} in cache '{}': {err:#}", tile.coord, self.name);
					continue;
				}
			};
			let px = (tile.coord.x - range.x0) * tile_w;
			let py = match self.grid.origin() {
				tilegate_core::GridOrigin::NorthWest => (tile.coord.y - range.y0) * tile_h,
				tilegate_core::GridOrigin::SouthWest => (range.y1 - tile.coord.y) * tile_h,
			};
			image::imageops::replace(&mut canvas, &decoded, i64::from(px), i64::from(py));
		}

		let canvas = MapImage::new(
			DynamicImage::ImageRgba8(canvas),
			canvas_bbox,
			self.grid.srs(),
			self.image_opts.clone(),
		);
		let mut out = self
			.transformer
			.transform(&canvas, bbox, srs, size, self.image_opts.resampling)
			.context("assembling map image")?;

		if let Some(watermark) = &self.opts.watermark {
			apply_watermark(&mut out, watermark);
		}
		Ok(out)
	}

	/// Encodes a produced tile image in the cache's storage format.
	pub(crate) fn encode_tile(&self, coord: TileCoord, image: &MapImage) -> Result<Tile> {
		let encoded = image.encode_as(&self.storage_opts())?;
		Ok(
			Tile::new(coord, TileData::bytes(encoded.bytes, encoded.format))
				.with_mtime(SystemTime::now()),
		)
	}

	pub(crate) fn storage_opts(&self) -> ImageOpts {
		ImageOpts {
			format: self.opts.format,
			..self.image_opts.clone()
		}
	}

	/// A blank tile payload for empty markers served as images.
	pub fn empty_tile_bytes(&self) -> Result<(Vec<u8>, TileFormat)> {
		let (w, h) = self.grid.tile_size();
		let image = MapImage::blank(
			(w, h),
			MapBBox::new(0.0, 0.0, 1.0, 1.0),
			self.grid.srs(),
			self.image_opts.clone(),
		);
		let encoded = image.encode()?;
		Ok((encoded.bytes, encoded.format))
	}
}

enum TileState {
	Fresh,
	Stale,
	Missing,
}

impl std::fmt::Debug for TileManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TileManager")
			.field("name", &self.name)
			.field("grid", &self.grid.name())
			.field("cache", &self.cache.backend_name())
			.field("sources", &self.sources.len())
			.finish()
	}
}
