//! Miss resolution: meta-tile creation, source fan-out and retries.

use super::{CreationMode, TileManager};
use crate::source::{MapQuery, SourceResponse};
use anyhow::{anyhow, Result};
use futures::future::try_join_all;
use itertools::Itertools;
use log::{debug, info, warn};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tilegate_core::{
	LinkSingleColor, MetaTile, OnSourceErrors, SourceError, Tile, TileCoord, TileData,
};
use tilegate_image::{merge_layers, MapImage, MergeLayer};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(4);

impl TileManager {
	/// Creates the given missing tiles, grouped into meta-tiles. Each
	/// meta-tile is computed under its fingerprint lock; a second worker
	/// arriving while the first renders finds the tiles cached after the
	/// lock and triggers no upstream request.
	pub(crate) async fn create_tiles(
		self: &Arc<Self>,
		coords: &[TileCoord],
		mode: CreationMode,
	) -> Result<Vec<Tile>> {
		let metas: BTreeMap<(u8, u32, u32), Vec<TileCoord>> = coords
			.iter()
			.map(|coord| {
				let (mx, my) = self.meta_grid.meta_coord(coord);
				((coord.z, mx, my), *coord)
			})
			.into_group_map()
			.into_iter()
			.collect();

		let created = try_join_all(metas.into_iter().map(|((z, mx, my), missing)| {
			let manager = self.clone();
			async move {
				let _permit = manager
					.creators
					.clone()
					.acquire_owned()
					.await
					.expect("semaphore closed");
				manager.create_meta(z, mx, my, missing, mode).await
			}
		}))
		.await?;

		Ok(created.into_iter().flatten().collect())
	}

	async fn create_meta(
		self: &Arc<Self>,
		z: u8,
		mx: u32,
		my: u32,
		missing: Vec<TileCoord>,
		mode: CreationMode,
	) -> Result<Vec<Tile>> {
		let meta = if self.opts.minimize_meta_requests {
			self.meta_grid.minimized_meta_tile(z, mx, my, &missing)?
		} else {
			self.meta_grid.meta_tile(z, mx, my)?
		};
		let fingerprint = meta.fingerprint(&self.name, self.grid.name());

		let _lock = self.locker.lock(&fingerprint).await?;

		// another worker may have filled the tiles while we waited
		let current = self.cache.load_many(&missing, true).await?;
		let still_missing: Vec<TileCoord> = current
			.iter()
			.filter(|tile| !matches!(self.classify(tile), super::TileState::Fresh))
			.map(|tile| tile.coord)
			.collect();
		if still_missing.is_empty() {
			debug!("meta {fingerprint} already created elsewhere");
			return Ok(current);
		}

		// coverage can exclude the whole meta request
		if let Some(coverage) = &self.coverage {
			if !coverage.intersects(&meta.buffered_bbox) {
				return Ok(
					meta
						.tiles
						.iter()
						.map(|coord| Tile::new(coord, TileData::Empty))
						.collect(),
				);
			}
		}

		let query = MapQuery {
			bbox: meta.buffered_bbox,
			size: meta.pixel_size,
			srs: self.grid.srs(),
			format: self.opts.request_format(),
			transparent: self.image_opts.transparent,
		};

		let rendered = self.render_with_retries(&query, mode).await?;
		let tiles = match rendered {
			Some(response) => self.split_and_store(&meta, &response).await?,
			None => self.tiles_without_sources(&meta).await?,
		};
		Ok(tiles)
	}

	async fn render_with_retries(
		&self,
		query: &MapQuery,
		mode: CreationMode,
	) -> Result<Option<SourceResponse>> {
		let attempts = mode.attempts();
		let mut delay = RETRY_BASE_DELAY;
		let mut attempt = 1;
		loop {
			match self.render_sources(query, mode).await {
				Ok(result) => return Ok(result),
				Err(err) => {
					let transient = err
						.downcast_ref::<SourceError>()
						.map(SourceError::is_transient)
						.unwrap_or(false);
					if !transient || attempt >= attempts {
						return Err(err);
					}
					info!(
						"retrying source request (attempt {attempt}/{attempts}) after error: {err:#}"
					);
					tokio::time::sleep(delay).await;
					delay = (delay * 2).min(RETRY_MAX_DELAY);
					attempt += 1;
				}
			}
		}
	}

	/// Fans out to all eligible sources in parallel (bounded by the
	/// renderer semaphore) and merges the results bottom to top.
	/// `Ok(None)` means no source is responsible for this request.
	pub(crate) async fn render_sources(
		&self,
		query: &MapQuery,
		mode: CreationMode,
	) -> Result<Option<SourceResponse>> {
		let res = query.bbox.resolution_for_size(query.size);

		let mut eligible = Vec::new();
		for source in &self.sources {
			if source.is_seed_only() && mode == CreationMode::Live {
				continue;
			}
			if let Some(range) = source.res_range() {
				if !range.contains(res) {
					continue;
				}
			}
			if let Some(coverage) = source.coverage() {
				let source_bbox = self
					.registry
					.transform_bbox(query.srs, coverage.srs(), &query.bbox)?;
				// sources whose clipped area is empty are skipped silently
				if !coverage.intersects(&source_bbox) {
					continue;
				}
			}
			eligible.push(source.clone());
		}
		if eligible.is_empty() {
			return Ok(None);
		}

		let results = futures::future::join_all(eligible.iter().map(|source| {
			let source = source.clone();
			let mut query = query.clone();
			let renderers = self.renderers.clone();
			// fall back to a declared format when the request format is
			// outside the source's capabilities
			if !source.supports_format(query.format) {
				query.format = source.supported_formats()[0];
			}
			async move {
				let _permit = renderers.acquire_owned().await.expect("semaphore closed");
				source.get_map(&query).await
			}
		}))
		.await;

		let mut layers = Vec::with_capacity(results.len());
		let mut cacheable = true;
		let mut first_error = None;
		let mut failed = 0usize;
		for (source, result) in eligible.iter().zip(results) {
			match result {
				Ok(mut response) => {
					cacheable &= response.cacheable;
					if let Some(coverage) = source.coverage() {
						let coverage = coverage.transform_to(query.srs, &self.registry)?;
						if !coverage.contains(&query.bbox) {
							let mask = coverage.rasterize_mask(&query.bbox, query.size);
							response.image.apply_alpha_mask(&mask);
						}
					}
					layers.push(MergeLayer::new(response.image));
				}
				Err(err) => {
					failed += 1;
					match self.opts.on_source_errors {
						OnSourceErrors::Raise => return Err(err),
						OnSourceErrors::Notify => {
							warn!("source failed, substituting transparency: {err:#}");
							first_error.get_or_insert(err);
						}
						OnSourceErrors::Ignore => {
							first_error.get_or_insert(err);
						}
					}
					cacheable = false;
				}
			}
		}
		// substitution only papers over partial failures
		if failed == eligible.len() {
			return Err(first_error.unwrap_or_else(|| anyhow!("all sources failed")));
		}

		let image = merge_layers(
			layers,
			query.size,
			query.bbox,
			query.srs,
			self.image_opts.clone(),
			self.globals.image.merge_method,
		)?;
		Ok(Some(SourceResponse { image, cacheable }))
	}

	/// Splits a rendered meta image into tiles, stores the cacheable ones
	/// and returns all of them.
	async fn split_and_store(&self, meta: &MetaTile, response: &SourceResponse) -> Result<Vec<Tile>> {
		let (tile_w, tile_h) = self.grid.tile_size();
		let link_markers = self.opts.link_single_color_images != LinkSingleColor::Off;

		let mut tiles = Vec::with_capacity(meta.tiles.len());
		for (coord, (px, py)) in meta.tile_slices(self.grid()) {
			let tile_image = response.image.sub_image(px, py, tile_w, tile_h);
			let tile = if tile_image.is_blank() && link_markers {
				Tile::new(coord, TileData::Empty).with_mtime(std::time::SystemTime::now())
			} else {
				self.encode_tile(coord, &tile_image)?
			};
			tiles.push(tile);
		}

		if response.cacheable && !self.opts.disable_storage {
			let to_store: Vec<Tile> = tiles
				.iter()
				.filter(|tile| self.storable(&tile.coord))
				.cloned()
				.collect();
			if let Err(err) = self.cache.store_many(&to_store).await {
				// a failed write must not fail the request
				warn!("cache write to '{}' failed: {err:#}", self.name);
			}
		}
		Ok(tiles)
	}

	/// Coverage gates cache writes: tiles without any covered area are
	/// not persisted.
	fn storable(&self, coord: &TileCoord) -> bool {
		match &self.coverage {
			Some(coverage) => coverage.intersects(&self.grid.tile_bbox(coord)),
			None => true,
		}
	}

	/// No responsible source: tiles are rebuilt from other cached levels
	/// when `upscale_tiles`/`downscale_tiles` allows, blank otherwise.
	async fn tiles_without_sources(&self, meta: &MetaTile) -> Result<Vec<Tile>> {
		let mut tiles = Vec::with_capacity(meta.tiles.len());
		let mut rescaled = Vec::new();
		for coord in meta.tiles.iter() {
			match self.rescale_from_levels(&coord).await? {
				Some(image) => {
					let tile = self.encode_tile(coord, &image)?;
					rescaled.push(tile.clone());
					tiles.push(tile);
				}
				None => tiles.push(Tile::new(coord, TileData::Empty)),
			}
		}
		if !rescaled.is_empty() && !self.opts.disable_storage {
			if let Err(err) = self.cache.store_many(&rescaled).await {
				warn!("cache write to '{}' failed: {err:#}", self.name);
			}
		}
		Ok(tiles)
	}

	/// Builds a tile image from coarser (`upscale_tiles`) or finer
	/// (`downscale_tiles`) cached levels.
	async fn rescale_from_levels(&self, coord: &TileCoord) -> Result<Option<MapImage>> {
		let bbox = self.grid.tile_bbox(coord);
		let size = self.grid.tile_size();

		if let Some(max_down) = self.opts.downscale_tiles {
			for dz in 1..=max_down {
				let Some(z) = coord.z.checked_add(dz).filter(|z| *z < self.grid.num_levels()) else {
					break;
				};
				if let Some(image) = self.assemble_cached(&bbox, z).await? {
					return Ok(Some(self.transformer.transform(
						&image,
						&bbox,
						self.grid.srs(),
						size,
						self.image_opts.resampling,
					)?));
				}
			}
		}
		if let Some(max_up) = self.opts.upscale_tiles {
			for dz in 1..=max_up {
				let Some(z) = coord.z.checked_sub(dz) else {
					break;
				};
				if let Some(image) = self.assemble_cached(&bbox, z).await? {
					return Ok(Some(self.transformer.transform(
						&image,
						&bbox,
						self.grid.srs(),
						size,
						self.image_opts.resampling,
					)?));
				}
			}
		}
		Ok(None)
	}

	/// Assembles `bbox` from level `z` using only already-cached tiles;
	/// `None` when any needed tile is missing.
	async fn assemble_cached(&self, bbox: &tilegate_core::MapBBox, z: u8) -> Result<Option<MapImage>> {
		let range = self.grid.tiles_for_bbox(bbox, z)?;
		if range.is_empty() {
			return Ok(None);
		}
		let coords: Vec<TileCoord> = range.iter().collect();
		let tiles = self.cache.load_many(&coords, false).await?;
		if tiles.iter().any(|tile| !tile.is_cached()) {
			return Ok(None);
		}

		let (tile_w, tile_h) = self.grid.tile_size();
		let canvas_bbox = self.grid.range_bbox(&range);
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
			let decoded = tilegate_image::decode(bytes)?.to_rgba8();
			let px = (tile.coord.x - range.x0) * tile_w;
			let py = match self.grid.origin() {
				tilegate_core::GridOrigin::NorthWest => (tile.coord.y - range.y0) * tile_h,
				tilegate_core::GridOrigin::SouthWest => (range.y1 - tile.coord.y) * tile_h,
			};
			image::imageops::replace(&mut canvas, &decoded, i64::from(px), i64::from(py));
		}
		Ok(Some(MapImage::new(
			image::DynamicImage::ImageRgba8(canvas),
			canvas_bbox,
			self.grid.srs(),
			self.image_opts.clone(),
		)))
	}
}
