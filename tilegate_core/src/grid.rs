//! Quantized tile pyramids.
//!
//! A [`TileGrid`] maps between map coordinates and tile addresses: it owns
//! the resolution ladder, the tile size, the grid origin and the bbox the
//! pyramid partitions. [`MetaGrid`] groups adjacent tiles of one grid into
//! meta-tiles with a pixel buffer for rendering.
//!
//! # Examples
//!
//! ```
//! use tilegate_core::{TileGrid, TileCoord};
//!
//! let grid = TileGrid::web_mercator();
//! let bbox = grid.tile_bbox(&TileCoord::new(0, 0, 0));
//! assert!((bbox.width() - 2.0 * 20037508.342789244).abs() < 1e-3);
//! ```

use crate::{MapBBox, Srs, TileCoord};
use anyhow::{bail, ensure, Result};
use std::fmt::Debug;
use std::sync::Arc;

const WEBMERCATOR_EXTENT: f64 = 20037508.342789244;
const DEFAULT_NUM_LEVELS: u8 = 20;
const DEFAULT_STRETCH_FACTOR: f64 = 1.15;

/// Which corner of the grid bbox tile `(0, 0)` is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridOrigin {
	/// TMS style, y grows northward.
	#[default]
	SouthWest,
	/// XYZ/WMTS style, y grows southward.
	NorthWest,
}

/// Step between two adjacent resolutions of a generated ladder.
#[derive(Debug, Clone, PartialEq)]
pub enum ResFactor {
	Factor(f64),
	Sqrt2,
}

impl ResFactor {
	fn value(&self) -> f64 {
		match self {
			ResFactor::Factor(f) => *f,
			ResFactor::Sqrt2 => std::f64::consts::SQRT_2,
		}
	}
}

impl Default for ResFactor {
	fn default() -> Self {
		ResFactor::Factor(2.0)
	}
}

/// Configuration for [`TileGrid::new`]. Comes out of the (externally
/// validated) `grids:` configuration section.
#[derive(Debug, Clone)]
pub struct GridOpts {
	pub name: String,
	pub srs: Srs,
	pub bbox: MapBBox,
	pub tile_size: (u32, u32),
	pub origin: GridOrigin,
	/// Explicit resolution ladder; wins over all generation options.
	pub res: Option<Vec<f64>>,
	pub res_factor: ResFactor,
	/// Resolution of level 0 (the coarsest).
	pub min_res: Option<f64>,
	/// Finest resolution; truncates the generated ladder.
	pub max_res: Option<f64>,
	pub num_levels: Option<u8>,
	/// Explicit switch resolutions between levels, overriding the
	/// stretch rule where they apply.
	pub threshold_res: Option<Vec<f64>>,
	pub stretch_factor: f64,
}

impl GridOpts {
	pub fn new(name: &str, srs: Srs, bbox: MapBBox) -> GridOpts {
		GridOpts {
			name: name.to_string(),
			srs,
			bbox,
			tile_size: (256, 256),
			origin: GridOrigin::default(),
			res: None,
			res_factor: ResFactor::default(),
			min_res: None,
			max_res: None,
			num_levels: None,
			threshold_res: None,
			stretch_factor: DEFAULT_STRETCH_FACTOR,
		}
	}
}

/// A named, immutable tile pyramid in a single SRS.
#[derive(Clone)]
pub struct TileGrid {
	name: String,
	srs: Srs,
	bbox: MapBBox,
	tile_size: (u32, u32),
	origin: GridOrigin,
	resolutions: Vec<f64>,
	threshold_res: Option<Vec<f64>>,
	stretch_factor: f64,
}

impl TileGrid {
	pub fn new(opts: GridOpts) -> Result<TileGrid> {
		opts.bbox.check()?;
		ensure!(!opts.bbox.is_degenerate(), "grid bbox must cover an area");
		ensure!(
			opts.tile_size.0 > 0 && opts.tile_size.1 > 0,
			"tile size must be positive"
		);
		ensure!(opts.stretch_factor >= 1.0, "stretch_factor must be >= 1.0");

		let resolutions = match &opts.res {
			Some(res) => {
				ensure!(!res.is_empty(), "grid '{}' has an empty resolution list", opts.name);
				for pair in res.windows(2) {
					ensure!(
						pair[0] > pair[1],
						"grid '{}': resolutions must be strictly decreasing ({} -> {})",
						opts.name,
						pair[0],
						pair[1]
					);
				}
				res.clone()
			}
			None => Self::generate_resolutions(&opts)?,
		};

		Ok(TileGrid {
			name: opts.name,
			srs: opts.srs,
			bbox: opts.bbox,
			tile_size: opts.tile_size,
			origin: opts.origin,
			resolutions,
			threshold_res: opts.threshold_res.map(|mut t| {
				t.sort_by(|a, b| b.partial_cmp(a).unwrap());
				t
			}),
			stretch_factor: opts.stretch_factor,
		})
	}

	fn generate_resolutions(opts: &GridOpts) -> Result<Vec<f64>> {
		let factor = opts.res_factor.value();
		ensure!(factor > 1.0, "res_factor must be > 1.0");

		let base = match opts.min_res {
			Some(res) => res,
			None => {
				let (tw, th) = opts.tile_size;
				(opts.bbox.width() / f64::from(tw)).max(opts.bbox.height() / f64::from(th))
			}
		};
		ensure!(base > 0.0, "base resolution must be positive");

		let num_levels = opts.num_levels.unwrap_or(DEFAULT_NUM_LEVELS);
		ensure!(num_levels > 0, "num_levels must be positive");

		let mut resolutions = Vec::with_capacity(num_levels as usize);
		let mut res = base;
		for _ in 0..num_levels {
			if let Some(max_res) = opts.max_res {
				if res < max_res && !resolutions.is_empty() {
					break;
				}
			}
			resolutions.push(res);
			res /= factor;
		}
		Ok(resolutions)
	}

	/// The default global web mercator grid (`GLOBAL_WEBMERCATOR`):
	/// EPSG:3857, 20 levels, 256px tiles, north-west origin.
	pub fn web_mercator() -> TileGrid {
		let mut opts = GridOpts::new(
			"GLOBAL_WEBMERCATOR",
			Srs::WEBMERCATOR,
			MapBBox::new(
				-WEBMERCATOR_EXTENT,
				-WEBMERCATOR_EXTENT,
				WEBMERCATOR_EXTENT,
				WEBMERCATOR_EXTENT,
			),
		);
		opts.origin = GridOrigin::NorthWest;
		TileGrid::new(opts).unwrap()
	}

	/// The default global geodetic grid (`GLOBAL_GEODETIC`): EPSG:4326,
	/// two tiles at level 0, south-west origin.
	pub fn global_geodetic() -> TileGrid {
		let mut opts = GridOpts::new(
			"GLOBAL_GEODETIC",
			Srs::WGS84,
			MapBBox::new(-180.0, -90.0, 180.0, 90.0),
		);
		opts.min_res = Some(180.0 / 256.0);
		TileGrid::new(opts).unwrap()
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn srs(&self) -> Srs {
		self.srs
	}

	pub fn bbox(&self) -> &MapBBox {
		&self.bbox
	}

	pub fn tile_size(&self) -> (u32, u32) {
		self.tile_size
	}

	pub fn origin(&self) -> GridOrigin {
		self.origin
	}

	pub fn num_levels(&self) -> u8 {
		self.resolutions.len() as u8
	}

	pub fn resolutions(&self) -> &[f64] {
		&self.resolutions
	}

	pub fn resolution(&self, z: u8) -> Result<f64> {
		self
			.resolutions
			.get(z as usize)
			.copied()
			.ok_or_else(|| anyhow::anyhow!("grid '{}' has no level {z}", self.name))
	}

	/// The level that serves a request of pixel resolution `res`.
	///
	/// A finer level serves coarser requests up to `stretch_factor`
	/// (cached tiles are stretched instead of switching to the next
	/// coarser level); explicit `threshold_res` entries override the
	/// stretch rule between the two levels they fall between. Requests
	/// finer than the finest level map to the finest level.
	pub fn level_for_res(&self, res: f64) -> u8 {
		let last = self.resolutions.len() - 1;
		for k in 0..last {
			let next = self.resolutions[k + 1];
			let boundary = self
				.threshold(self.resolutions[k], next)
				.unwrap_or(next * self.stretch_factor);
			if res > boundary {
				return k as u8;
			}
		}
		last as u8
	}

	fn threshold(&self, coarser: f64, finer: f64) -> Option<f64> {
		self
			.threshold_res
			.as_ref()?
			.iter()
			.find(|t| **t <= coarser && **t > finer)
			.copied()
	}

	/// Number of tiles per axis at level `z`.
	pub fn grid_sizes(&self, z: u8) -> Result<(u32, u32)> {
		let res = self.resolution(z)?;
		let w = (self.bbox.width() / (res * f64::from(self.tile_size.0)) - 1e-9).ceil() as u32;
		let h = (self.bbox.height() / (res * f64::from(self.tile_size.1)) - 1e-9).ceil() as u32;
		Ok((w.max(1), h.max(1)))
	}

	/// Whether `coord` addresses a tile inside this grid.
	pub fn contains_coord(&self, coord: &TileCoord) -> bool {
		match self.grid_sizes(coord.z) {
			Ok((w, h)) => coord.x < w && coord.y < h,
			Err(_) => false,
		}
	}

	/// The extent of one tile. Tiles on the far edge of an unevenly
	/// divided grid extend beyond the grid bbox; requests are clipped to
	/// the grid bbox separately.
	pub fn tile_bbox(&self, coord: &TileCoord) -> MapBBox {
		let res = self.resolutions[coord.z as usize];
		let tile_w = res * f64::from(self.tile_size.0);
		let tile_h = res * f64::from(self.tile_size.1);
		let x0 = self.bbox.0 + f64::from(coord.x) * tile_w;
		let (y0, y1) = match self.origin {
			GridOrigin::SouthWest => {
				let y0 = self.bbox.1 + f64::from(coord.y) * tile_h;
				(y0, y0 + tile_h)
			}
			GridOrigin::NorthWest => {
				let y1 = self.bbox.3 - f64::from(coord.y) * tile_h;
				(y1 - tile_h, y1)
			}
		};
		MapBBox::new(x0, y0, x0 + tile_w, y1)
	}

	/// The joint extent of a tile range (all tiles at `range.z`).
	pub fn range_bbox(&self, range: &TileRange) -> MapBBox {
		let mut bbox = self.tile_bbox(&TileCoord::new(range.z, range.x0, range.y0));
		bbox.extend(&self.tile_bbox(&TileCoord::new(range.z, range.x1, range.y1)));
		bbox
	}

	/// All tiles at level `z` whose extent intersects `bbox`, clipped to
	/// the grid. Edges lying exactly on tile boundaries do not pull in the
	/// neighboring row/column.
	pub fn tiles_for_bbox(&self, bbox: &MapBBox, z: u8) -> Result<TileRange> {
		let res = self.resolution(z)?;
		let (grid_w, grid_h) = self.grid_sizes(z)?;
		let tile_w = res * f64::from(self.tile_size.0);
		let tile_h = res * f64::from(self.tile_size.1);

		let bbox = bbox.intersected(&self.bbox);
		if bbox.is_degenerate() {
			return Ok(TileRange::empty(z));
		}

		// snap coordinates that sit within a hundredth of a pixel of a
		// tile boundary onto the boundary before flooring
		let eps_x = tile_w * 1e-6;
		let eps_y = tile_h * 1e-6;
		let x0 = ((bbox.0 - self.bbox.0 + eps_x) / tile_w).floor().max(0.0) as u32;
		let x1 = ((bbox.2 - self.bbox.0 - eps_x) / tile_w).floor().max(0.0) as u32;
		let (y0, y1) = match self.origin {
			GridOrigin::SouthWest => (
				((bbox.1 - self.bbox.1 + eps_y) / tile_h).floor().max(0.0) as u32,
				((bbox.3 - self.bbox.1 - eps_y) / tile_h).floor().max(0.0) as u32,
			),
			GridOrigin::NorthWest => (
				((self.bbox.3 - bbox.3 + eps_y) / tile_h).floor().max(0.0) as u32,
				((self.bbox.3 - bbox.1 - eps_y) / tile_h).floor().max(0.0) as u32,
			),
		};

		Ok(TileRange {
			z,
			x0: x0.min(grid_w - 1),
			y0: y0.min(grid_h - 1),
			x1: x1.min(grid_w - 1),
			y1: y1.min(grid_h - 1),
		})
	}

	/// Converts between south-west and north-west row numbering.
	pub fn flip_tile_y(&self, z: u8, y: u32) -> Result<u32> {
		let (_, h) = self.grid_sizes(z)?;
		Ok(h - 1 - y)
	}

	/// Whether both grids tile the same pyramid (same SRS, bbox, sizes and
	/// ladder), ignoring origin and name.
	pub fn is_compatible_with(&self, other: &TileGrid) -> bool {
		self.srs == other.srs
			&& self.bbox == other.bbox
			&& self.tile_size == other.tile_size
			&& self.resolutions.len() == other.resolutions.len()
			&& self
				.resolutions
				.iter()
				.zip(&other.resolutions)
				.all(|(a, b)| (a - b).abs() <= a * 1e-9)
	}

	/// Builds a ladder whose resolutions coincide with `other` where the
	/// two ranges overlap, extended with `res_factor` steps outside.
	pub fn aligned_with(opts: GridOpts, other: &TileGrid) -> Result<TileGrid> {
		let factor = opts.res_factor.value();
		let num_levels = opts.num_levels.unwrap_or(DEFAULT_NUM_LEVELS) as usize;
		let base = match opts.min_res {
			Some(res) => res,
			None => {
				let (tw, th) = opts.tile_size;
				(opts.bbox.width() / f64::from(tw)).max(opts.bbox.height() / f64::from(th))
			}
		};

		let mut resolutions: Vec<f64> = Vec::with_capacity(num_levels);
		let mut res = base;
		while resolutions.len() < num_levels {
			// snap onto the other ladder when a resolution is within one
			// stretch step of an entry
			let snapped = other
				.resolutions
				.iter()
				.find(|r| **r <= res * opts.stretch_factor && **r >= res / opts.stretch_factor)
				.copied()
				.unwrap_or(res);
			if resolutions.last().map_or(true, |last| snapped < *last) {
				resolutions.push(snapped);
			}
			res = snapped / factor;
		}

		let mut opts = opts;
		opts.res = Some(resolutions);
		TileGrid::new(opts)
	}
}

impl Debug for TileGrid {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TileGrid")
			.field("name", &self.name)
			.field("srs", &self.srs)
			.field("bbox", &self.bbox)
			.field("levels", &self.resolutions.len())
			.finish()
	}
}

/// An inclusive rectangular range of tiles at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
	pub z: u8,
	pub x0: u32,
	pub y0: u32,
	pub x1: u32,
	pub y1: u32,
}

impl TileRange {
	pub fn empty(z: u8) -> TileRange {
		TileRange {
			z,
			x0: 1,
			y0: 1,
			x1: 0,
			y1: 0,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.x1 < self.x0 || self.y1 < self.y0
	}

	pub fn len(&self) -> usize {
		if self.is_empty() {
			0
		} else {
			((self.x1 - self.x0 + 1) as usize) * ((self.y1 - self.y0 + 1) as usize)
		}
	}

	pub fn contains(&self, coord: &TileCoord) -> bool {
		coord.z == self.z
			&& coord.x >= self.x0
			&& coord.x <= self.x1
			&& coord.y >= self.y0
			&& coord.y <= self.y1
	}

	pub fn iter(&self) -> impl Iterator<Item = TileCoord> + '_ {
		let range = *self;
		(range.y0..=range.y1).flat_map(move |y| (range.x0..=range.x1).map(move |x| TileCoord::new(range.z, x, y)))
	}
}

/// Groups tiles of a grid into meta-tiles for rendering.
#[derive(Debug, Clone)]
pub struct MetaGrid {
	grid: Arc<TileGrid>,
	meta_size: (u32, u32),
	meta_buffer: u32,
}

impl MetaGrid {
	pub fn new(grid: Arc<TileGrid>, meta_size: (u32, u32), meta_buffer: u32) -> Result<MetaGrid> {
		if meta_size.0 == 0 || meta_size.1 == 0 {
			bail!("meta_size must be positive");
		}
		Ok(MetaGrid {
			grid,
			meta_size,
			meta_buffer,
		})
	}

	pub fn meta_size(&self) -> (u32, u32) {
		self.meta_size
	}

	/// The meta-tile address containing `coord`.
	pub fn meta_coord(&self, coord: &TileCoord) -> (u32, u32) {
		(coord.x / self.meta_size.0, coord.y / self.meta_size.1)
	}

	/// The meta-tile at `(z, mx, my)`, clipped to the grid.
	pub fn meta_tile(&self, z: u8, mx: u32, my: u32) -> Result<MetaTile> {
		let (grid_w, grid_h) = self.grid.grid_sizes(z)?;
		let x0 = mx * self.meta_size.0;
		let y0 = my * self.meta_size.1;
		ensure!(x0 < grid_w && y0 < grid_h, "meta tile ({mx}, {my}) outside grid at level {z}");
		let tiles = TileRange {
			z,
			x0,
			y0,
			x1: (x0 + self.meta_size.0 - 1).min(grid_w - 1),
			y1: (y0 + self.meta_size.1 - 1).min(grid_h - 1),
		};
		self.build(z, mx, my, tiles)
	}

	/// A reduced meta-tile covering only `missing`, used when
	/// `minimize_meta_requests` is set: the request shrinks to the hull of
	/// the missing tiles and the buffer is only applied on hull edges that
	/// coincide with the full meta-tile's edges.
	pub fn minimized_meta_tile(&self, z: u8, mx: u32, my: u32, missing: &[TileCoord]) -> Result<MetaTile> {
		let full = self.meta_tile(z, mx, my)?;
		let inside: Vec<&TileCoord> = missing.iter().filter(|c| full.tiles.contains(c)).collect();
		ensure!(!inside.is_empty(), "no missing tiles inside meta ({mx}, {my})");

		let hull = TileRange {
			z,
			x0: inside.iter().map(|c| c.x).min().unwrap(),
			y0: inside.iter().map(|c| c.y).min().unwrap(),
			x1: inside.iter().map(|c| c.x).max().unwrap(),
			y1: inside.iter().map(|c| c.y).max().unwrap(),
		};

		let mut meta = self.build(z, mx, my, hull)?;
		// drop the buffer on interior hull edges; those abut cached tiles
		let mut bbox = meta.buffered_bbox;
		if hull.x0 != full.tiles.x0 {
			bbox.0 = meta.inner_bbox.0;
		}
		if hull.x1 != full.tiles.x1 {
			bbox.2 = meta.inner_bbox.2;
		}
		let (top_clipped, bottom_clipped) = match self.grid.origin() {
			GridOrigin::NorthWest => (hull.y0 != full.tiles.y0, hull.y1 != full.tiles.y1),
			GridOrigin::SouthWest => (hull.y1 != full.tiles.y1, hull.y0 != full.tiles.y0),
		};
		if top_clipped {
			bbox.3 = meta.inner_bbox.3;
		}
		if bottom_clipped {
			bbox.1 = meta.inner_bbox.1;
		}
		meta.buffered_bbox = bbox;
		meta.recompute_pixel_size(&self.grid);
		Ok(meta)
	}

	fn build(&self, z: u8, mx: u32, my: u32, tiles: TileRange) -> Result<MetaTile> {
		let inner_bbox = self.grid.range_bbox(&tiles).intersected(self.grid.bbox());
		let res = self.grid.resolution(z)?;
		let buffer = f64::from(self.meta_buffer) * res;
		// the buffer never crosses the grid bbox
		let buffered_bbox = inner_bbox.buffered(buffer).intersected(self.grid.bbox());

		let mut meta = MetaTile {
			z,
			mx,
			my,
			tiles,
			inner_bbox,
			buffered_bbox,
			pixel_size: (0, 0),
		};
		meta.recompute_pixel_size(&self.grid);
		Ok(meta)
	}

	pub fn grid(&self) -> &Arc<TileGrid> {
		&self.grid
	}
}

/// A block of adjacent tiles rendered as one image.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaTile {
	pub z: u8,
	pub mx: u32,
	pub my: u32,
	/// The tiles this meta-tile covers (clipped to the grid).
	pub tiles: TileRange,
	/// Joint extent of the tiles, without buffer.
	pub inner_bbox: MapBBox,
	/// Extent including the pixel buffer, clipped to the grid bbox.
	pub buffered_bbox: MapBBox,
	/// Image size for a request of `buffered_bbox`.
	pub pixel_size: (u32, u32),
}

impl MetaTile {
	fn recompute_pixel_size(&mut self, grid: &TileGrid) {
		let res = grid.resolutions()[self.z as usize];
		self.pixel_size = (
			(self.buffered_bbox.width() / res).round() as u32,
			(self.buffered_bbox.height() / res).round() as u32,
		);
	}

	/// Pixel offset of every tile inside the rendered meta image
	/// (row-major image coordinates, y down).
	pub fn tile_slices(&self, grid: &TileGrid) -> Vec<(TileCoord, (u32, u32))> {
		let res = grid.resolutions()[self.z as usize];
		let (tw, th) = grid.tile_size();
		let mut slices = Vec::with_capacity(self.tiles.len());
		for coord in self.tiles.iter() {
			let bbox = grid.tile_bbox(&coord);
			let px = ((bbox.0 - self.buffered_bbox.0) / res).round() as u32;
			let py = ((self.buffered_bbox.3 - bbox.3) / res).round() as u32;
			debug_assert!(px + tw <= self.pixel_size.0 + tw && py + th <= self.pixel_size.1 + th);
			slices.push((coord, (px, py)));
		}
		slices
	}

	pub fn fingerprint(&self, cache_name: &str, grid_name: &str) -> String {
		format!("{cache_name}/{grid_name}/{}-{}-{}", self.z, self.mx, self.my)
	}
}
