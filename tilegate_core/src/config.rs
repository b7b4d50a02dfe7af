//! Normalized configuration values.
//!
//! The core consumes an already parsed and validated configuration; these
//! structs are the normalized form. They are computed once at startup and
//! shared immutably (`Arc`) with the tile manager and the cache
//! constructors.

use crate::{Srs, TileFormat};
use std::{
	collections::HashMap,
	path::PathBuf,
	sync::Arc,
	time::{Duration, SystemTime},
};

/// Resampling filters for rescaling and reprojection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampling {
	Nearest,
	Bilinear,
	#[default]
	Bicubic,
}

impl Resampling {
	pub fn from_str_or_default(value: &str) -> Resampling {
		match value.to_lowercase().as_str() {
			"nearest" => Resampling::Nearest,
			"bilinear" => Resampling::Bilinear,
			_ => Resampling::Bicubic,
		}
	}
}

/// How two raster layers are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMethod {
	/// Alpha-over compositing.
	#[default]
	Composite,
	/// Per-band maximum, for intensity-style layers.
	Max,
}

/// Image handling defaults (`globals.image`).
#[derive(Debug, Clone)]
pub struct ImageDefaults {
	pub resampling: Resampling,
	pub jpeg_quality: u8,
	/// Reuse a cached level for requests up to this factor finer.
	pub stretch_factor: f64,
	/// Shrink the coarsest level up to this factor before serving blank.
	pub max_shrink_factor: f64,
	pub paletted: bool,
	pub merge_method: MergeMethod,
}

impl Default for ImageDefaults {
	fn default() -> Self {
		ImageDefaults {
			resampling: Resampling::default(),
			jpeg_quality: 90,
			stretch_factor: 1.15,
			max_shrink_factor: 4.0,
			paletted: false,
			merge_method: MergeMethod::default(),
		}
	}
}

/// Cache handling defaults (`globals.cache`).
#[derive(Debug, Clone)]
pub struct CacheDefaults {
	pub base_dir: PathBuf,
	pub lock_dir: PathBuf,
	pub tile_lock_dir: Option<PathBuf>,
	pub meta_size: (u32, u32),
	pub meta_buffer: u32,
	pub concurrent_tile_creators: usize,
	pub minimize_meta_requests: bool,
	pub bulk_meta_tiles: bool,
	/// Refuse requests covering more tiles than this.
	pub max_tile_limit: usize,
	pub link_single_color_images: LinkSingleColor,
}

impl Default for CacheDefaults {
	fn default() -> Self {
		CacheDefaults {
			base_dir: PathBuf::from("./cache_data"),
			lock_dir: PathBuf::from("./cache_data/locks"),
			tile_lock_dir: None,
			meta_size: (4, 4),
			meta_buffer: 80,
			concurrent_tile_creators: 2,
			minimize_meta_requests: false,
			bulk_meta_tiles: false,
			max_tile_limit: 500,
			link_single_color_images: LinkSingleColor::Off,
		}
	}
}

/// Single-color tile deduplication mode for filesystem caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkSingleColor {
	#[default]
	Off,
	Symlink,
	Hardlink,
}

/// HTTP client defaults (`globals.http`).
#[derive(Debug, Clone)]
pub struct HttpDefaults {
	pub client_timeout: Duration,
	pub headers: HashMap<String, String>,
	pub hide_error_details: bool,
	pub manage_cookies: bool,
}

impl Default for HttpDefaults {
	fn default() -> Self {
		HttpDefaults {
			client_timeout: Duration::from_secs(60),
			headers: HashMap::new(),
			hide_error_details: false,
			manage_cookies: false,
		}
	}
}

/// SRS handling defaults (`globals.srs`).
#[derive(Debug, Clone, Default)]
pub struct SrsDefaults {
	/// Preferred source projections per target SRS, tried in order when a
	/// source does not support the target directly.
	pub preferred_src_proj: HashMap<Srs, Vec<Srs>>,
}

/// The immutable per-process configuration root.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
	pub image: ImageDefaults,
	pub cache: CacheDefaults,
	pub http: HttpDefaults,
	pub srs: SrsDefaults,
}

impl GlobalConfig {
	pub fn arc(self) -> Arc<GlobalConfig> {
		Arc::new(self)
	}
}

/// When a cached tile counts as expired and gets refreshed or re-created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshPolicy {
	/// Older than the given absolute time.
	Before(SystemTime),
	/// Older than the given age.
	MaxAge(Duration),
}

impl RefreshPolicy {
	/// Whether a tile with `mtime` is expired under this policy.
	pub fn is_expired(&self, mtime: SystemTime) -> bool {
		match self {
			RefreshPolicy::Before(cutoff) => mtime < *cutoff,
			RefreshPolicy::MaxAge(age) => {
				SystemTime::now().duration_since(mtime).unwrap_or_default() > *age
			}
		}
	}
}

/// How the tile manager reacts when some (not all) sources of a request
/// fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnSourceErrors {
	/// Abort the request.
	#[default]
	Raise,
	/// Substitute transparency for the failed source and log it.
	Notify,
	/// Substitute silently.
	Ignore,
}

/// Watermark stamped on served images (`caches.*.watermark`).
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkOpts {
	pub text: String,
	pub opacity: u8,
	pub color: [u8; 3],
	pub spacing_wide: bool,
}

/// Per-cache options, normalized from the `caches:` section.
#[derive(Debug, Clone)]
pub struct CacheOpts {
	pub name: String,
	/// Storage format of the cache.
	pub format: TileFormat,
	/// Format requested from sources, when it differs from `format`.
	pub request_format: Option<TileFormat>,
	pub meta_size: (u32, u32),
	pub meta_buffer: u32,
	pub minimize_meta_requests: bool,
	pub bulk_meta_tiles: bool,
	pub concurrent_tile_creators: usize,
	/// Levels from this one on are served directly from the sources.
	pub use_direct_from_level: Option<u8>,
	/// Resolutions finer than this are served directly from the sources.
	pub use_direct_from_res: Option<f64>,
	/// Create missing tiles from finer cached levels (up to N levels down).
	pub upscale_tiles: Option<u8>,
	/// Create missing tiles from coarser cached levels (up to N levels up).
	pub downscale_tiles: Option<u8>,
	/// Query sources but never write tiles.
	pub disable_storage: bool,
	pub refresh_before: Option<RefreshPolicy>,
	/// Ignore cached tiles older than this (they are re-created).
	pub remove_before: Option<RefreshPolicy>,
	pub refresh_while_serving: bool,
	pub on_source_errors: OnSourceErrors,
	pub link_single_color_images: LinkSingleColor,
	pub watermark: Option<WatermarkOpts>,
	pub tile_lock_dir: Option<PathBuf>,
}

impl CacheOpts {
	/// A cache with the global defaults applied.
	pub fn new(name: &str, globals: &GlobalConfig) -> CacheOpts {
		CacheOpts {
			name: name.to_string(),
			format: TileFormat::PNG,
			request_format: None,
			meta_size: globals.cache.meta_size,
			meta_buffer: globals.cache.meta_buffer,
			minimize_meta_requests: globals.cache.minimize_meta_requests,
			bulk_meta_tiles: globals.cache.bulk_meta_tiles,
			concurrent_tile_creators: globals.cache.concurrent_tile_creators,
			use_direct_from_level: None,
			use_direct_from_res: None,
			upscale_tiles: None,
			downscale_tiles: None,
			disable_storage: false,
			refresh_before: None,
			remove_before: None,
			refresh_while_serving: false,
			on_source_errors: OnSourceErrors::default(),
			link_single_color_images: globals.cache.link_single_color_images,
			watermark: None,
			tile_lock_dir: globals.cache.tile_lock_dir.clone(),
		}
	}

	/// The format sources are asked for.
	pub fn request_format(&self) -> TileFormat {
		self.request_format.unwrap_or(self.format)
	}
}

/// Unix permissions applied to new cache files and directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
	pub file_mode: Option<u32>,
	pub directory_mode: Option<u32>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let config = GlobalConfig::default();
		assert_eq!(config.cache.meta_size, (4, 4));
		assert_eq!(config.image.jpeg_quality, 90);
		assert_eq!(config.image.stretch_factor, 1.15);
	}

	#[test]
	fn cache_opts_inherit_globals() {
		let mut config = GlobalConfig::default();
		config.cache.meta_buffer = 120;
		let opts = CacheOpts::new("osm", &config);
		assert_eq!(opts.meta_buffer, 120);
		assert_eq!(opts.request_format(), TileFormat::PNG);
	}

	#[test]
	fn refresh_policy() {
		let old = SystemTime::now() - Duration::from_secs(7200);
		let fresh = SystemTime::now() - Duration::from_secs(60);

		let by_age = RefreshPolicy::MaxAge(Duration::from_secs(3600));
		assert!(by_age.is_expired(old));
		assert!(!by_age.is_expired(fresh));

		let cutoff = RefreshPolicy::Before(SystemTime::now() - Duration::from_secs(600));
		assert!(cutoff.is_expired(old));
		assert!(!cutoff.is_expired(fresh));
	}
}
