//! Filesystem tile cache.
//!
//! Tiles are published atomically: payloads are written to a temp file in
//! the target directory and renamed into place, so readers never observe a
//! truncated tile. The distinguished empty marker is a zero-byte file.
//! On unix, identical single-color tiles can be stored as hard- or
//! symlinks to one shared file.

use crate::{BackendCapabilities, CacheBackend, CacheLayout};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{trace, warn};
use std::{
	fs,
	path::{Path, PathBuf},
	sync::atomic::{AtomicU64, Ordering},
	time::SystemTime,
};
use tilegate_core::{CacheError, LinkSingleColor, Permissions, Tile, TileCoord, TileData, TileFormat};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct FileCache {
	dir: PathBuf,
	layout: CacheLayout,
	format: TileFormat,
	permissions: Permissions,
	link_single_color: LinkSingleColor,
}

impl FileCache {
	pub fn new(dir: &Path, layout: CacheLayout, format: TileFormat) -> FileCache {
		FileCache {
			dir: dir.to_path_buf(),
			layout,
			format,
			permissions: Permissions::default(),
			link_single_color: LinkSingleColor::Off,
		}
	}

	pub fn with_permissions(mut self, permissions: Permissions) -> FileCache {
		self.permissions = permissions;
		self
	}

	pub fn with_single_color_links(mut self, mode: LinkSingleColor) -> FileCache {
		self.link_single_color = mode;
		self
	}

	/// The absolute path of a tile. For `mixed` caches the stored format
	/// varies per tile, `format` names the one actually used.
	pub fn tile_path(&self, coord: &TileCoord, format: TileFormat) -> PathBuf {
		self.dir.join(self.layout.tile_path(coord, format.as_extension()))
	}

	/// All paths a tile may live at, in probe order.
	fn candidate_paths(&self, coord: &TileCoord) -> Vec<PathBuf> {
		match self.format {
			TileFormat::MIXED => vec![
				self.tile_path(coord, TileFormat::PNG),
				self.tile_path(coord, TileFormat::JPEG),
			],
			format => vec![self.tile_path(coord, format)],
		}
	}

	fn ensure_parent(&self, path: &Path) -> Result<()> {
		let parent = path.parent().context("tile path without parent")?;
		if parent.exists() {
			return Ok(());
		}
		fs::create_dir_all(parent).map_err(CacheError::Io)?;
		self.apply_directory_permissions(parent);
		Ok(())
	}

	#[cfg(unix)]
	fn apply_directory_permissions(&self, dir: &Path) {
		use std::os::unix::fs::PermissionsExt;
		if let Some(mode) = self.permissions.directory_mode {
			// apply to every newly created level up to the cache root
			let mut current = Some(dir);
			while let Some(path) = current {
				if path == self.dir {
					break;
				}
				if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
					warn!("could not set permissions on {path:?}: {err}");
				}
				current = path.parent();
			}
		}
	}

	#[cfg(not(unix))]
	fn apply_directory_permissions(&self, _dir: &Path) {}

	#[cfg(unix)]
	fn apply_file_permissions(&self, path: &Path) {
		use std::os::unix::fs::PermissionsExt;
		if let Some(mode) = self.permissions.file_mode {
			if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
				warn!("could not set permissions on {path:?}: {err}");
			}
		}
	}

	#[cfg(not(unix))]
	fn apply_file_permissions(&self, _path: &Path) {}

	/// Atomic publish: temp file in the target directory, then rename.
	fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
		self.ensure_parent(path)?;
		let temp = path.with_extension(format!(
			"tmp-{}-{}",
			std::process::id(),
			TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
		));
		fs::write(&temp, bytes).map_err(CacheError::Io)?;
		self.apply_file_permissions(&temp);
		fs::rename(&temp, path).map_err(CacheError::Io)?;
		Ok(())
	}

	/// Stores `bytes` as a link to one shared per-color file when the
	/// whole tile is a single color and linking is enabled.
	#[cfg(unix)]
	fn store_linked(&self, path: &Path, bytes: &[u8], color: [u8; 4], format: TileFormat) -> Result<()> {
		let shared_dir = self.dir.join("single_color_tiles");
		let shared = shared_dir.join(format!(
			"{:02x}{:02x}{:02x}{:02x}.{}",
			color[0],
			color[1],
			color[2],
			color[3],
			format.as_extension()
		));
		if !shared.exists() {
			if !shared_dir.exists() {
				fs::create_dir_all(&shared_dir).map_err(CacheError::Io)?;
				self.apply_directory_permissions(&shared_dir);
			}
			self.write_atomic(&shared, bytes)?;
		}
		self.ensure_parent(path)?;
		let _ = fs::remove_file(path);
		match self.link_single_color {
			LinkSingleColor::Hardlink => fs::hard_link(&shared, path).map_err(CacheError::Io)?,
			_ => std::os::unix::fs::symlink(&shared, path).map_err(CacheError::Io)?,
		}
		Ok(())
	}
}

#[async_trait]
impl CacheBackend for FileCache {
	fn backend_name(&self) -> &str {
		"file"
	}

	fn cache_layout(&self) -> &str {
		self.layout.as_str()
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities {
			supports_link_identical: cfg!(unix) && self.link_single_color != LinkSingleColor::Off,
			is_persistent: true,
			supports_mtime: true,
		}
	}

	async fn load(&self, coord: &TileCoord, with_metadata: bool) -> Result<Tile> {
		for path in self.candidate_paths(coord) {
			let bytes = match fs::read(&path) {
				Ok(bytes) => bytes,
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
				Err(err) => return Err(CacheError::Io(err).into()),
			};
			let data = if bytes.is_empty() {
				TileData::Empty
			} else {
				let format = TileFormat::try_from_path(&path)?;
				TileData::bytes(bytes, format)
			};
			let mut tile = Tile::new(*coord, data);
			if with_metadata {
				if let Ok(metadata) = fs::metadata(&path) {
					if let Ok(mtime) = metadata.modified() {
						tile.mtime = Some(mtime);
					}
				}
			}
			trace!("loaded {coord:?} from {path:?}");
			return Ok(tile);
		}
		Ok(Tile::missing(*coord))
	}

	async fn store(&self, tile: &Tile) -> Result<()> {
		match &tile.data {
			TileData::Bytes { bytes, format } => {
				let path = self.tile_path(&tile.coord, *format);
				#[cfg(unix)]
				if self.link_single_color != LinkSingleColor::Off {
					if let Some(color) = single_color_of(bytes) {
						return self.store_linked(&path, bytes, color, *format);
					}
				}
				self.write_atomic(&path, bytes)
			}
			TileData::Empty => {
				let path = self.tile_path(&tile.coord, self.storage_format());
				self.write_atomic(&path, &[])
			}
			TileData::Missing => Ok(()),
		}
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		for path in self.candidate_paths(coord) {
			match fs::remove_file(&path) {
				Ok(()) => {}
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
				Err(err) => return Err(CacheError::Io(err).into()),
			}
		}
		Ok(())
	}

	async fn is_cached(&self, coord: &TileCoord) -> bool {
		self.candidate_paths(coord).iter().any(|p| p.exists())
	}

	async fn set_mtime(&self, coord: &TileCoord, mtime: SystemTime) -> Result<()> {
		for path in self.candidate_paths(coord) {
			if let Ok(file) = fs::File::options().write(true).open(&path) {
				file.set_modified(mtime).map_err(CacheError::Io)?;
				return Ok(());
			}
		}
		Ok(())
	}
}

impl FileCache {
	/// The extension used for the empty marker; `mixed` caches fall back
	/// to PNG since the marker carries no payload anyway.
	fn storage_format(&self) -> TileFormat {
		match self.format {
			TileFormat::MIXED => TileFormat::PNG,
			format => format,
		}
	}
}

/// Detects single-color tiles on the encoded payload: decodes cheaply only
/// when linking is enabled. Returns the RGBA color when uniform.
#[cfg(unix)]
fn single_color_of(bytes: &[u8]) -> Option<[u8; 4]> {
	let image = image_probe(bytes)?;
	let mut pixels = image.iter();
	let first = *pixels.next()?;
	pixels.all(|p| *p == first).then_some(first)
}

#[cfg(unix)]
fn image_probe(bytes: &[u8]) -> Option<Vec<[u8; 4]>> {
	// only PNG payloads are probed; JPEG tiles are never exact single color
	if bytes.len() < 8 || bytes[..8] != [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'] {
		return None;
	}
	// a uniform 256x256 RGBA PNG compresses to well under 2 KB; bigger
	// payloads cannot be single color, skip the decode
	if bytes.len() > 2048 {
		return None;
	}
	let decoded = image::load_from_memory(bytes).ok()?.to_rgba8();
	Some(decoded.pixels().map(|p| p.0).collect())
}
