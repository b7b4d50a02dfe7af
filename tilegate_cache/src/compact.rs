//! ArcGIS compact cache backend (bundle files), v1 and v2.
//!
//! Tiles are grouped into bundles of 128×128 tiles per level under
//! `L<zz>/R<rrrr>C<cccc>` (hex of the bundle's first row/column).
//!
//! - **v1**: a `.bundle` data file (60-byte header, a 128×128 table of
//!   4-byte tile offsets, then size-prefixed tile blocks) plus a
//!   `.bundlx` index (16-byte header, 128×128 5-byte offsets, 16-byte
//!   footer) pointing at the same blocks.
//! - **v2**: a single `.bundle` file (64-byte header, 128×128 8-byte
//!   entries packing offset in the lower 40 bits and size in the upper
//!   24, then size-prefixed tile blocks).
//!
//! Stores append and repoint the index; overwritten tiles leave holes
//! until [`CompactCache::defrag`] rewrites the bundle.

use crate::{BackendCapabilities, CacheBackend};
use anyhow::{Context, Result};
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use std::{
	fmt::Debug,
	fs,
	io::{Read, Seek, SeekFrom, Write},
	path::{Path, PathBuf},
	sync::Mutex,
};
use tilegate_core::{CacheError, Tile, TileCoord, TileData, TileFormat};

const BUNDLE_SIZE: u32 = 128;
const TILES_PER_BUNDLE: usize = (BUNDLE_SIZE * BUNDLE_SIZE) as usize;

const V1_HEADER_SIZE: u64 = 60;
const V1_INDEX_SIZE: u64 = TILES_PER_BUNDLE as u64 * 4;
const V2_HEADER_SIZE: u64 = 64;
const V2_INDEX_SIZE: u64 = TILES_PER_BUNDLE as u64 * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactVersion {
	V1,
	V2,
}

pub struct CompactCache {
	dir: PathBuf,
	version: CompactVersion,
	format: TileFormat,
	// serializes bundle rewrites within this process; cross-process
	// exclusion is the tile locker's job
	write_lock: Mutex<()>,
}

/// Outcome of a defrag pass over one bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct DefragStats {
	pub bundle: PathBuf,
	pub wasted_bytes: u64,
	pub fragmentation: f64,
	pub defragmented: bool,
}

impl CompactCache {
	pub fn new(dir: &Path, version: CompactVersion, format: TileFormat) -> CompactCache {
		CompactCache {
			dir: dir.to_path_buf(),
			version,
			format,
			write_lock: Mutex::new(()),
		}
	}

	fn bundle_path(&self, coord: &TileCoord) -> PathBuf {
		let col0 = coord.x / BUNDLE_SIZE * BUNDLE_SIZE;
		let row0 = coord.y / BUNDLE_SIZE * BUNDLE_SIZE;
		self
			.dir
			.join(format!("L{:02}", coord.z))
			.join(format!("R{row0:04x}C{col0:04x}.bundle"))
	}

	fn index_slot(coord: &TileCoord) -> usize {
		let col = coord.x % BUNDLE_SIZE;
		let row = coord.y % BUNDLE_SIZE;
		(col * BUNDLE_SIZE + row) as usize
	}

	fn header_size(&self) -> u64 {
		match self.version {
			CompactVersion::V1 => V1_HEADER_SIZE,
			CompactVersion::V2 => V2_HEADER_SIZE,
		}
	}

	fn index_size(&self) -> u64 {
		match self.version {
			CompactVersion::V1 => V1_INDEX_SIZE,
			CompactVersion::V2 => V2_INDEX_SIZE,
		}
	}

	fn data_start(&self) -> u64 {
		self.header_size() + self.index_size()
	}

	/// Creates an empty bundle (and the v1 `.bundlx`).
	fn init_bundle(&self, path: &Path, coord: &TileCoord) -> Result<()> {
		fs::create_dir_all(path.parent().context("bundle path without parent")?).map_err(CacheError::Io)?;

		let row0 = coord.y / BUNDLE_SIZE * BUNDLE_SIZE;
		let col0 = coord.x / BUNDLE_SIZE * BUNDLE_SIZE;
		let file_size = self.data_start();

		let mut header = vec![0u8; self.header_size() as usize];
		match self.version {
			CompactVersion::V1 => {
				let fields: [i32; 15] = [
					3,                      // version
					TILES_PER_BUNDLE as i32, // record count
					0,                      // max tile size
					5,                      // offset byte count
					0,                      // tile count * 4
					0,
					file_size as i32, // file size
					0,
					40,
					0,
					0,
					row0 as i32,
					(row0 + BUNDLE_SIZE - 1) as i32,
					col0 as i32,
					(col0 + BUNDLE_SIZE - 1) as i32,
				];
				for (i, v) in fields.iter().enumerate() {
					LittleEndian::write_i32(&mut header[i * 4..], *v);
				}
			}
			CompactVersion::V2 => {
				LittleEndian::write_u32(&mut header[0..], 3); // version
				LittleEndian::write_u32(&mut header[4..], TILES_PER_BUNDLE as u32);
				LittleEndian::write_u32(&mut header[8..], 0); // max tile size
				LittleEndian::write_u32(&mut header[12..], 5); // offset byte count
				LittleEndian::write_u64(&mut header[16..], 0); // slack space
				LittleEndian::write_u64(&mut header[24..], file_size);
				LittleEndian::write_u64(&mut header[32..], 40); // user header offset
				LittleEndian::write_u32(&mut header[40..], 20 + V2_INDEX_SIZE as u32);
				// remaining fields stay zero
			}
		}

		let mut file = fs::File::create(path).map_err(CacheError::Io)?;
		file.write_all(&header).map_err(CacheError::Io)?;
		file
			.write_all(&vec![0u8; self.index_size() as usize])
			.map_err(CacheError::Io)?;

		if self.version == CompactVersion::V1 {
			let mut index = vec![0u8; 16 + TILES_PER_BUNDLE * 5 + 16];
			// all offsets initially point at the (empty) data start
			for slot in 0..TILES_PER_BUNDLE {
				write_offset5(&mut index[16 + slot * 5..], self.data_start());
			}
			fs::write(path.with_extension("bundlx"), index).map_err(CacheError::Io)?;
		}
		Ok(())
	}

	/// Reads the offset/size of a slot; `(0, 0)` means missing.
	fn read_slot(&self, file: &mut fs::File, slot: usize) -> Result<(u64, u32)> {
		match self.version {
			CompactVersion::V1 => {
				let mut buf = [0u8; 4];
				file
					.seek(SeekFrom::Start(V1_HEADER_SIZE + slot as u64 * 4))
					.map_err(CacheError::Io)?;
				file.read_exact(&mut buf).map_err(CacheError::Io)?;
				let offset = u64::from(LittleEndian::read_u32(&buf));
				if offset == 0 {
					return Ok((0, 0));
				}
				// the size prefix lives at the offset
				file.seek(SeekFrom::Start(offset)).map_err(CacheError::Io)?;
				file.read_exact(&mut buf).map_err(CacheError::Io)?;
				Ok((offset, LittleEndian::read_u32(&buf)))
			}
			CompactVersion::V2 => {
				let mut buf = [0u8; 8];
				file
					.seek(SeekFrom::Start(V2_HEADER_SIZE + slot as u64 * 8))
					.map_err(CacheError::Io)?;
				file.read_exact(&mut buf).map_err(CacheError::Io)?;
				let entry = LittleEndian::read_u64(&buf);
				let offset = entry & 0xff_ffff_ffff;
				let size = (entry >> 40) as u32;
				Ok((offset, size))
			}
		}
	}

	fn write_slot(&self, file: &mut fs::File, slot: usize, offset: u64, size: u32) -> Result<()> {
		match self.version {
			CompactVersion::V1 => {
				let mut buf = [0u8; 4];
				LittleEndian::write_u32(&mut buf, offset as u32);
				file
					.seek(SeekFrom::Start(V1_HEADER_SIZE + slot as u64 * 4))
					.map_err(CacheError::Io)?;
				file.write_all(&buf).map_err(CacheError::Io)?;
			}
			CompactVersion::V2 => {
				let mut buf = [0u8; 8];
				LittleEndian::write_u64(&mut buf, offset | (u64::from(size) << 40));
				file
					.seek(SeekFrom::Start(V2_HEADER_SIZE + slot as u64 * 8))
					.map_err(CacheError::Io)?;
				file.write_all(&buf).map_err(CacheError::Io)?;
			}
		}
		Ok(())
	}

	fn update_header(&self, file: &mut fs::File, max_tile_size: u32, tile_count: u32, file_size: u64) -> Result<()> {
		let mut buf = [0u8; 8];
		match self.version {
			CompactVersion::V1 => {
				LittleEndian::write_u32(&mut buf[..4], max_tile_size);
				file.seek(SeekFrom::Start(8)).map_err(CacheError::Io)?;
				file.write_all(&buf[..4]).map_err(CacheError::Io)?;
				LittleEndian::write_u32(&mut buf[..4], tile_count * 4);
				file.seek(SeekFrom::Start(16)).map_err(CacheError::Io)?;
				file.write_all(&buf[..4]).map_err(CacheError::Io)?;
				LittleEndian::write_u32(&mut buf[..4], file_size as u32);
				file.seek(SeekFrom::Start(24)).map_err(CacheError::Io)?;
				file.write_all(&buf[..4]).map_err(CacheError::Io)?;
			}
			CompactVersion::V2 => {
				LittleEndian::write_u32(&mut buf[..4], max_tile_size);
				file.seek(SeekFrom::Start(8)).map_err(CacheError::Io)?;
				file.write_all(&buf[..4]).map_err(CacheError::Io)?;
				LittleEndian::write_u64(&mut buf, file_size);
				file.seek(SeekFrom::Start(24)).map_err(CacheError::Io)?;
				file.write_all(&buf).map_err(CacheError::Io)?;
			}
		}
		Ok(())
	}

	fn read_header_stats(&self, file: &mut fs::File) -> Result<(u32, u32)> {
		let mut buf = [0u8; 4];
		file.seek(SeekFrom::Start(8)).map_err(CacheError::Io)?;
		file.read_exact(&mut buf).map_err(CacheError::Io)?;
		let max_tile_size = LittleEndian::read_u32(&buf);
		let tile_count = match self.version {
			CompactVersion::V1 => {
				file.seek(SeekFrom::Start(16)).map_err(CacheError::Io)?;
				file.read_exact(&mut buf).map_err(CacheError::Io)?;
				LittleEndian::read_u32(&buf) / 4
			}
			CompactVersion::V2 => 0,
		};
		Ok((max_tile_size, tile_count))
	}

	/// Removes every bundle of `z`; mirrors `remove_all` cleanup.
	pub fn remove_level(&self, z: u8) -> Result<()> {
		let level_dir = self.dir.join(format!("L{z:02}"));
		if level_dir.exists() {
			fs::remove_dir_all(level_dir).map_err(CacheError::Io)?;
		}
		Ok(())
	}

	/// Rewrites bundles whose wasted share exceeds `min_percent` or whose
	/// wasted bytes exceed `min_bytes`. Bundles without any live tile are
	/// deleted. Returns per-bundle stats.
	pub fn defrag(&self, min_bytes: u64, min_percent: f64) -> Result<Vec<DefragStats>> {
		let mut stats = Vec::new();
		if !self.dir.exists() {
			return Ok(stats);
		}
		let mut bundles = Vec::new();
		for level in fs::read_dir(&self.dir).map_err(CacheError::Io)? {
			let level = level.map_err(CacheError::Io)?;
			if !level.path().is_dir() {
				continue;
			}
			for entry in fs::read_dir(level.path()).map_err(CacheError::Io)? {
				let path = entry.map_err(CacheError::Io)?.path();
				if path.extension().is_some_and(|e| e == "bundle") {
					bundles.push(path);
				}
			}
		}
		bundles.sort();

		for bundle in bundles {
			stats.push(self.defrag_bundle(&bundle, min_bytes, min_percent)?);
		}
		Ok(stats)
	}

	fn defrag_bundle(&self, path: &Path, min_bytes: u64, min_percent: f64) -> Result<DefragStats> {
		let _guard = self.write_lock.lock().unwrap();
		let mut file = fs::File::options().read(true).open(path).map_err(CacheError::Io)?;
		let file_size = file.metadata().map_err(CacheError::Io)?.len();

		// collect live tiles
		let mut live: Vec<(usize, Vec<u8>)> = Vec::new();
		let mut live_bytes = 0u64;
		for slot in 0..TILES_PER_BUNDLE {
			let (offset, size) = self.read_slot(&mut file, slot)?;
			if offset == 0 || size == 0 {
				continue;
			}
			let mut bytes = vec![0u8; size as usize];
			file.seek(SeekFrom::Start(offset + 4)).map_err(CacheError::Io)?;
			file.read_exact(&mut bytes).map_err(CacheError::Io)?;
			live_bytes += u64::from(size) + 4;
			live.push((slot, bytes));
		}

		let used = self.data_start() + live_bytes;
		let wasted = file_size.saturating_sub(used);
		let fragmentation = if file_size > 0 {
			wasted as f64 / file_size as f64
		} else {
			0.0
		};
		let needs_defrag = wasted >= min_bytes || (min_percent > 0.0 && fragmentation >= min_percent);
		drop(file);

		if !needs_defrag {
			return Ok(DefragStats {
				bundle: path.to_path_buf(),
				wasted_bytes: wasted,
				fragmentation,
				defragmented: false,
			});
		}

		if live.is_empty() {
			info!("removing empty bundle {path:?}");
			fs::remove_file(path).map_err(CacheError::Io)?;
			let _ = fs::remove_file(path.with_extension("bundlx"));
			return Ok(DefragStats {
				bundle: path.to_path_buf(),
				wasted_bytes: wasted,
				fragmentation,
				defragmented: true,
			});
		}

		debug!("defragmenting {path:?} ({wasted} wasted bytes)");
		// rebuild into a temp bundle, then swap into place
		let temp = path.with_extension("bundle-defrag");
		let coord_for_init = self.bundle_origin_coord(path)?;
		self.init_bundle(&temp, &coord_for_init)?;
		{
			let mut out = fs::File::options().read(true).write(true).open(&temp).map_err(CacheError::Io)?;
			let mut end = self.data_start();
			let mut max_tile_size = 0u32;
			for (slot, bytes) in &live {
				out.seek(SeekFrom::Start(end)).map_err(CacheError::Io)?;
				let mut prefix = [0u8; 4];
				LittleEndian::write_u32(&mut prefix, bytes.len() as u32);
				out.write_all(&prefix).map_err(CacheError::Io)?;
				out.write_all(bytes).map_err(CacheError::Io)?;
				self.write_slot(&mut out, *slot, end, bytes.len() as u32)?;
				if self.version == CompactVersion::V1 {
					self.write_bundlx_slot(&temp, *slot, end)?;
				}
				max_tile_size = max_tile_size.max(bytes.len() as u32);
				end += 4 + bytes.len() as u64;
			}
			self.update_header(&mut out, max_tile_size, live.len() as u32, end)?;
		}
		// the temp file shares the .bundlx (same stem), which was re-initialized
		// and re-pointed above; only the data file needs the swap
		fs::rename(&temp, path).map_err(CacheError::Io)?;

		Ok(DefragStats {
			bundle: path.to_path_buf(),
			wasted_bytes: wasted,
			fragmentation,
			defragmented: true,
		})
	}

	/// Any coordinate inside the bundle, recovered from the file name.
	fn bundle_origin_coord(&self, path: &Path) -> Result<TileCoord> {
		let name = path
			.file_stem()
			.and_then(|s| s.to_str())
			.context("bundle without file name")?;
		let z: u8 = path
			.parent()
			.and_then(|p| p.file_name())
			.and_then(|n| n.to_str())
			.and_then(|n| n.strip_prefix('L'))
			.and_then(|n| n.parse().ok())
			.context("bundle without level directory")?;
		let row = u32::from_str_radix(&name[1..5], 16).context("bundle row")?;
		let col = u32::from_str_radix(&name[6..10], 16).context("bundle column")?;
		Ok(TileCoord::new(z, col, row))
	}

	fn write_bundlx_slot(&self, bundle_path: &Path, slot: usize, offset: u64) -> Result<()> {
		let path = bundle_path.with_extension("bundlx");
		let mut file = fs::File::options().read(true).write(true).open(&path).map_err(CacheError::Io)?;
		let mut buf = [0u8; 5];
		write_offset5(&mut buf, offset);
		file
			.seek(SeekFrom::Start(16 + slot as u64 * 5))
			.map_err(CacheError::Io)?;
		file.write_all(&buf).map_err(CacheError::Io)?;
		Ok(())
	}
}

fn write_offset5(buf: &mut [u8], offset: u64) {
	buf[0] = (offset & 0xff) as u8;
	buf[1] = ((offset >> 8) & 0xff) as u8;
	buf[2] = ((offset >> 16) & 0xff) as u8;
	buf[3] = ((offset >> 24) & 0xff) as u8;
	buf[4] = ((offset >> 32) & 0xff) as u8;
}

#[async_trait]
impl CacheBackend for CompactCache {
	fn backend_name(&self) -> &str {
		match self.version {
			CompactVersion::V1 => "compact-v1",
			CompactVersion::V2 => "compact-v2",
		}
	}

	fn cache_layout(&self) -> &str {
		"arcgis"
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities {
			supports_link_identical: false,
			is_persistent: true,
			supports_mtime: false,
		}
	}

	async fn load(&self, coord: &TileCoord, _with_metadata: bool) -> Result<Tile> {
		let path = self.bundle_path(coord);
		let mut file = match fs::File::options().read(true).open(&path) {
			Ok(file) => file,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Tile::missing(*coord)),
			Err(err) => return Err(CacheError::Io(err).into()),
		};
		let (offset, size) = self.read_slot(&mut file, Self::index_slot(coord))?;
		if offset == 0 || size == 0 {
			return Ok(Tile::missing(*coord));
		}
		let mut bytes = vec![0u8; size as usize];
		file.seek(SeekFrom::Start(offset + 4)).map_err(CacheError::Io)?;
		file.read_exact(&mut bytes).map_err(CacheError::Io)?;
		Ok(Tile::new(*coord, TileData::bytes(bytes, self.format)))
	}

	async fn store(&self, tile: &Tile) -> Result<()> {
		let bytes: &[u8] = match &tile.data {
			TileData::Bytes { bytes, .. } => bytes,
			// bundles have no marker representation; a zero-size slot reads
			// as missing, so empty tiles are simply not stored
			TileData::Empty | TileData::Missing => return Ok(()),
		};

		let _guard = self.write_lock.lock().unwrap();
		let path = self.bundle_path(&tile.coord);
		if !path.exists() {
			self.init_bundle(&path, &tile.coord)?;
		}

		let mut file = fs::File::options().read(true).write(true).open(&path).map_err(CacheError::Io)?;
		let end = file.seek(SeekFrom::End(0)).map_err(CacheError::Io)?;
		let mut prefix = [0u8; 4];
		LittleEndian::write_u32(&mut prefix, bytes.len() as u32);
		file.write_all(&prefix).map_err(CacheError::Io)?;
		file.write_all(bytes).map_err(CacheError::Io)?;

		let slot = Self::index_slot(&tile.coord);
		let (_, previous_size) = self.read_slot(&mut file, slot)?;
		let was_missing = previous_size == 0;
		self.write_slot(&mut file, slot, end, bytes.len() as u32)?;
		if self.version == CompactVersion::V1 {
			self.write_bundlx_slot(&path, slot, end)?;
		}

		let (max_tile_size, tile_count) = self.read_header_stats(&mut file)?;
		self.update_header(
			&mut file,
			max_tile_size.max(bytes.len() as u32),
			tile_count + u32::from(was_missing),
			end + 4 + bytes.len() as u64,
		)?;
		Ok(())
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		let _guard = self.write_lock.lock().unwrap();
		let path = self.bundle_path(coord);
		let mut file = match fs::File::options().read(true).write(true).open(&path) {
			Ok(file) => file,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(err) => return Err(CacheError::Io(err).into()),
		};
		self.write_slot(&mut file, Self::index_slot(coord), 0, 0)?;
		Ok(())
	}
}

impl Debug for CompactCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CompactCache")
			.field("dir", &self.dir)
			.field("version", &self.version)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn tile(coord: TileCoord, len: usize) -> Tile {
		Tile::new(coord, TileData::bytes(vec![0x61; len], TileFormat::PNG))
	}

	#[rstest]
	#[case(CompactVersion::V1)]
	#[case(CompactVersion::V2)]
	#[tokio::test]
	async fn bundle_files_are_created(#[case] version: CompactVersion) {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), version, TileFormat::PNG);

		cache.store(&tile(TileCoord::new(12, 5000, 1000), 4000)).await.unwrap();
		assert!(dir.path().join("L12/R0380C1380.bundle").exists());
		match version {
			CompactVersion::V1 => assert!(dir.path().join("L12/R0380C1380.bundlx").exists()),
			CompactVersion::V2 => assert!(!dir.path().join("L12/R0380C1380.bundlx").exists()),
		}
	}

	#[rstest]
	#[case(CompactVersion::V1)]
	#[case(CompactVersion::V2)]
	#[tokio::test]
	async fn round_trip_and_neighbors_missing(#[case] version: CompactVersion) {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), version, TileFormat::PNG);
		let coord = TileCoord::new(8, 130, 200);
		cache.store(&tile(coord, 123)).await.unwrap();

		let loaded = cache.load(&coord, false).await.unwrap();
		assert_eq!(loaded.data.len(), 123);

		// neighbors in the same bundle stay missing
		for other in [
			TileCoord::new(8, 131, 200),
			TileCoord::new(8, 130, 201),
			TileCoord::new(8, 128, 128),
			TileCoord::new(8, 255, 255),
		] {
			assert!(cache.load(&other, false).await.unwrap().data.is_missing(), "{other:?}");
			assert!(!cache.is_cached(&other).await);
		}
	}

	#[rstest]
	#[case(CompactVersion::V1)]
	#[case(CompactVersion::V2)]
	#[tokio::test]
	async fn is_cached_does_not_create_bundles(#[case] version: CompactVersion) {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), version, TileFormat::PNG);
		assert!(!cache.is_cached(&TileCoord::new(0, 0, 0)).await);
		assert!(!dir.path().join("L00/R0000C0000.bundle").exists());
	}

	#[tokio::test]
	async fn v1_header_tracks_sizes() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), CompactVersion::V1, TileFormat::PNG);
		cache.store(&tile(TileCoord::new(12, 5000, 1000), 4000)).await.unwrap();
		cache.store(&tile(TileCoord::new(12, 5000, 1001), 6000)).await.unwrap();

		let bytes = fs::read(dir.path().join("L12/R0380C1380.bundle")).unwrap();
		let max_tile = LittleEndian::read_i32(&bytes[8..]);
		let count_x4 = LittleEndian::read_i32(&bytes[16..]);
		let file_size = LittleEndian::read_i32(&bytes[24..]);
		let row0 = LittleEndian::read_i32(&bytes[44..]);
		let row1 = LittleEndian::read_i32(&bytes[48..]);
		let col0 = LittleEndian::read_i32(&bytes[52..]);
		let col1 = LittleEndian::read_i32(&bytes[56..]);

		assert_eq!(max_tile, 6000);
		assert_eq!(count_x4, 2 * 4);
		assert_eq!(file_size as usize, 60 + 128 * 128 * 4 + (4000 + 4) + (6000 + 4));
		assert_eq!((row0, row1), (896, 1023));
		assert_eq!((col0, col1), (4992, 5119));
		assert_eq!(file_size as u64, fs::metadata(dir.path().join("L12/R0380C1380.bundle")).unwrap().len());
	}

	#[tokio::test]
	async fn v2_header_tracks_sizes() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), CompactVersion::V2, TileFormat::PNG);
		cache.store(&tile(TileCoord::new(12, 5000, 1000), 4000)).await.unwrap();

		let bytes = fs::read(dir.path().join("L12/R0380C1380.bundle")).unwrap();
		assert_eq!(LittleEndian::read_u32(&bytes[0..]), 3);
		assert_eq!(LittleEndian::read_u32(&bytes[4..]), 128 * 128);
		assert_eq!(LittleEndian::read_u32(&bytes[8..]), 4000);
		assert_eq!(
			LittleEndian::read_u64(&bytes[24..]) as usize,
			64 + 128 * 128 * 8 + 4000 + 4
		);
	}

	#[rstest]
	#[case(CompactVersion::V1)]
	#[case(CompactVersion::V2)]
	#[tokio::test]
	async fn overwrite_leaves_hole_until_defrag(#[case] version: CompactVersion) {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), version, TileFormat::PNG);
		let coord = TileCoord::new(12, 5000, 1000);
		cache.store(&tile(coord, 60 * 1024)).await.unwrap();
		cache.store(&tile(coord, 1000)).await.unwrap();

		// the new payload is served
		assert_eq!(cache.load(&coord, false).await.unwrap().data.len(), 1000);

		let path = dir.path().join("L12/R0380C1380.bundle");
		let before = fs::metadata(&path).unwrap().len();
		let stats = cache.defrag(50_000, 0.0).unwrap();
		assert_eq!(stats.len(), 1);
		assert!(stats[0].defragmented);
		assert!(fs::metadata(&path).unwrap().len() < before);

		// live tile survives the rewrite
		assert_eq!(cache.load(&coord, false).await.unwrap().data.len(), 1000);
	}

	#[rstest]
	#[case(CompactVersion::V1)]
	#[case(CompactVersion::V2)]
	#[tokio::test]
	async fn defrag_removes_empty_bundles(#[case] version: CompactVersion) {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), version, TileFormat::PNG);
		let coord = TileCoord::new(12, 5000, 1000);
		cache.store(&tile(coord, 60 * 1024)).await.unwrap();
		cache.remove(&coord).await.unwrap();

		let path = dir.path().join("L12/R0380C1380.bundle");
		assert!(path.exists());
		let stats = cache.defrag(50_000, 0.0).unwrap();
		assert!(stats[0].defragmented);
		assert!(!path.exists());
	}

	#[rstest]
	#[case(CompactVersion::V1)]
	#[case(CompactVersion::V2)]
	#[tokio::test]
	async fn defrag_skips_compact_bundles(#[case] version: CompactVersion) {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), version, TileFormat::PNG);
		cache.store(&tile(TileCoord::new(12, 5000, 1000), 10_000)).await.unwrap();

		let stats = cache.defrag(50_000, 0.0).unwrap();
		assert_eq!(stats.len(), 1);
		assert!(!stats[0].defragmented);
		assert_eq!(stats[0].wasted_bytes, 0);
	}

	#[tokio::test]
	async fn remove_level_deletes_directory() {
		let dir = assert_fs::TempDir::new().unwrap();
		let cache = CompactCache::new(dir.path(), CompactVersion::V2, TileFormat::PNG);
		cache.store(&tile(TileCoord::new(12, 0, 0), 10)).await.unwrap();
		assert!(dir.path().join("L12").exists());
		cache.remove_level(12).unwrap();
		assert!(!dir.path().join("L12").exists());
	}
}
