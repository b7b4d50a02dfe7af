//! The tile value passed between cache backends and the tile manager.

use super::{TileCoord, TileFormat};
use std::time::SystemTime;

/// The payload of a tile slot.
///
/// `Empty` is a distinguished stored value (a fully blank/transparent tile
/// recorded as such by the cache), distinct from `Missing` which means the
/// cache holds nothing for the coordinate.
#[derive(Debug, Clone, PartialEq)]
pub enum TileData {
	Bytes {
		bytes: Vec<u8>,
		format: TileFormat,
	},
	Empty,
	Missing,
}

impl TileData {
	pub fn bytes(bytes: Vec<u8>, format: TileFormat) -> TileData {
		TileData::Bytes { bytes, format }
	}

	pub fn is_missing(&self) -> bool {
		matches!(self, TileData::Missing)
	}

	pub fn is_empty_marker(&self) -> bool {
		matches!(self, TileData::Empty)
	}

	/// Byte length of the stored payload; markers have no payload.
	pub fn len(&self) -> usize {
		match self {
			TileData::Bytes { bytes, .. } => bytes.len(),
			_ => 0,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// A tile as loaded from or destined for a cache backend.
#[derive(Debug, Clone)]
pub struct Tile {
	pub coord: TileCoord,
	pub data: TileData,
	/// Modification time of the cache entry, when the backend tracks one.
	pub mtime: Option<SystemTime>,
}

impl Tile {
	pub fn new(coord: TileCoord, data: TileData) -> Tile {
		Tile {
			coord,
			data,
			mtime: None,
		}
	}

	pub fn missing(coord: TileCoord) -> Tile {
		Tile::new(coord, TileData::Missing)
	}

	pub fn with_mtime(mut self, mtime: SystemTime) -> Tile {
		self.mtime = Some(mtime);
		self
	}

	/// A tile counts as cached when it holds bytes or the empty marker.
	pub fn is_cached(&self) -> bool {
		!self.data.is_missing()
	}

	/// The age of the cache entry, zero when no mtime is known.
	pub fn age(&self) -> std::time::Duration {
		match self.mtime {
			Some(mtime) => SystemTime::now().duration_since(mtime).unwrap_or_default(),
			None => std::time::Duration::ZERO,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn markers_are_distinct() {
		let coord = TileCoord::new(3, 1, 2);
		assert!(Tile::new(coord, TileData::Empty).is_cached());
		assert!(!Tile::missing(coord).is_cached());
		assert!(TileData::Empty.is_empty_marker());
		assert!(!TileData::Missing.is_empty_marker());
	}

	#[test]
	fn payload_length() {
		let data = TileData::bytes(vec![1, 2, 3], TileFormat::PNG);
		assert_eq!(data.len(), 3);
		assert_eq!(TileData::Empty.len(), 0);
	}
}
