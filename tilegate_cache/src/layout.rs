//! Directory layouts for filesystem caches.
//!
//! The path schemas are interoperable with the established tile cache
//! tools, so an existing on-disk cache can be served as-is:
//!
//! - `tc`:      `zz/xxx/xxx/xxx/yyy/yyy/yyy.ext` (TileCache)
//! - `tms`:     `z/x/y.ext`
//! - `mp`:      `zz/xxxx/xxxx/yyyy/yyyy.ext` (reduced nesting)
//! - `arcgis`:  `Lzz/Ryyyyyyyy/Cxxxxxxxx.ext` (hex row/column)
//! - `quadkey`: `<quadkey>.ext`

use anyhow::{bail, Result};
use std::path::PathBuf;
use tilegate_core::TileCoord;

/// A filesystem path schema mapping tile coordinates to relative paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheLayout {
	TileCache,
	#[default]
	Tms,
	ReducedNesting,
	ArcGis,
	Quadkey,
}

impl CacheLayout {
	pub fn try_from_str(value: &str) -> Result<CacheLayout> {
		Ok(match value {
			"tc" => CacheLayout::TileCache,
			"tms" => CacheLayout::Tms,
			"mp" => CacheLayout::ReducedNesting,
			"arcgis" => CacheLayout::ArcGis,
			"quadkey" => CacheLayout::Quadkey,
			_ => bail!("unknown directory_layout: '{value}'"),
		})
	}

	pub fn as_str(&self) -> &str {
		match self {
			CacheLayout::TileCache => "tc",
			CacheLayout::Tms => "tms",
			CacheLayout::ReducedNesting => "mp",
			CacheLayout::ArcGis => "arcgis",
			CacheLayout::Quadkey => "quadkey",
		}
	}

	/// The relative path for `coord` with the given file extension.
	pub fn tile_path(&self, coord: &TileCoord, extension: &str) -> PathBuf {
		match self {
			CacheLayout::TileCache => {
				let parts = [
					format!("{:02}", coord.z),
					format!("{:03}", coord.x / 1_000_000),
					format!("{:03}", (coord.x / 1_000) % 1_000),
					format!("{:03}", coord.x % 1_000),
					format!("{:03}", coord.y / 1_000_000),
					format!("{:03}", (coord.y / 1_000) % 1_000),
					format!("{:03}.{extension}", coord.y % 1_000),
				];
				parts.iter().collect()
			}
			CacheLayout::Tms => {
				[
					coord.z.to_string(),
					coord.x.to_string(),
					format!("{}.{extension}", coord.y),
				]
				.iter()
				.collect()
			}
			CacheLayout::ReducedNesting => {
				let parts = [
					format!("{:02}", coord.z),
					format!("{:04}", coord.x / 10_000),
					format!("{:04}", coord.x % 10_000),
					format!("{:04}", coord.y / 10_000),
					format!("{:04}.{extension}", coord.y % 10_000),
				];
				parts.iter().collect()
			}
			CacheLayout::ArcGis => {
				let parts = [
					format!("L{:02}", coord.z),
					format!("R{:08x}", coord.y),
					format!("C{:08x}.{extension}", coord.x),
				];
				parts.iter().collect()
			}
			CacheLayout::Quadkey => PathBuf::from(format!("{}.{extension}", coord.as_quadkey())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case(CacheLayout::Tms, "5/13/8.png")]
	#[case(CacheLayout::TileCache, "05/000/000/013/000/000/008.png")]
	#[case(CacheLayout::ReducedNesting, "05/0000/0013/0000/0008.png")]
	#[case(CacheLayout::ArcGis, "L05/R00000008/C0000000d.png")]
	fn layout_paths(#[case] layout: CacheLayout, #[case] expected: &str) {
		let coord = TileCoord::new(5, 13, 8);
		assert_eq!(layout.tile_path(&coord, "png"), PathBuf::from(expected));
	}

	#[test]
	fn tc_layout_splits_large_coords() {
		let coord = TileCoord::new(19, 123_456_789, 7_654_321);
		assert_eq!(
			CacheLayout::TileCache.tile_path(&coord, "jpeg"),
			PathBuf::from("19/123/456/789/007/654/321.jpeg")
		);
	}

	#[test]
	fn quadkey_layout() {
		let coord = TileCoord::new(3, 3, 5);
		assert_eq!(
			CacheLayout::Quadkey.tile_path(&coord, "png"),
			PathBuf::from("213.png")
		);
	}

	#[test]
	fn parse_round_trip() {
		for name in ["tc", "tms", "mp", "arcgis", "quadkey"] {
			assert_eq!(CacheLayout::try_from_str(name).unwrap().as_str(), name);
		}
		assert!(CacheLayout::try_from_str("zxy").is_err());
	}
}
