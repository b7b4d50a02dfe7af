//! Tile image formats and their wire representation.

use anyhow::{bail, Result};
use std::fmt::{Display, Formatter};
use TileFormat::*;

/// Supported tile output formats.
///
/// `MIXED` stores each tile either as PNG (any transparency present) or as
/// JPEG (fully opaque); the effective content type is decided per tile.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TileFormat {
	#[default]
	PNG,
	/// 8-bit paletted PNG.
	PNG8,
	JPEG,
	TIFF,
	WEBP,
	MIXED,
}

impl TileFormat {
	pub fn as_str(&self) -> &str {
		match self {
			PNG => "png",
			PNG8 => "png8",
			JPEG => "jpeg",
			TIFF => "tiff",
			WEBP => "webp",
			MIXED => "mixed",
		}
	}

	/// The file extension without a leading dot. `PNG8` tiles are plain
	/// `.png` files on disk; `MIXED` has no fixed extension and callers
	/// must use the per-tile format instead.
	pub fn as_extension(&self) -> &str {
		match self {
			PNG | PNG8 => "png",
			JPEG => "jpeg",
			TIFF => "tiff",
			WEBP => "webp",
			MIXED => "mixed",
		}
	}

	pub fn as_mime_str(&self) -> &str {
		match self {
			PNG | PNG8 => "image/png",
			JPEG => "image/jpeg",
			TIFF => "image/tiff",
			WEBP => "image/webp",
			// resolved per tile; used only as a request format placeholder
			MIXED => "application/octet-stream",
		}
	}

	pub fn try_from_str(value: &str) -> Result<Self> {
		Ok(match value.to_lowercase().trim_matches([' ', '.']) {
			"png" | "png24" | "png32" => PNG,
			"png8" => PNG8,
			"jpeg" | "jpg" => JPEG,
			"tiff" | "tif" | "geotiff" => TIFF,
			"webp" => WEBP,
			"mixed" => MIXED,
			_ => bail!("unknown tile format: '{value}'"),
		})
	}

	/// Derives the format from a file extension.
	pub fn try_from_path(path: &std::path::Path) -> Result<Self> {
		Self::try_from_str(path.extension().and_then(|s| s.to_str()).unwrap_or_default())
	}

	/// Parses `image/png`-style content types, including the
	/// `image/png; mode=8bit` form.
	pub fn try_from_mime(value: &str) -> Result<Self> {
		let mut parts = value.split(';');
		let essence = parts.next().unwrap_or_default().trim();
		let mode_8bit = parts.any(|p| p.trim() == "mode=8bit");
		Ok(match essence {
			"image/png" => {
				if mode_8bit {
					PNG8
				} else {
					PNG
				}
			}
			"image/jpeg" => JPEG,
			"image/tiff" => TIFF,
			"image/webp" => WEBP,
			_ => bail!("unknown image content type: '{value}'"),
		})
	}

	/// Whether encoded tiles of this format can carry an alpha channel.
	pub fn supports_transparency(&self) -> bool {
		!matches!(self, JPEG)
	}
}

impl Display for TileFormat {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}
