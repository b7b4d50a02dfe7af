//! Map sources: polymorphic producers of map imagery.
//!
//! Every source declares what it supports (SRS, formats, resolution range,
//! coverage) and produces images for bbox requests. New source kinds are
//! added by implementing [`Source`]; there is no registry.

mod band;
mod cached;
mod debug;
mod tile;
mod wms;

pub use band::BandMergeSource;
pub use cached::CachedSource;
pub use debug::DebugSource;
pub use tile::{TileSource, TileSourceOpts};
pub use wms::{WmsSource, WmsSourceOpts, WmsVersion};

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use tilegate_core::{Coverage, MapBBox, Srs, TileFormat};
use tilegate_image::MapImage;

/// A map request against a source.
#[derive(Debug, Clone, PartialEq)]
pub struct MapQuery {
	pub bbox: MapBBox,
	pub size: (u32, u32),
	pub srs: Srs,
	pub format: TileFormat,
	pub transparent: bool,
}

/// A feature-info request (image coordinates of the queried pixel).
#[derive(Debug, Clone, PartialEq)]
pub struct InfoQuery {
	pub bbox: MapBBox,
	pub size: (u32, u32),
	pub srs: Srs,
	pub pos: (u32, u32),
	pub info_format: String,
	pub feature_count: Option<u32>,
}

/// A legend request.
#[derive(Debug, Clone, PartialEq)]
pub struct LegendQuery {
	pub format: TileFormat,
	pub scale: Option<f64>,
}

/// Resolution range a source answers, in SRS units per pixel.
/// `min_res` is the coarsest bound, `max_res` the finest.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResRange {
	pub min_res: Option<f64>,
	pub max_res: Option<f64>,
}

impl ResRange {
	pub fn contains(&self, res: f64) -> bool {
		if let Some(min_res) = self.min_res {
			if res > min_res {
				return false;
			}
		}
		if let Some(max_res) = self.max_res {
			if res < max_res {
				return false;
			}
		}
		true
	}
}

/// What to substitute when a source fails with a given HTTP status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorResponse {
	/// Substitute a fully transparent image.
	Transparent,
	/// Substitute a solid color.
	Color([u8; 3]),
	/// Propagate the error.
	Raise,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnErrorRule {
	pub response: ErrorResponse,
	/// Whether the substituted image may be written to the cache.
	pub cache: bool,
}

/// Maps HTTP status codes to substitution rules; `other` catches every
/// unlisted status.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandler {
	rules: HashMap<u16, OnErrorRule>,
	other: Option<OnErrorRule>,
}

impl ErrorHandler {
	pub fn new() -> ErrorHandler {
		ErrorHandler::default()
	}

	pub fn add(mut self, status: u16, rule: OnErrorRule) -> ErrorHandler {
		self.rules.insert(status, rule);
		self
	}

	pub fn add_other(mut self, rule: OnErrorRule) -> ErrorHandler {
		self.other = Some(rule);
		self
	}

	pub fn rule_for(&self, status: u16) -> Option<OnErrorRule> {
		self.rules.get(&status).copied().or(self.other)
	}

	pub fn is_empty(&self) -> bool {
		self.rules.is_empty() && self.other.is_none()
	}
}

/// A produced image plus whether it may be cached (error substitutions
/// are served but usually not stored).
#[derive(Debug, Clone)]
pub struct SourceResponse {
	pub image: MapImage,
	pub cacheable: bool,
}

impl SourceResponse {
	pub fn cacheable(image: MapImage) -> SourceResponse {
		SourceResponse {
			image,
			cacheable: true,
		}
	}

	pub fn uncacheable(image: MapImage) -> SourceResponse {
		SourceResponse {
			image,
			cacheable: false,
		}
	}
}

/// A producer of map imagery.
#[async_trait]
pub trait Source: Debug + Send + Sync {
	/// SRS this source can be queried in; empty means any.
	fn supported_srs(&self) -> &[Srs] {
		&[]
	}

	fn supports_srs(&self, srs: Srs) -> bool {
		let supported = self.supported_srs();
		supported.is_empty() || supported.contains(&srs)
	}

	/// Formats this source can produce; empty means any.
	fn supported_formats(&self) -> &[TileFormat] {
		&[]
	}

	fn supports_format(&self, format: TileFormat) -> bool {
		let supported = self.supported_formats();
		supported.is_empty() || supported.contains(&format)
	}

	/// Where this source is authoritative; `None` means everywhere.
	fn coverage(&self) -> Option<&Coverage> {
		None
	}

	fn res_range(&self) -> Option<ResRange> {
		None
	}

	/// Seed-only sources are skipped for live requests.
	fn is_seed_only(&self) -> bool {
		false
	}

	/// Whether the source produces transparent imagery.
	fn is_transparent(&self) -> bool {
		true
	}

	async fn get_map(&self, query: &MapQuery) -> Result<SourceResponse>;

	async fn get_legend(&self, _query: &LegendQuery) -> Result<MapImage> {
		bail!("source has no legend support")
	}

	async fn get_feature_info(&self, _query: &InfoQuery) -> Result<String> {
		bail!("source has no feature info support")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn res_range_bounds() {
		let range = ResRange {
			min_res: Some(1000.0),
			max_res: Some(10.0),
		};
		assert!(range.contains(500.0));
		assert!(range.contains(1000.0));
		assert!(range.contains(10.0));
		assert!(!range.contains(2000.0));
		assert!(!range.contains(5.0));
		assert!(ResRange::default().contains(1e9));
	}

	#[test]
	fn format_support_defaults_to_any() {
		#[derive(Debug)]
		struct Picky;

		#[async_trait]
		impl Source for Picky {
			fn supported_formats(&self) -> &[TileFormat] {
				&[TileFormat::PNG, TileFormat::PNG8]
			}
			async fn get_map(&self, _query: &MapQuery) -> Result<SourceResponse> {
				unreachable!()
			}
		}

		#[derive(Debug)]
		struct Any;

		#[async_trait]
		impl Source for Any {
			async fn get_map(&self, _query: &MapQuery) -> Result<SourceResponse> {
				unreachable!()
			}
		}

		let picky = Picky;
		assert!(picky.supports_format(TileFormat::PNG));
		assert!(!picky.supports_format(TileFormat::JPEG));

		let any = Any;
		assert!(any.supported_formats().is_empty());
		assert!(any.supports_format(TileFormat::JPEG));
	}

	#[test]
	fn error_handler_lookup() {
		let handler = ErrorHandler::new()
			.add(
				404,
				OnErrorRule {
					response: ErrorResponse::Transparent,
					cache: true,
				},
			)
			.add_other(OnErrorRule {
				response: ErrorResponse::Raise,
				cache: false,
			});
		assert_eq!(
			handler.rule_for(404).unwrap().response,
			ErrorResponse::Transparent
		);
		assert_eq!(handler.rule_for(500).unwrap().response, ErrorResponse::Raise);

		assert!(ErrorHandler::new().rule_for(500).is_none());
	}
}
