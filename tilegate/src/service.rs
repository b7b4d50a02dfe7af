//! The public operations exposed to the services layer.
//!
//! The (external) WMS/WMTS/TMS/KML front-ends call these; everything
//! returns `(bytes, content-type)` plus typed errors the front-end maps
//! to wire errors. Stack traces and — with `hide_exception_url` — source
//! URLs never reach a response.

use crate::layer::Layer;
use crate::manager::{CreationMode, TileManager};
use crate::source::{InfoQuery, LegendQuery, MapQuery};
use anyhow::{bail, Context, Result};
use std::{collections::HashMap, sync::Arc};
use tilegate_core::{
	LockTimeout, MapBBox, SourceError, Srs, TileCoord, TileData, TileFormat,
};

/// An encoded response body plus its content type.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
	pub bytes: Vec<u8>,
	pub content_type: String,
}

/// HTTP status a typed error maps to, for the wire layer.
pub fn wire_status(err: &anyhow::Error) -> u16 {
	if err.downcast_ref::<LockTimeout>().is_some() {
		return 500;
	}
	match err.downcast_ref::<SourceError>() {
		Some(SourceError::UnsupportedSrs(_)) | Some(SourceError::UnsupportedFormat(_)) => 400,
		Some(_) => 500,
		None => 500,
	}
}

/// Facade over the configured layers and tile caches.
#[derive(Debug, Default)]
pub struct TileService {
	/// Tile pyramids by (layer name, grid name).
	tile_layers: HashMap<(String, String), Arc<TileManager>>,
	/// Map layers by name.
	map_layers: HashMap<String, Arc<Layer>>,
}

impl TileService {
	pub fn new() -> TileService {
		TileService::default()
	}

	pub fn add_tile_layer(&mut self, layer_name: &str, manager: Arc<TileManager>) {
		self.tile_layers.insert(
			(layer_name.to_string(), manager.grid().name().to_string()),
			manager,
		);
	}

	pub fn add_map_layer(&mut self, layer: Arc<Layer>) {
		self.map_layers.insert(layer.name().to_string(), layer);
	}

	pub fn tile_layer(&self, layer: &str, grid: &str) -> Result<&Arc<TileManager>> {
		self
			.tile_layers
			.get(&(layer.to_string(), grid.to_string()))
			.with_context(|| format!("unknown tile layer '{layer}' on grid '{grid}'"))
	}

	pub fn map_layer(&self, layer: &str) -> Result<&Arc<Layer>> {
		self
			.map_layers
			.get(layer)
			.with_context(|| format!("unknown layer '{layer}'"))
	}

	/// Serves one tile (WMTS/TMS path). Empty-marker tiles are expanded
	/// into an encoded blank tile.
	pub async fn get_tile(
		&self,
		layer: &str,
		grid: &str,
		z: u8,
		x: u32,
		y: u32,
		format: TileFormat,
	) -> Result<ServiceResponse> {
		let manager = self.tile_layer(layer, grid)?;
		// a tile cache serves its stored encoding only; mixed caches
		// resolve the format per tile
		let stored = manager.opts().format;
		if stored != TileFormat::MIXED && format != stored {
			bail!(SourceError::UnsupportedFormat(format.to_string()));
		}
		let tile = manager.get_tile(TileCoord::new(z, x, y)).await?;
		match tile.data {
			TileData::Bytes { bytes, format } => Ok(ServiceResponse {
				bytes,
				content_type: format.as_mime_str().to_string(),
			}),
			TileData::Empty | TileData::Missing => {
				let (bytes, format) = manager.empty_tile_bytes()?;
				Ok(ServiceResponse {
					bytes,
					content_type: format.as_mime_str().to_string(),
				})
			}
		}
	}

	/// Serves a map image (WMS path).
	pub async fn get_map(
		&self,
		layer: &str,
		bbox: &MapBBox,
		srs: Srs,
		size: (u32, u32),
		format: TileFormat,
	) -> Result<ServiceResponse> {
		let layer = self.map_layer(layer)?;
		let query = MapQuery {
			bbox: *bbox,
			size,
			srs,
			format,
			transparent: format.supports_transparency(),
		};
		let image = layer.render(&query).await?;
		let encoded = image.encode_as(&tilegate_image::ImageOpts {
			format,
			transparent: format.supports_transparency(),
			..image.opts().clone()
		})?;
		Ok(ServiceResponse {
			content_type: encoded.mime().to_string(),
			bytes: encoded.bytes,
		})
	}

	pub async fn get_feature_info(
		&self,
		layer: &str,
		bbox: &MapBBox,
		srs: Srs,
		size: (u32, u32),
		pos: (u32, u32),
		info_format: &str,
	) -> Result<ServiceResponse> {
		let layer = self.map_layer(layer)?;
		let info = layer
			.get_feature_info(&InfoQuery {
				bbox: *bbox,
				size,
				srs,
				pos,
				info_format: info_format.to_string(),
				feature_count: None,
			})
			.await?;
		Ok(ServiceResponse {
			bytes: info.into_bytes(),
			content_type: info_format.to_string(),
		})
	}

	pub async fn get_legend(
		&self,
		layer: &str,
		scale: Option<f64>,
		format: TileFormat,
	) -> Result<ServiceResponse> {
		let layer = self.map_layer(layer)?;
		let image = layer.get_legend(&LegendQuery { format, scale }).await?;
		let encoded = image.encode()?;
		Ok(ServiceResponse {
			content_type: encoded.mime().to_string(),
			bytes: encoded.bytes,
		})
	}

	/// Direct map access against one cache, bypassing layer composition
	/// (used by cascading setups and tests).
	pub async fn get_cached_map(
		&self,
		layer: &str,
		grid: &str,
		bbox: &MapBBox,
		srs: Srs,
		size: (u32, u32),
		format: TileFormat,
	) -> Result<ServiceResponse> {
		let manager = self.tile_layer(layer, grid)?;
		let image = manager.get_map(bbox, srs, size, CreationMode::Live).await?;
		let encoded = image.encode_as(&tilegate_image::ImageOpts {
			format,
			transparent: format.supports_transparency(),
			..image.opts().clone()
		})?;
		Ok(ServiceResponse {
			content_type: encoded.mime().to_string(),
			bytes: encoded.bytes,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn wire_status_mapping() {
		let bad_srs: anyhow::Error = SourceError::UnsupportedSrs("EPSG:31467".to_string()).into();
		assert_eq!(wire_status(&bad_srs), 400);

		let upstream: anyhow::Error = SourceError::Http {
			status: 502,
			url: None,
		}
		.into();
		assert_eq!(wire_status(&upstream), 500);

		let lock: anyhow::Error = LockTimeout {
			fingerprint: "x".to_string(),
			timeout: Duration::from_secs(1),
		}
		.into();
		assert_eq!(wire_status(&lock), 500);
	}

	#[test]
	fn unknown_layer_is_an_error() {
		let service = TileService::new();
		assert!(service.map_layer("nope").is_err());
		assert!(service.tile_layer("nope", "GLOBAL_WEBMERCATOR").is_err());
	}

	#[tokio::test]
	async fn get_tile_rejects_foreign_format() {
		use crate::manager::TileManagerBuilder;
		use std::sync::Arc;
		use tilegate_cache::MemoryCache;
		use tilegate_core::{GlobalConfig, SrsRegistry, TileGrid};

		let manager = TileManagerBuilder::new(
			"png_cache",
			Arc::new(TileGrid::web_mercator()),
			Arc::new(MemoryCache::new()),
			Vec::new(),
			GlobalConfig::default().arc(),
			Arc::new(SrsRegistry::new()),
		)
		.build()
		.unwrap();
		let mut service = TileService::new();
		service.add_tile_layer("osm", manager);

		let err = service
			.get_tile("osm", "GLOBAL_WEBMERCATOR", 0, 0, 0, TileFormat::JPEG)
			.await
			.unwrap_err();
		assert_eq!(wire_status(&err), 400);

		// the stored format passes the gate
		assert!(service
			.get_tile("osm", "GLOBAL_WEBMERCATOR", 0, 0, 0, TileFormat::PNG)
			.await
			.is_ok());
	}
}
