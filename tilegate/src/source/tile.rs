//! Tile source: fetches from an existing tile server via URL template.
//!
//! Supported placeholders: `%(x)s`, `%(y)s`, `%(z)s`, `%(quadkey)s`,
//! `%(bbox)s` (and the brace forms `{x}`, `{y}`, `{z}`, `{quadkey}`,
//! `{bbox}`). Row numbering follows the source grid's origin. Requests
//! covering several tiles are assembled from the individual fetches.

use super::{ErrorHandler, ErrorResponse, MapQuery, ResRange, Source, SourceResponse};
use crate::client::HttpClient;
use anyhow::{ensure, Result};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use tilegate_core::{Coverage, Srs, SrsRegistry, TileCoord, TileFormat, TileGrid};
use tilegate_image::{merge_layers, ImageOpts, ImageTransformer, MapImage, MergeLayer};

#[derive(Debug, Clone)]
pub struct TileSourceOpts {
	pub template: String,
	pub format: TileFormat,
	/// Fetch `@2x` tiles (double pixel size per tile).
	pub retina: bool,
	pub coverage: Option<Coverage>,
	pub res_range: Option<ResRange>,
	pub seed_only: bool,
	pub on_error: ErrorHandler,
}

impl TileSourceOpts {
	pub fn new(template: &str) -> TileSourceOpts {
		TileSourceOpts {
			template: template.to_string(),
			format: TileFormat::PNG,
			retina: false,
			coverage: None,
			res_range: None,
			seed_only: false,
			// missing tiles are common on sparse tile servers
			on_error: ErrorHandler::new().add(
				404,
				super::OnErrorRule {
					response: ErrorResponse::Transparent,
					cache: false,
				},
			),
		}
	}
}

#[derive(Debug)]
pub struct TileSource {
	opts: TileSourceOpts,
	grid: Arc<TileGrid>,
	supported_srs: [Srs; 1],
	supported_formats: [TileFormat; 1],
	client: Arc<HttpClient>,
	transformer: ImageTransformer,
}

impl TileSource {
	pub fn new(
		opts: TileSourceOpts,
		grid: Arc<TileGrid>,
		client: Arc<HttpClient>,
		registry: Arc<SrsRegistry>,
	) -> TileSource {
		let supported_srs = [grid.srs()];
		// the upstream server stores exactly one encoding
		let supported_formats = [opts.format];
		TileSource {
			opts,
			grid,
			supported_srs,
			supported_formats,
			client,
			transformer: ImageTransformer::new(registry),
		}
	}

	pub fn tile_url(&self, coord: &TileCoord) -> String {
		let bbox = self.grid.tile_bbox(coord);
		let scale = if self.opts.retina { "@2x" } else { "" };
		self
			.opts
			.template
			.replace("%(x)s", &coord.x.to_string())
			.replace("%(y)s", &coord.y.to_string())
			.replace("%(z)s", &coord.z.to_string())
			.replace("%(quadkey)s", &coord.as_quadkey())
			.replace("%(bbox)s", &bbox.as_string_list())
			.replace("{x}", &coord.x.to_string())
			.replace("{y}", &coord.y.to_string())
			.replace("{z}", &coord.z.to_string())
			.replace("{quadkey}", &coord.as_quadkey())
			.replace("{bbox}", &bbox.as_string_list())
			.replace("{scale}", scale)
	}

	async fn fetch_tile(&self, coord: &TileCoord, transparent: bool) -> Result<SourceResponse> {
		let url = self.tile_url(coord);
		debug!("tile fetch {url}");
		let bbox = self.grid.tile_bbox(coord);
		let opts = ImageOpts {
			format: self.opts.format,
			transparent,
			..ImageOpts::default()
		};
		match self.client.get(&url).await {
			Ok(response) => Ok(SourceResponse::cacheable(MapImage::from_bytes(
				&response.bytes,
				bbox,
				self.grid.srs(),
				opts,
			)?)),
			Err(err) => {
				let status = match err.downcast_ref::<tilegate_core::SourceError>() {
					Some(tilegate_core::SourceError::Http { status, .. }) => *status,
					_ => return Err(err),
				};
				let Some(rule) = self.opts.on_error.rule_for(status) else {
					return Err(err);
				};
				let opts = match rule.response {
					ErrorResponse::Raise => return Err(err),
					ErrorResponse::Transparent => ImageOpts::transparent_png(),
					ErrorResponse::Color(color) => ImageOpts {
						bgcolor: color,
						..ImageOpts::default()
					},
				};
				let size = self.tile_pixel_size();
				Ok(SourceResponse {
					image: MapImage::blank(size, bbox, self.grid.srs(), opts),
					cacheable: rule.cache,
				})
			}
		}
	}

	fn tile_pixel_size(&self) -> (u32, u32) {
		let (w, h) = self.grid.tile_size();
		if self.opts.retina {
			(w * 2, h * 2)
		} else {
			(w, h)
		}
	}
}

#[async_trait]
impl Source for TileSource {
	fn supported_srs(&self) -> &[Srs] {
		&self.supported_srs
	}

	fn supported_formats(&self) -> &[TileFormat] {
		&self.supported_formats
	}

	fn coverage(&self) -> Option<&Coverage> {
		self.opts.coverage.as_ref()
	}

	fn res_range(&self) -> Option<ResRange> {
		self.opts.res_range
	}

	fn is_seed_only(&self) -> bool {
		self.opts.seed_only
	}

	async fn get_map(&self, query: &MapQuery) -> Result<SourceResponse> {
		ensure!(
			query.srs == self.grid.srs(),
			tilegate_core::SourceError::UnsupportedSrs(query.srs.to_string())
		);
		let res = query.bbox.resolution_for_size(query.size);
		let z = self.grid.level_for_res(res);
		let range = self.grid.tiles_for_bbox(&query.bbox, z)?;
		ensure!(!range.is_empty(), "request outside the source grid");

		let mut cacheable = true;
		let mut layers = Vec::with_capacity(range.len());
		for coord in range.iter() {
			let response = self.fetch_tile(&coord, query.transparent).await?;
			cacheable &= response.cacheable;
			// place the tile into the request frame
			let placed = self.transformer.transform(
				&response.image,
				&query.bbox,
				query.srs,
				query.size,
				tilegate_core::Resampling::Bilinear,
			)?;
			layers.push(MergeLayer::new(placed));
		}

		let opts = ImageOpts {
			format: query.format,
			transparent: query.transparent,
			..ImageOpts::default()
		};
		let image = merge_layers(
			layers,
			query.size,
			query.bbox,
			query.srs,
			opts,
			tilegate_core::MergeMethod::Composite,
		)?;
		Ok(SourceResponse { image, cacheable })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::client::HttpClientOpts;

	fn source(template: &str, retina: bool) -> TileSource {
		let mut opts = TileSourceOpts::new(template);
		opts.retina = retina;
		TileSource::new(
			opts,
			Arc::new(TileGrid::web_mercator()),
			Arc::new(HttpClient::new(HttpClientOpts::default()).unwrap()),
			Arc::new(SrsRegistry::new()),
		)
	}

	#[test]
	fn template_substitution() {
		let source = source("http://tiles.example.org/%(z)s/%(x)s/%(y)s.png", false);
		assert_eq!(
			source.tile_url(&TileCoord::new(5, 13, 8)),
			"http://tiles.example.org/5/13/8.png"
		);
	}

	#[test]
	fn brace_template_and_quadkey() {
		let source = source("http://tiles.example.org/{quadkey}.png?s={scale}", false);
		assert_eq!(
			source.tile_url(&TileCoord::new(3, 3, 5)),
			"http://tiles.example.org/213.png?s="
		);

		let retina = source_with_scale();
		assert_eq!(
			retina.tile_url(&TileCoord::new(1, 0, 0)),
			"http://tiles.example.org/1/0/0@2x.png"
		);
	}

	fn source_with_scale() -> TileSource {
		source("http://tiles.example.org/{z}/{x}/{y}{scale}.png", true)
	}

	#[test]
	fn bbox_template() {
		let source = source("http://example.org/?bbox=%(bbox)s", false);
		let url = source.tile_url(&TileCoord::new(0, 0, 0));
		assert!(url.starts_with("http://example.org/?bbox=-20037508.34"));
	}

	#[test]
	fn retina_doubles_pixel_size() {
		assert_eq!(source_with_scale().tile_pixel_size(), (512, 512));
	}

	#[test]
	fn declares_its_storage_format() {
		let source = source("http://tiles.example.org/{z}/{x}/{y}.png", false);
		assert_eq!(source.supported_formats(), &[TileFormat::PNG]);
		assert!(source.supports_format(TileFormat::PNG));
		assert!(!source.supports_format(TileFormat::JPEG));
	}

	#[tokio::test]
	async fn rejects_foreign_srs() {
		let source = source("http://tiles.example.org/{z}/{x}/{y}.png", false);
		let query = MapQuery {
			bbox: tilegate_core::MapBBox::new(0.0, 0.0, 10.0, 10.0),
			size: (256, 256),
			srs: Srs::WGS84,
			format: TileFormat::PNG,
			transparent: true,
		};
		assert!(source.get_map(&query).await.is_err());
	}
}
