//! WMS source.
//!
//! Builds GetMap/GetFeatureInfo/GetLegendGraphic requests against an
//! upstream WMS. When the query SRS is not supported by the server, the
//! request is transformed into the best supported SRS (preferred list
//! first, then any) and the response is resampled back.

use super::{
	ErrorHandler, ErrorResponse, InfoQuery, LegendQuery, MapQuery, ResRange, Source, SourceResponse,
};
use crate::client::HttpClient;
use anyhow::{bail, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use tilegate_core::{Coverage, MapBBox, Resampling, SourceError, Srs, SrsRegistry, TileFormat};
use tilegate_image::{ImageOpts, ImageTransformer, MapImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WmsVersion {
	V111,
	#[default]
	V130,
}

impl WmsVersion {
	fn as_str(&self) -> &str {
		match self {
			WmsVersion::V111 => "1.1.1",
			WmsVersion::V130 => "1.3.0",
		}
	}

	fn srs_param(&self) -> &str {
		match self {
			WmsVersion::V111 => "SRS",
			WmsVersion::V130 => "CRS",
		}
	}
}

#[derive(Debug, Clone)]
pub struct WmsSourceOpts {
	/// Base URL up to the query string (a trailing `?` or `&` is handled).
	pub url: String,
	pub layers: Vec<String>,
	pub styles: Option<String>,
	pub version: WmsVersion,
	pub transparent: bool,
	/// Format requested from the server.
	pub format: TileFormat,
	/// Formats the server offers; empty means any.
	pub supported_formats: Vec<TileFormat>,
	pub supported_srs: Vec<Srs>,
	/// Tried in order when the query SRS is unsupported.
	pub preferred_src_srs: Vec<Srs>,
	pub custom_params: Vec<(String, String)>,
	pub sld: Option<String>,
	pub info_format: Option<String>,
	pub coverage: Option<Coverage>,
	pub res_range: Option<ResRange>,
	pub seed_only: bool,
	pub on_error: ErrorHandler,
	pub resampling: Resampling,
}

impl WmsSourceOpts {
	pub fn new(url: &str, layers: &[&str]) -> WmsSourceOpts {
		WmsSourceOpts {
			url: url.to_string(),
			layers: layers.iter().map(|l| l.to_string()).collect(),
			styles: None,
			version: WmsVersion::default(),
			transparent: true,
			format: TileFormat::PNG,
			supported_formats: Vec::new(),
			supported_srs: Vec::new(),
			preferred_src_srs: Vec::new(),
			custom_params: Vec::new(),
			sld: None,
			info_format: None,
			coverage: None,
			res_range: None,
			seed_only: false,
			on_error: ErrorHandler::new(),
			resampling: Resampling::Bicubic,
		}
	}
}

#[derive(Debug)]
pub struct WmsSource {
	opts: WmsSourceOpts,
	client: Arc<HttpClient>,
	transformer: ImageTransformer,
}

impl WmsSource {
	pub fn new(opts: WmsSourceOpts, client: Arc<HttpClient>, registry: Arc<SrsRegistry>) -> WmsSource {
		WmsSource {
			opts,
			client,
			transformer: ImageTransformer::new(registry),
		}
	}

	/// The SRS the upstream request is made in. Unsupported query SRS
	/// falls back to the preferred list, then to the first supported.
	fn request_srs(&self, query_srs: Srs) -> Result<Srs> {
		if self.supports_srs(query_srs) {
			return Ok(query_srs);
		}
		for preferred in &self.opts.preferred_src_srs {
			if self.supports_srs(*preferred) {
				return Ok(*preferred);
			}
		}
		self
			.opts
			.supported_srs
			.first()
			.copied()
			.ok_or_else(|| SourceError::UnsupportedSrs(query_srs.to_string()).into())
	}

	/// WMS 1.3.0 swaps the axis order for north/east systems.
	fn bbox_param(&self, bbox: &MapBBox, srs: Srs) -> String {
		if self.opts.version == WmsVersion::V130 && srs.is_axis_order_ne() {
			format!("{},{},{},{}", bbox.1, bbox.0, bbox.3, bbox.2)
		} else {
			bbox.as_string_list()
		}
	}

	fn base_params(&self) -> Vec<(String, String)> {
		let mut params: Vec<(String, String)> = vec![
			("SERVICE".to_string(), "WMS".to_string()),
			("VERSION".to_string(), self.opts.version.as_str().to_string()),
		];
		if let Some(sld) = &self.opts.sld {
			params.push(("SLD".to_string(), sld.clone()));
		}
		for (name, value) in &self.opts.custom_params {
			params.push((name.clone(), value.clone()));
		}
		params
	}

	fn build_url(&self, params: &[(String, String)]) -> Result<String> {
		let mut url = reqwest::Url::parse(&self.opts.url)
			.map_err(|e| SourceError::Other(format!("invalid WMS URL: {e}")))?;
		url.query_pairs_mut().extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
		Ok(url.to_string())
	}

	fn map_url(&self, bbox: &MapBBox, size: (u32, u32), srs: Srs, format: TileFormat) -> Result<String> {
		let mut params = self.base_params();
		params.extend([
			("REQUEST".to_string(), "GetMap".to_string()),
			("LAYERS".to_string(), self.opts.layers.join(",")),
			(
				"STYLES".to_string(),
				self.opts.styles.clone().unwrap_or_default(),
			),
			("FORMAT".to_string(), format.as_mime_str().to_string()),
			(
				"TRANSPARENT".to_string(),
				if self.opts.transparent { "TRUE" } else { "FALSE" }.to_string(),
			),
			("WIDTH".to_string(), size.0.to_string()),
			("HEIGHT".to_string(), size.1.to_string()),
			(self.opts.version.srs_param().to_string(), srs.to_string()),
			("BBOX".to_string(), self.bbox_param(bbox, srs)),
		]);
		self.build_url(&params)
	}

	/// Applies the `on_error` mapping to an upstream failure.
	fn substitute_error(&self, err: anyhow::Error, query: &MapQuery) -> Result<SourceResponse> {
		let status = match err.downcast_ref::<SourceError>() {
			Some(SourceError::Http { status, .. }) => *status,
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
		warn!("substituting {:?} for WMS error {status}", rule.response);
		let image = MapImage::blank(query.size, query.bbox, query.srs, opts);
		Ok(SourceResponse {
			image,
			cacheable: rule.cache,
		})
	}
}

#[async_trait]
impl Source for WmsSource {
	fn supported_srs(&self) -> &[Srs] {
		&self.opts.supported_srs
	}

	fn supported_formats(&self) -> &[TileFormat] {
		&self.opts.supported_formats
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

	fn is_transparent(&self) -> bool {
		self.opts.transparent
	}

	async fn get_map(&self, query: &MapQuery) -> Result<SourceResponse> {
		let request_srs = self.request_srs(query.srs)?;
		let registry = self.transformer.registry().clone();

		// unsupported query SRS: request in a supported one covering the
		// same area at a comparable pixel count, resample afterwards
		let (request_bbox, request_size) = if request_srs == query.srs {
			(query.bbox, query.size)
		} else {
			let bbox = registry.transform_bbox(query.srs, request_srs, &query.bbox)?;
			(bbox, query.size)
		};

		let url = self.map_url(&request_bbox, request_size, request_srs, self.opts.format)?;
		debug!("WMS GetMap {url}");
		let response = match self.client.get(&url).await {
			Ok(response) => response,
			Err(err) => return self.substitute_error(err, query),
		};

		let opts = ImageOpts {
			format: query.format,
			transparent: query.transparent,
			..ImageOpts::default()
		};
		let image = MapImage::from_bytes(&response.bytes, request_bbox, request_srs, opts)?;

		if request_srs == query.srs {
			return Ok(SourceResponse::cacheable(image));
		}
		let resampled =
			self.transformer
				.transform(&image, &query.bbox, query.srs, query.size, self.opts.resampling)?;
		Ok(SourceResponse::cacheable(resampled))
	}

	async fn get_legend(&self, query: &LegendQuery) -> Result<MapImage> {
		let mut params = self.base_params();
		params.extend([
			("REQUEST".to_string(), "GetLegendGraphic".to_string()),
			("LAYER".to_string(), self.opts.layers.join(",")),
			("FORMAT".to_string(), query.format.as_mime_str().to_string()),
		]);
		if let Some(scale) = query.scale {
			params.push(("SCALE".to_string(), scale.to_string()));
		}
		let url = self.build_url(&params)?;
		let response = self.client.get(&url).await?;
		MapImage::from_bytes(
			&response.bytes,
			MapBBox::new(0.0, 0.0, 1.0, 1.0),
			Srs::WGS84,
			ImageOpts::default(),
		)
	}

	async fn get_feature_info(&self, query: &InfoQuery) -> Result<String> {
		let request_srs = self.request_srs(query.srs)?;
		if request_srs != query.srs {
			bail!(SourceError::UnsupportedSrs(format!(
				"feature info requires direct SRS support, got {}",
				query.srs
			)));
		}
		let (i_param, j_param) = match self.opts.version {
			WmsVersion::V111 => ("X", "Y"),
			WmsVersion::V130 => ("I", "J"),
		};
		let mut params = self.base_params();
		params.extend([
			("REQUEST".to_string(), "GetFeatureInfo".to_string()),
			("LAYERS".to_string(), self.opts.layers.join(",")),
			("QUERY_LAYERS".to_string(), self.opts.layers.join(",")),
			("STYLES".to_string(), String::new()),
			("WIDTH".to_string(), query.size.0.to_string()),
			("HEIGHT".to_string(), query.size.1.to_string()),
			(self.opts.version.srs_param().to_string(), query.srs.to_string()),
			("BBOX".to_string(), self.bbox_param(&query.bbox, query.srs)),
			(
				"INFO_FORMAT".to_string(),
				self
					.opts
					.info_format
					.clone()
					.unwrap_or_else(|| query.info_format.clone()),
			),
			(i_param.to_string(), query.pos.0.to_string()),
			(j_param.to_string(), query.pos.1.to_string()),
		]);
		if let Some(count) = query.feature_count {
			params.push(("FEATURE_COUNT".to_string(), count.to_string()));
		}
		let url = self.build_url(&params)?;
		let response = self.client.get(&url).await?;
		Ok(String::from_utf8_lossy(&response.bytes).to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::client::HttpClientOpts;

	fn source(opts: WmsSourceOpts) -> WmsSource {
		WmsSource::new(
			opts,
			Arc::new(HttpClient::new(HttpClientOpts::default()).unwrap()),
			Arc::new(SrsRegistry::new()),
		)
	}

	fn query_param<'a>(url: &'a str, name: &str) -> Option<String> {
		let parsed = reqwest::Url::parse(url).unwrap();
		parsed
			.query_pairs()
			.find(|(k, _)| k == name)
			.map(|(_, v)| v.to_string())
	}

	#[test]
	fn get_map_url_contains_all_params() {
		let source = source(WmsSourceOpts::new("http://example.org/service?map=osm", &["roads", "rails"]));
		let url = source
			.map_url(
				&MapBBox::new(0.0, 40.0, 10.0, 50.0),
				(256, 256),
				Srs::WEBMERCATOR,
				TileFormat::PNG,
			)
			.unwrap();
		assert_eq!(query_param(&url, "map").as_deref(), Some("osm"));
		assert_eq!(query_param(&url, "REQUEST").as_deref(), Some("GetMap"));
		assert_eq!(query_param(&url, "LAYERS").as_deref(), Some("roads,rails"));
		assert_eq!(query_param(&url, "VERSION").as_deref(), Some("1.3.0"));
		assert_eq!(query_param(&url, "CRS").as_deref(), Some("EPSG:3857"));
		assert_eq!(query_param(&url, "BBOX").as_deref(), Some("0,40,10,50"));
		assert_eq!(query_param(&url, "TRANSPARENT").as_deref(), Some("TRUE"));
	}

	#[test]
	fn wms_130_flips_axis_order_for_geographic() {
		let mut opts = WmsSourceOpts::new("http://example.org/wms", &["osm"]);
		opts.version = WmsVersion::V130;
		let source = source(opts);
		let url = source
			.map_url(
				&MapBBox::new(4.0, 46.0, 16.0, 56.0),
				(800, 600),
				Srs::WGS84,
				TileFormat::PNG,
			)
			.unwrap();
		assert_eq!(query_param(&url, "BBOX").as_deref(), Some("46,4,56,16"));
		assert_eq!(query_param(&url, "CRS").as_deref(), Some("EPSG:4326"));
	}

	#[test]
	fn wms_111_keeps_lonlat_order() {
		let mut opts = WmsSourceOpts::new("http://example.org/wms", &["osm"]);
		opts.version = WmsVersion::V111;
		let source = source(opts);
		let url = source
			.map_url(
				&MapBBox::new(4.0, 46.0, 16.0, 56.0),
				(800, 600),
				Srs::WGS84,
				TileFormat::PNG,
			)
			.unwrap();
		assert_eq!(query_param(&url, "BBOX").as_deref(), Some("4,46,16,56"));
		assert_eq!(query_param(&url, "SRS").as_deref(), Some("EPSG:4326"));
	}

	#[test]
	fn srs_negotiation_prefers_configured_order() {
		let mut opts = WmsSourceOpts::new("http://example.org/wms", &["osm"]);
		opts.supported_srs = vec![Srs::new(25832), Srs::WEBMERCATOR];
		opts.preferred_src_srs = vec![Srs::WEBMERCATOR];
		let source = source(opts);

		// supported directly
		assert_eq!(source.request_srs(Srs::new(25832)).unwrap(), Srs::new(25832));
		// unsupported: preferred list wins over declaration order
		assert_eq!(source.request_srs(Srs::WGS84).unwrap(), Srs::WEBMERCATOR);
	}

	#[test]
	fn srs_negotiation_fails_without_supported_srs_match() {
		let mut opts = WmsSourceOpts::new("http://example.org/wms", &["osm"]);
		opts.supported_srs = Vec::new(); // any SRS accepted
		let source = source(opts);
		assert_eq!(source.request_srs(Srs::new(31467)).unwrap(), Srs::new(31467));
	}

	#[tokio::test]
	async fn on_error_substitutes_transparent() {
		let mut opts = WmsSourceOpts::new("http://127.0.0.1:9/wms", &["osm"]);
		opts.on_error = ErrorHandler::new().add(
			503,
			super::super::OnErrorRule {
				response: ErrorResponse::Transparent,
				cache: false,
			},
		);
		let source = source(opts);
		let query = MapQuery {
			bbox: MapBBox::new(0.0, 0.0, 10.0, 10.0),
			size: (64, 64),
			srs: Srs::WGS84,
			format: TileFormat::PNG,
			transparent: true,
		};
		let err = SourceError::Http {
			status: 503,
			url: None,
		};
		let response = source.substitute_error(err.into(), &query).unwrap();
		assert!(!response.cacheable);
		assert!(response.image.is_blank());

		// unmapped status propagates
		let err = SourceError::Http {
			status: 500,
			url: None,
		};
		assert!(source.substitute_error(err.into(), &query).is_err());
	}
}
