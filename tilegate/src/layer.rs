//! Layers: the user-facing composition of sources and caches.
//!
//! A layer is an ordered stack of entries, each a source (or a cache
//! wrapped as one) with an optional coverage and opacity. Rendering
//! queries the entries bottom to top, drops those whose coverage misses
//! the request, and alpha-composites the rest.

use crate::manager::TileManager;
use crate::source::{CachedSource, InfoQuery, LegendQuery, MapQuery, Source};
use anyhow::{ensure, Result};
use log::debug;
use std::sync::Arc;
use tilegate_core::{Coverage, MapBBox, MergeMethod, Srs, SrsRegistry};
use tilegate_image::{merge_layers, ImageOpts, MapImage, MergeLayer};

/// One entry of a layer stack.
#[derive(Debug, Clone)]
pub struct LayerEntry {
	pub source: Arc<dyn Source>,
	/// Restricts this entry beyond the source's own coverage.
	pub coverage: Option<Coverage>,
	/// Only serve this entry for requests in one of these SRS.
	pub srs_restriction: Option<Vec<Srs>>,
	pub opacity: Option<f64>,
}

impl LayerEntry {
	pub fn source(source: Arc<dyn Source>) -> LayerEntry {
		LayerEntry {
			source,
			coverage: None,
			srs_restriction: None,
			opacity: None,
		}
	}

	/// A cache feeding this layer (the common case for cached WMS).
	pub fn cache(manager: Arc<TileManager>) -> LayerEntry {
		LayerEntry::source(Arc::new(CachedSource::new(manager)))
	}

	pub fn with_coverage(mut self, coverage: Coverage) -> LayerEntry {
		self.coverage = Some(coverage);
		self
	}

	pub fn with_srs_restriction(mut self, srs: Vec<Srs>) -> LayerEntry {
		self.srs_restriction = Some(srs);
		self
	}

	pub fn with_opacity(mut self, opacity: f64) -> LayerEntry {
		self.opacity = Some(opacity);
		self
	}
}

/// Post-processing hook for concatenated feature-info documents (the
/// place an external XSLT engine plugs in).
pub type InfoTransform = dyn Fn(String) -> Result<String> + Send + Sync;

pub struct Layer {
	name: String,
	title: Option<String>,
	entries: Vec<LayerEntry>,
	registry: Arc<SrsRegistry>,
	image_opts: ImageOpts,
	info_transform: Option<Box<InfoTransform>>,
}

impl Layer {
	pub fn new(name: &str, entries: Vec<LayerEntry>, registry: Arc<SrsRegistry>) -> Layer {
		Layer {
			name: name.to_string(),
			title: None,
			entries,
			registry,
			image_opts: ImageOpts::transparent_png(),
			info_transform: None,
		}
	}

	pub fn with_info_transform(mut self, transform: Box<InfoTransform>) -> Layer {
		self.info_transform = Some(transform);
		self
	}

	pub fn with_title(mut self, title: &str) -> Layer {
		self.title = Some(title.to_string());
		self
	}

	pub fn with_image_opts(mut self, image_opts: ImageOpts) -> Layer {
		self.image_opts = image_opts;
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn title(&self) -> Option<&str> {
		self.title.as_deref()
	}

	pub fn entries(&self) -> &[LayerEntry] {
		&self.entries
	}

	/// Whether an entry participates in a request.
	fn entry_active(&self, entry: &LayerEntry, bbox: &MapBBox, srs: Srs) -> Result<bool> {
		if let Some(restriction) = &entry.srs_restriction {
			if !restriction.contains(&srs) {
				return Ok(false);
			}
		}
		for coverage in [entry.coverage.as_ref(), entry.source.coverage()].into_iter().flatten() {
			let coverage_bbox = self.registry.transform_bbox(srs, coverage.srs(), bbox)?;
			if !coverage.intersects(&coverage_bbox) {
				return Ok(false);
			}
		}
		Ok(true)
	}

	/// Renders the layer stack for a map request.
	pub async fn render(&self, query: &MapQuery) -> Result<MapImage> {
		ensure!(query.size.0 > 0 && query.size.1 > 0, "empty image size requested");

		let mut layers = Vec::new();
		for entry in &self.entries {
			if !self.entry_active(entry, &query.bbox, query.srs)? {
				debug!("layer '{}': entry skipped by coverage", self.name);
				continue;
			}
			// sources that cannot produce the requested format are asked
			// for one they declare; the merge re-encodes anyway
			let mut entry_query = query.clone();
			if !entry.source.supports_format(query.format) {
				let fallback = entry.source.supported_formats()[0];
				debug!(
					"layer '{}': requesting {fallback} instead of {} from source",
					self.name, query.format
				);
				entry_query.format = fallback;
			}
			let response = entry.source.get_map(&entry_query).await?;
			let mut image = response.image;
			if let Some(coverage) = &entry.coverage {
				let coverage = coverage.transform_to(query.srs, &self.registry)?;
				if !coverage.contains(&query.bbox) {
					let mask = coverage.rasterize_mask(&query.bbox, query.size);
					image.apply_alpha_mask(&mask);
				}
			}
			layers.push(match entry.opacity {
				Some(opacity) => MergeLayer::with_opacity(image, opacity),
				None => MergeLayer::new(image),
			});
		}

		merge_layers(
			layers,
			query.size,
			query.bbox,
			query.srs,
			self.image_opts.clone(),
			MergeMethod::Composite,
		)
	}

	/// Queries every entry in order and concatenates the results.
	pub async fn get_feature_info(&self, query: &InfoQuery) -> Result<String> {
		let mut parts = Vec::new();
		for entry in &self.entries {
			if !self.entry_active(entry, &query.bbox, query.srs)? {
				continue;
			}
			match entry.source.get_feature_info(query).await {
				Ok(info) if !info.is_empty() => parts.push(info),
				// sources without feature info support are skipped
				_ => {}
			}
		}
		let joined = parts.join("\n");
		match &self.info_transform {
			Some(transform) => transform(joined),
			None => Ok(joined),
		}
	}

	/// The first legend the stack produces, top-most entry first.
	pub async fn get_legend(&self, query: &LegendQuery) -> Result<MapImage> {
		for entry in self.entries.iter().rev() {
			if let Ok(image) = entry.source.get_legend(query).await {
				return Ok(image);
			}
		}
		anyhow::bail!("layer '{}' has no legend", self.name)
	}
}

impl std::fmt::Debug for Layer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Layer")
			.field("name", &self.name)
			.field("entries", &self.entries.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::source::DebugSource;
	use tilegate_core::TileFormat;

	fn query() -> MapQuery {
		MapQuery {
			bbox: MapBBox::new(0.0, 0.0, 10.0, 10.0),
			size: (64, 64),
			srs: Srs::WGS84,
			format: TileFormat::PNG,
			transparent: true,
		}
	}

	#[tokio::test]
	async fn coverage_drops_disjoint_entries() {
		let registry = Arc::new(SrsRegistry::new());
		let far_away = Coverage::bbox(Srs::WGS84, MapBBox::new(100.0, 50.0, 110.0, 60.0));
		let layer = Layer::new(
			"debug",
			vec![LayerEntry::source(Arc::new(DebugSource::new())).with_coverage(far_away)],
			registry,
		);
		let image = layer.render(&query()).await.unwrap();
		// nothing rendered, fully transparent
		assert!(image.is_blank());
	}

	#[tokio::test]
	async fn active_entry_renders() {
		let registry = Arc::new(SrsRegistry::new());
		let layer = Layer::new(
			"debug",
			vec![LayerEntry::source(Arc::new(DebugSource::new()))],
			registry,
		);
		let image = layer.render(&query()).await.unwrap();
		assert!(!image.is_blank());
	}

	#[tokio::test]
	async fn partial_coverage_clips() {
		let registry = Arc::new(SrsRegistry::new());
		// only the left half of the request is covered
		let half = Coverage::bbox(Srs::WGS84, MapBBox::new(0.0, 0.0, 5.0, 10.0));
		let layer = Layer::new(
			"debug",
			vec![LayerEntry::source(Arc::new(DebugSource::new())).with_coverage(half)],
			registry,
		);
		let image = layer.render(&query()).await.unwrap();
		let rgba = image.to_rgba();
		// right border pixels of the debug tile got masked away
		assert_eq!(rgba.get_pixel(63, 32).0[3], 0);
		assert!(rgba.get_pixel(0, 32).0[3] > 0);
	}

	#[tokio::test]
	async fn feature_info_skips_unsupporting_sources() {
		let registry = Arc::new(SrsRegistry::new());
		let layer = Layer::new(
			"debug",
			vec![LayerEntry::source(Arc::new(DebugSource::new()))],
			registry,
		);
		let info = layer
			.get_feature_info(&InfoQuery {
				bbox: MapBBox::new(0.0, 0.0, 10.0, 10.0),
				size: (64, 64),
				srs: Srs::WGS84,
				pos: (10, 10),
				info_format: "text/plain".to_string(),
				feature_count: None,
			})
			.await
			.unwrap();
		assert!(info.is_empty());
	}
}
