//! Band-merge source: synthesizes an image by picking channels from
//! multiple sub-sources.

use super::{MapQuery, ResRange, Source, SourceResponse};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use tilegate_core::Coverage;
use tilegate_image::{band_merge, BandSelect, ImageOpts};

#[derive(Debug)]
pub struct BandMergeSource {
	sources: Vec<Arc<dyn Source>>,
	/// Output channel selections `[r, g, b, a]`; see [`band_merge`].
	channels: [Vec<BandSelect>; 4],
	coverage: Option<Coverage>,
}

impl BandMergeSource {
	pub fn new(sources: Vec<Arc<dyn Source>>, channels: [Vec<BandSelect>; 4]) -> BandMergeSource {
		BandMergeSource {
			sources,
			channels,
			coverage: None,
		}
	}

	pub fn with_coverage(mut self, coverage: Coverage) -> BandMergeSource {
		self.coverage = Some(coverage);
		self
	}

	/// A grayscale mapping (`l` in the configuration): the selection
	/// feeds all three color channels.
	pub fn luminance(sources: Vec<Arc<dyn Source>>, select: Vec<BandSelect>) -> BandMergeSource {
		BandMergeSource::new(sources, [select.clone(), select.clone(), select, Vec::new()])
	}
}

#[async_trait]
impl Source for BandMergeSource {
	fn coverage(&self) -> Option<&Coverage> {
		self.coverage.as_ref()
	}

	fn res_range(&self) -> Option<ResRange> {
		// the narrowest sub-source range bounds the merged source
		let mut merged: Option<ResRange> = None;
		for source in &self.sources {
			if let Some(range) = source.res_range() {
				let merged = merged.get_or_insert(range);
				merged.min_res = match (merged.min_res, range.min_res) {
					(Some(a), Some(b)) => Some(a.min(b)),
					(a, b) => a.or(b),
				};
				merged.max_res = match (merged.max_res, range.max_res) {
					(Some(a), Some(b)) => Some(a.max(b)),
					(a, b) => a.or(b),
				};
			}
		}
		merged
	}

	async fn get_map(&self, query: &MapQuery) -> Result<SourceResponse> {
		let responses = try_join_all(self.sources.iter().map(|s| s.get_map(query))).await?;
		let cacheable = responses.iter().all(|r| r.cacheable);
		let images: Vec<_> = responses.into_iter().map(|r| r.image).collect();

		let opts = ImageOpts {
			format: query.format,
			transparent: query.transparent,
			..ImageOpts::default()
		};
		let image = band_merge(&images, &self.channels, query.size, query.bbox, query.srs, opts)?;
		Ok(SourceResponse { image, cacheable })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::source::DebugSource;
	use tilegate_core::{MapBBox, Srs, TileFormat};

	#[tokio::test]
	async fn merges_channels_from_sub_sources() {
		let sources: Vec<Arc<dyn Source>> = vec![Arc::new(DebugSource::new()), Arc::new(DebugSource::new())];
		let channels = [
			vec![BandSelect::new(0, 0)],
			vec![BandSelect::new(1, 1)],
			vec![BandSelect::new(0, 2)],
			Vec::new(),
		];
		let merged = BandMergeSource::new(sources, channels);
		let response = merged
			.get_map(&MapQuery {
				bbox: MapBBox::new(0.0, 0.0, 10.0, 10.0),
				size: (64, 64),
				srs: Srs::WGS84,
				format: TileFormat::PNG,
				transparent: true,
			})
			.await
			.unwrap();
		assert_eq!(response.image.size(), (64, 64));
		// empty alpha selection yields full opacity
		assert!(response.image.to_rgba().pixels().all(|p| p.0[3] == 255));
	}
}
