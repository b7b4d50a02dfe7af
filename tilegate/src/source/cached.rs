//! Cache-as-source: a tile manager used as the source of another cache.
//!
//! Requests pass through the full meta-tile and locking machinery of the
//! wrapped manager, so a cascade of caches dedupes upstream fetches on
//! every level independently.

use super::{MapQuery, ResRange, Source, SourceResponse};
use crate::manager::{CreationMode, TileManager};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tilegate_core::Coverage;

#[derive(Debug)]
pub struct CachedSource {
	manager: Arc<TileManager>,
	supported_srs: Vec<tilegate_core::Srs>,
	res_range: Option<ResRange>,
}

impl CachedSource {
	pub fn new(manager: Arc<TileManager>) -> CachedSource {
		// the wrapped cache serves any SRS by reprojecting its grid
		CachedSource {
			manager,
			supported_srs: Vec::new(),
			res_range: None,
		}
	}

	pub fn with_res_range(mut self, res_range: ResRange) -> CachedSource {
		self.res_range = Some(res_range);
		self
	}

	pub fn manager(&self) -> &Arc<TileManager> {
		&self.manager
	}
}

#[async_trait]
impl Source for CachedSource {
	fn supported_srs(&self) -> &[tilegate_core::Srs] {
		&self.supported_srs
	}

	fn coverage(&self) -> Option<&Coverage> {
		self.manager.coverage()
	}

	fn res_range(&self) -> Option<ResRange> {
		self.res_range
	}

	async fn get_map(&self, query: &MapQuery) -> Result<SourceResponse> {
		let image = self
			.manager
			.get_map(&query.bbox, query.srs, query.size, CreationMode::Live)
			.await?;
		Ok(SourceResponse::cacheable(image))
	}
}
