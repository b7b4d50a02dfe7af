//! CouchDB cache backend.
//!
//! One document per tile, the payload stored as the `tile` attachment.
//! Replacement is rev-aware: stores fetch the current revision and PUT
//! against it, losing a race simply retries once (last writer wins, the
//! database never serves a torn tile).

use crate::{BackendCapabilities, CacheBackend};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::trace;
use reqwest::StatusCode;
use std::fmt::Debug;
use tilegate_core::{CacheError, Tile, TileCoord, TileData, TileFormat};

pub struct CouchDbCache {
	client: reqwest::Client,
	db_url: String,
	format: TileFormat,
	tile_id: String,
}

impl CouchDbCache {
	/// `url` is the CouchDB root (e.g. `http://localhost:5984`), `db_name`
	/// the database holding the tile documents.
	pub fn new(url: &str, db_name: &str, format: TileFormat) -> Result<CouchDbCache> {
		let client = reqwest::Client::builder()
			.min_tls_version(reqwest::tls::Version::TLS_1_2)
			.build()
			.context("could not build CouchDB client")?;
		Ok(CouchDbCache {
			client,
			db_url: format!("{}/{}", url.trim_end_matches('/'), db_name),
			format,
			tile_id: "%(z)d_%(x)d_%(y)d".to_string(),
		})
	}

	/// Overrides the document id template; `%(x)d`, `%(y)d` and `%(z)d`
	/// are substituted.
	pub fn with_tile_id(mut self, template: &str) -> CouchDbCache {
		self.tile_id = template.to_string();
		self
	}

	fn document_id(&self, coord: &TileCoord) -> String {
		self
			.tile_id
			.replace("%(x)d", &coord.x.to_string())
			.replace("%(y)d", &coord.y.to_string())
			.replace("%(z)d", &coord.z.to_string())
	}

	fn attachment_url(&self, coord: &TileCoord) -> String {
		format!("{}/{}/tile", self.db_url, self.document_id(coord))
	}

	/// The current revision of the tile document, when it exists.
	async fn current_rev(&self, coord: &TileCoord) -> Result<Option<String>> {
		let url = format!("{}/{}", self.db_url, self.document_id(coord));
		let response = self
			.client
			.head(&url)
			.send()
			.await
			.map_err(|e| CacheError::Backend(e.to_string()))?;
		if response.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		let rev = response
			.headers()
			.get("etag")
			.and_then(|v| v.to_str().ok())
			.map(|v| v.trim_matches('"').to_string());
		Ok(rev)
	}

	async fn put_attachment(&self, coord: &TileCoord, bytes: &[u8], mime: &str) -> Result<StatusCode> {
		let mut url = self.attachment_url(coord);
		if let Some(rev) = self.current_rev(coord).await? {
			url = format!("{url}?rev={rev}");
		}
		let response = self
			.client
			.put(&url)
			.header("content-type", mime)
			.body(bytes.to_vec())
			.send()
			.await
			.map_err(|e| CacheError::Backend(e.to_string()))?;
		Ok(response.status())
	}
}

#[async_trait]
impl CacheBackend for CouchDbCache {
	fn backend_name(&self) -> &str {
		"couchdb"
	}

	fn cache_layout(&self) -> &str {
		"couchdb"
	}

	fn capabilities(&self) -> BackendCapabilities {
		BackendCapabilities {
			supports_link_identical: false,
			is_persistent: true,
			supports_mtime: false,
		}
	}

	async fn load(&self, coord: &TileCoord, _with_metadata: bool) -> Result<Tile> {
		let url = self.attachment_url(coord);
		trace!("GET {url}");
		let response = self
			.client
			.get(&url)
			.send()
			.await
			.map_err(|e| CacheError::Backend(e.to_string()))?;
		match response.status() {
			StatusCode::NOT_FOUND => Ok(Tile::missing(*coord)),
			status if status.is_success() => {
				let bytes = response
					.bytes()
					.await
					.map_err(|e| CacheError::Backend(e.to_string()))?;
				if bytes.is_empty() {
					Ok(Tile::new(*coord, TileData::Empty))
				} else {
					Ok(Tile::new(*coord, TileData::bytes(bytes.to_vec(), self.format)))
				}
			}
			status => Err(CacheError::Backend(format!("CouchDB returned {status} for {url}")).into()),
		}
	}

	async fn store(&self, tile: &Tile) -> Result<()> {
		let (bytes, mime): (&[u8], &str) = match &tile.data {
			TileData::Bytes { bytes, format } => (bytes, format.as_mime_str()),
			TileData::Empty => (&[], self.format.as_mime_str()),
			TileData::Missing => return Ok(()),
		};
		let status = self.put_attachment(&tile.coord, bytes, mime).await?;
		if status == StatusCode::CONFLICT {
			// lost a revision race; the retry fetches the fresh rev
			let status = self.put_attachment(&tile.coord, bytes, mime).await?;
			if !status.is_success() {
				return Err(CacheError::Backend(format!("CouchDB store failed with {status}")).into());
			}
			return Ok(());
		}
		if !status.is_success() {
			return Err(CacheError::Backend(format!("CouchDB store failed with {status}")).into());
		}
		Ok(())
	}

	async fn remove(&self, coord: &TileCoord) -> Result<()> {
		let Some(rev) = self.current_rev(coord).await? else {
			return Ok(());
		};
		let url = format!("{}/{}?rev={rev}", self.db_url, self.document_id(coord));
		let response = self
			.client
			.delete(&url)
			.send()
			.await
			.map_err(|e| CacheError::Backend(e.to_string()))?;
		if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
			return Err(CacheError::Backend(format!("CouchDB delete failed with {}", response.status())).into());
		}
		Ok(())
	}

	async fn is_cached(&self, coord: &TileCoord) -> bool {
		let response = self.client.head(self.attachment_url(coord)).send().await;
		matches!(response, Ok(r) if r.status().is_success())
	}
}

impl Debug for CouchDbCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CouchDbCache")
			.field("db_url", &self.db_url)
			.field("tile_id", &self.tile_id)
			.finish()
	}
}
