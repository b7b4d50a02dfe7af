//! Typed error kinds shared across the workspace.
//!
//! The tile manager and the services layer need to distinguish error classes
//! (retry a source timeout, swallow a cache read error, map a lock timeout to
//! a 500). Everything else uses `anyhow` with context; these kinds convert
//! into `anyhow::Error` transparently.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by map sources (WMS, tile templates, cascaded caches).
#[derive(Error, Debug)]
pub enum SourceError {
	#[error("source request timed out after {0:?}")]
	Timeout(Duration),

	#[error("source returned HTTP {status}{}", url_suffix(.url))]
	Http {
		status: u16,
		/// Omitted when `hide_error_details` is set.
		url: Option<String>,
	},

	#[error("could not connect to source{}: {reason}", url_suffix(.url))]
	Connection {
		url: Option<String>,
		reason: String,
	},

	#[error("source does not support SRS {0}")]
	UnsupportedSrs(String),

	#[error("source does not support format {0}")]
	UnsupportedFormat(String),

	#[error("{0}")]
	Other(String),
}

impl SourceError {
	/// Whether a retry can succeed. Client errors (4xx) are permanent,
	/// connection failures and server errors (5xx) are transient.
	pub fn is_transient(&self) -> bool {
		match self {
			SourceError::Timeout(_) | SourceError::Connection { .. } => true,
			SourceError::Http { status, .. } => *status >= 500,
			_ => false,
		}
	}
}

fn url_suffix(url: &Option<String>) -> String {
	match url {
		Some(url) => format!(" ({url})"),
		None => String::new(),
	}
}

/// Errors raised by tile cache backends.
#[derive(Error, Debug)]
pub enum CacheError {
	#[error("cache I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("cache is locked: {0}")]
	Locked(String),

	#[error("corrupt cache entry: {0}")]
	Corrupt(String),

	#[error("cache backend error: {0}")]
	Backend(String),
}

/// A per-fingerprint lock could not be acquired within the timeout.
#[derive(Error, Debug)]
#[error("could not lock {fingerprint} within {timeout:?}")]
pub struct LockTimeout {
	pub fingerprint: String,
	pub timeout: Duration,
}

/// Errors raised while constructing or combining coverages.
#[derive(Error, Debug)]
pub enum CoverageError {
	#[error("invalid coverage geometry: {0}")]
	InvalidGeometry(String),

	#[error("could not parse coverage: {0}")]
	Parse(String),
}

/// Raster decode/encode failures.
#[derive(Error, Debug)]
pub enum ImageError {
	#[error("could not decode image: {0}")]
	Decode(String),

	#[error("could not encode image: {0}")]
	Encode(String),
}

/// Invalid or inconsistent configuration values.
#[derive(Error, Debug)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn http_error_hides_url_when_absent() {
		let visible = SourceError::Http {
			status: 502,
			url: Some("http://example.org/wms".to_string()),
		};
		assert_eq!(
			visible.to_string(),
			"source returned HTTP 502 (http://example.org/wms)"
		);

		let hidden = SourceError::Http { status: 502, url: None };
		assert_eq!(hidden.to_string(), "source returned HTTP 502");
	}

	#[test]
	fn transient_classification() {
		assert!(SourceError::Timeout(Duration::from_secs(1)).is_transient());
		assert!(SourceError::Http { status: 503, url: None }.is_transient());
		assert!(!SourceError::Http { status: 404, url: None }.is_transient());
		assert!(!SourceError::UnsupportedSrs("EPSG:31467".to_string()).is_transient());
	}
}
