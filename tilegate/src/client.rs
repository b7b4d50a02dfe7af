//! Shared HTTP client for upstream sources.
//!
//! Wraps one pooled `reqwest` client per configuration: request timeout,
//! basic auth, custom headers, TLS floor at 1.2. `concurrent_requests`
//! is enforced per hostname (not per URL) with one semaphore shared by
//! every source using this client.

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, warn};
use std::{sync::Arc, time::Duration};
use tilegate_core::SourceError;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct HttpClientOpts {
	pub timeout: Duration,
	/// Maximum in-flight requests per hostname; 0 disables the limit.
	pub concurrent_requests: usize,
	pub headers: Vec<(String, String)>,
	pub basic_auth: Option<(String, String)>,
	/// Strip URLs from error messages (`hide_error_details`).
	pub hide_error_details: bool,
	/// Accept invalid upstream certificates (`ssl_no_cert_checks`).
	pub insecure: bool,
}

impl Default for HttpClientOpts {
	fn default() -> Self {
		HttpClientOpts {
			timeout: Duration::from_secs(60),
			concurrent_requests: 0,
			headers: Vec::new(),
			basic_auth: None,
			hide_error_details: false,
			insecure: false,
		}
	}
}

#[derive(Debug)]
pub struct HttpClient {
	client: reqwest::Client,
	opts: HttpClientOpts,
	host_semaphores: DashMap<String, Arc<Semaphore>>,
}

/// A successful upstream response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
	pub bytes: Vec<u8>,
	pub content_type: Option<String>,
}

impl HttpClient {
	pub fn new(opts: HttpClientOpts) -> Result<HttpClient> {
		let mut builder = reqwest::Client::builder()
			.timeout(opts.timeout)
			.min_tls_version(reqwest::tls::Version::TLS_1_2);
		if opts.insecure {
			builder = builder.danger_accept_invalid_certs(true);
		}
		let client = builder.build().context("could not build HTTP client")?;
		Ok(HttpClient {
			client,
			opts,
			host_semaphores: DashMap::new(),
		})
	}

	fn semaphore_for(&self, url: &reqwest::Url) -> Option<Arc<Semaphore>> {
		if self.opts.concurrent_requests == 0 {
			return None;
		}
		let host = url.host_str().unwrap_or("").to_string();
		Some(
			self
				.host_semaphores
				.entry(host)
				.or_insert_with(|| Arc::new(Semaphore::new(self.opts.concurrent_requests)))
				.clone(),
		)
	}

	fn error_url(&self, url: &str) -> Option<String> {
		if self.opts.hide_error_details {
			None
		} else {
			Some(url.to_string())
		}
	}

	/// GETs `url` and returns body plus content type.
	///
	/// # Errors
	/// `SourceError::Timeout` on timeouts, `SourceError::Connection` on
	/// transport failures and `SourceError::Http` on non-2xx responses.
	pub async fn get(&self, url: &str) -> Result<HttpResponse> {
		let parsed = reqwest::Url::parse(url)
			.map_err(|e| SourceError::Other(format!("invalid source URL: {e}")))?;

		let _permit = match self.semaphore_for(&parsed) {
			Some(semaphore) => Some(semaphore.acquire_owned().await.expect("semaphore closed")),
			None => None,
		};

		let mut request = self.client.get(parsed);
		for (name, value) in &self.opts.headers {
			request = request.header(name, value);
		}
		if let Some((user, password)) = &self.opts.basic_auth {
			request = request.basic_auth(user, Some(password));
		}

		debug!("GET {url}");
		let response = request.send().await.map_err(|err| {
			if err.is_timeout() {
				SourceError::Timeout(self.opts.timeout)
			} else {
				SourceError::Connection {
					url: self.error_url(url),
					reason: scrub(&err),
				}
			}
		})?;

		let status = response.status();
		if !status.is_success() {
			warn!("source returned {status} for {url}");
			return Err(SourceError::Http {
				status: status.as_u16(),
				url: self.error_url(url),
			}
			.into());
		}

		let content_type = response
			.headers()
			.get("content-type")
			.and_then(|v| v.to_str().ok())
			.map(|v| v.to_string());
		let bytes = response.bytes().await.map_err(|err| SourceError::Connection {
			url: self.error_url(url),
			reason: scrub(&err),
		})?;

		Ok(HttpResponse {
			bytes: bytes.to_vec(),
			content_type,
		})
	}
}

/// reqwest errors embed the URL; drop it so `hide_error_details` cannot
/// leak through the reason string.
fn scrub(err: &reqwest::Error) -> String {
	let mut err_without_url = err.to_string();
	if let Some(url) = err.url() {
		err_without_url = err_without_url.replace(url.as_str(), "<source>");
	}
	err_without_url
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn invalid_url_is_a_source_error() {
		let client = HttpClient::new(HttpClientOpts::default()).unwrap();
		let err = client.get("not a url").await.unwrap_err();
		assert!(err.downcast_ref::<SourceError>().is_some());
	}

	#[tokio::test]
	async fn connection_refused_maps_to_connection_error() {
		let client = HttpClient::new(HttpClientOpts {
			timeout: Duration::from_millis(500),
			..HttpClientOpts::default()
		})
		.unwrap();
		// nothing listens on this port
		let err = client.get("http://127.0.0.1:9/tile.png").await.unwrap_err();
		match err.downcast_ref::<SourceError>() {
			Some(SourceError::Connection { .. }) | Some(SourceError::Timeout(_)) => {}
			other => panic!("unexpected error {other:?}"),
		}
	}

	#[tokio::test]
	async fn hidden_error_details_omit_url() {
		let client = HttpClient::new(HttpClientOpts {
			timeout: Duration::from_millis(500),
			hide_error_details: true,
			..HttpClientOpts::default()
		})
		.unwrap();
		let err = client.get("http://127.0.0.1:9/secret?key=1").await.unwrap_err();
		assert!(!err.to_string().contains("secret"), "leaked: {err}");
	}
}
