//! HTTP archive fetching, archive extraction and document persistence.

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ORIGIN, REFERER};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use zip::result::ZipError;
use zip::ZipArchive;

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{ChunkOutcome, DocumentStore, StoreBackend, StoreCounts, StoreError};

pub const CRATE_NAME: &str = "servel-storage";

/// How a failed fetch should be reported. Neither class is retried before the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transport,
    Payload,
}

pub fn classify_status(status: StatusCode) -> FailureClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FailureClass::Transport
    } else {
        FailureClass::Payload
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid archive: {0}")]
    Archive(#[from] ZipError),
    #[error("archive {archive} has no {entry} payload")]
    MissingEntry { archive: String, entry: String },
    #[error("{entry} in {archive} exceeds {limit} bytes")]
    EntryTooLarge { archive: String, entry: String, limit: u64 },
}

impl FetchError {
    pub fn class(&self) -> FailureClass {
        match self {
            FetchError::Request(_) | FetchError::Io { .. } => FailureClass::Transport,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(FailureClass::Transport),
            FetchError::Archive(_)
            | FetchError::MissingEntry { .. }
            | FetchError::EntryTooLarge { .. } => FailureClass::Payload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            referer: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Shared reqwest client capping simultaneous requests across resources.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/zip,application/octet-stream;q=0.9,*/*;q=0.8"),
        );
        if let Some(referer) = &config.referer {
            let origin = referer.trim_end_matches('/');
            headers.insert(
                REFERER,
                HeaderValue::from_str(&format!("{origin}/")).context("building referer header")?,
            );
            headers.insert(
                ORIGIN,
                HeaderValue::from_str(origin).context("building origin header")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    /// Single attempt with its own deadline; failures wait for the next scheduled tick.
    pub async fn fetch_bytes(
        &self,
        resource: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", resource, url, timeout_secs = timeout.as_secs());
        async {
            let resp = self.client.get(url).timeout(timeout).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "archive downloaded");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Upper bound on one decompressed payload.
pub const MAX_ENTRY_BYTES: u64 = 1 << 30;
const PREALLOC_LIMIT: u64 = 16 << 20;

/// Reads the JSON payload out of a downloaded archive.
///
/// `expected` is looked up first; otherwise the archive must hold exactly one
/// `.json` entry.
pub fn extract_json_entry(
    archive_name: &str,
    bytes: &[u8],
    expected: &str,
) -> Result<Vec<u8>, FetchError> {
    extract_entry_within(archive_name, bytes, expected, MAX_ENTRY_BYTES)
}

fn extract_entry_within(
    archive_name: &str,
    bytes: &[u8],
    expected: &str,
    limit: u64,
) -> Result<Vec<u8>, FetchError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let entry = if archive.file_names().any(|name| name == expected) {
        expected.to_string()
    } else {
        let json_entries = archive
            .file_names()
            .filter(|name| name.to_ascii_lowercase().ends_with(".json"))
            .map(str::to_string)
            .collect::<Vec<_>>();
        match json_entries.as_slice() {
            [only] => only.clone(),
            _ => {
                return Err(FetchError::MissingEntry {
                    archive: archive_name.to_string(),
                    entry: expected.to_string(),
                })
            }
        }
    };

    // The declared size comes from the archive header and is not trusted.
    let file = archive.by_name(&entry)?;
    let mut buf = Vec::with_capacity(file.size().min(PREALLOC_LIMIT) as usize);
    file.take(limit.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|source| FetchError::Io {
            path: format!("{archive_name}!{entry}"),
            source,
        })?;
    if buf.len() as u64 > limit {
        return Err(FetchError::EntryTooLarge {
            archive: archive_name.to_string(),
            entry,
            limit,
        });
    }
    Ok(buf)
}
