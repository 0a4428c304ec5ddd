//! Resource catalog, archive sources and payload decoding.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use servel_core::{
    AggregateResult, Election, InstallationReport, InstallationStatus, ResourceKey, TableResult,
    Territory,
};
use servel_storage::{extract_json_entry, FetchError, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "servel-adapters";

/// Per-request deadlines; the large one covers the per-table dumps.
#[derive(Debug, Clone, Copy)]
pub struct FetchTimeouts {
    pub small: Duration,
    pub large: Duration,
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            small: Duration::from_secs(30),
            large: Duration::from_secs(120),
        }
    }
}

/// Where a resource lives upstream and how long a fetch may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub key: ResourceKey,
    pub archive: String,
    pub entry: String,
    pub timeout: Duration,
}

impl ResourceDescriptor {
    pub fn for_key(key: ResourceKey, timeouts: &FetchTimeouts) -> Self {
        let stem = match key {
            ResourceKey::Territories => "territorios".to_string(),
            ResourceKey::Installation => "constitucion".to_string(),
            ResourceKey::Totals(e) => format!("total_votacion_{}", e.code()),
            ResourceKey::Tables(e) => format!("mesas_{}", e.code()),
        };
        Self {
            key,
            archive: format!("{stem}.zip"),
            entry: format!("{stem}.json"),
            timeout: if key.is_large() {
                timeouts.large
            } else {
                timeouts.small
            },
        }
    }
}

pub fn catalog(elections: &[Election], timeouts: &FetchTimeouts) -> Vec<ResourceDescriptor> {
    ResourceKey::catalog(elections)
        .into_iter()
        .map(|key| ResourceDescriptor::for_key(key, timeouts))
        .collect()
}

/// Anything that can hand over the raw archive for a resource.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_archive(&self, resource: &ResourceDescriptor) -> Result<Vec<u8>, FetchError>;
}

/// Downloads archives from the electoral service over HTTP.
#[derive(Debug)]
pub struct RemoteArchiveSource {
    base_url: String,
    http: HttpFetcher,
}

impl RemoteArchiveSource {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        let http = HttpFetcher::new(HttpClientConfig {
            referer: config.referer.clone().or_else(|| Some(base_url.clone())),
            ..config
        })
        .context("building archive http client")?;
        Ok(Self { base_url, http })
    }

    pub fn url_for(&self, resource: &ResourceDescriptor) -> String {
        format!("{}/{}", self.base_url, resource.archive)
    }
}

#[async_trait]
impl ArchiveSource for RemoteArchiveSource {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn fetch_archive(&self, resource: &ResourceDescriptor) -> Result<Vec<u8>, FetchError> {
        let url = self.url_for(resource);
        let resp = self
            .http
            .fetch_bytes(&resource.key.to_string(), &url, resource.timeout)
            .await?;
        Ok(resp.body)
    }
}

/// Reads previously captured archives from a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryArchiveSource {
    root: PathBuf,
}

impl DirectoryArchiveSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArchiveSource for DirectoryArchiveSource {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn fetch_archive(&self, resource: &ResourceDescriptor) -> Result<Vec<u8>, FetchError> {
        let path = self.root.join(&resource.archive);
        tokio::fs::read(&path).await.map_err(|source| FetchError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

/// In-process archives, counting every fetch. Used to replay fixtures.
#[derive(Debug, Default)]
pub struct MemoryArchiveSource {
    archives: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, u16>>,
    fetches: Mutex<HashMap<String, usize>>,
    total_fetches: AtomicUsize,
}

impl MemoryArchiveSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_archive(&self, archive: impl Into<String>, bytes: Vec<u8>) {
        let archive = archive.into();
        self.failures.lock().await.remove(&archive);
        self.archives.lock().await.insert(archive, bytes);
    }

    /// Zips `json` under the descriptor's entry name and publishes it.
    pub async fn put_json(&self, resource: &ResourceDescriptor, json: &[u8]) -> anyhow::Result<()> {
        let bytes = zip_single_entry(&resource.entry, json)?;
        self.put_archive(resource.archive.clone(), bytes).await;
        Ok(())
    }

    /// Makes the archive answer with an HTTP status instead of content.
    pub async fn fail_with_status(&self, archive: impl Into<String>, status: u16) {
        self.failures.lock().await.insert(archive.into(), status);
    }

    pub fn total_fetches(&self) -> usize {
        self.total_fetches.load(Ordering::SeqCst)
    }

    pub async fn fetches_of(&self, archive: &str) -> usize {
        self.fetches.lock().await.get(archive).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ArchiveSource for MemoryArchiveSource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_archive(&self, resource: &ResourceDescriptor) -> Result<Vec<u8>, FetchError> {
        self.total_fetches.fetch_add(1, Ordering::SeqCst);
        *self
            .fetches
            .lock()
            .await
            .entry(resource.archive.clone())
            .or_default() += 1;

        if let Some(status) = self.failures.lock().await.get(&resource.archive) {
            return Err(FetchError::HttpStatus {
                status: *status,
                url: resource.archive.clone(),
            });
        }
        self.archives
            .lock()
            .await
            .get(&resource.archive)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: resource.archive.clone(),
            })
    }
}

pub fn zip_single_entry(entry: &str, body: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(entry, zip::write::SimpleFileOptions::default())
        .with_context(|| format!("starting zip entry {entry}"))?;
    writer
        .write_all(body)
        .with_context(|| format!("writing zip entry {entry}"))?;
    Ok(writer.finish().context("finishing zip archive")?.into_inner())
}

/// Downloads the resource archive and returns its JSON payload bytes.
pub async fn fetch_payload(
    source: &dyn ArchiveSource,
    resource: &ResourceDescriptor,
) -> Result<Vec<u8>, FetchError> {
    let archive = source.fetch_archive(resource).await?;
    let payload = extract_json_entry(&resource.archive, &archive, &resource.entry)?;
    debug!(
        resource = %resource.key,
        source = source.name(),
        archive_bytes = archive.len(),
        payload_bytes = payload.len(),
        "payload extracted"
    );
    Ok(payload)
}

/// Decoded upstream payload, typed per resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Territories(Vec<Territory>),
    Installation(InstallationReport),
    Totals(Vec<AggregateResult>),
    Tables(Vec<TableResult>),
}

impl Payload {
    /// The upstream iteration marker, taken from the first record of list payloads.
    pub fn marker(&self) -> Option<&str> {
        match self {
            Payload::Territories(rows) => rows
                .first()
                .and_then(|t| t.extra.get("iteracion"))
                .and_then(|v| v.as_str()),
            Payload::Installation(report) => report.iteracion.as_deref(),
            Payload::Totals(rows) => rows.first().and_then(|r| r.iteracion.as_deref()),
            Payload::Tables(rows) => rows.first().and_then(|r| r.iteracion.as_deref()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Territories(rows) => rows.len(),
            Payload::Installation(report) => report.mesas.len(),
            Payload::Totals(rows) => rows.len(),
            Payload::Tables(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed {resource} payload: {source}")]
    Decode {
        resource: ResourceKey,
        #[source]
        source: serde_json::Error,
    },
    #[error("{resource} payload holds no records")]
    Empty { resource: ResourceKey },
}

pub fn decode_payload(key: ResourceKey, bytes: &[u8]) -> Result<Payload, PayloadError> {
    let decode_err = |source: serde_json::Error| PayloadError::Decode {
        resource: key,
        source,
    };
    let payload = match key {
        ResourceKey::Territories => {
            Payload::Territories(serde_json::from_slice(bytes).map_err(decode_err)?)
        }
        ResourceKey::Installation => {
            // Published either as a summary object or as a bare list of table flags.
            let raw: serde_json::Value = serde_json::from_slice(bytes).map_err(decode_err)?;
            let report = if raw.is_array() {
                InstallationReport {
                    iteracion: None,
                    porcentaje: None,
                    total_mesas: 0,
                    instaladas: 0,
                    mesas: serde_json::from_value::<Vec<InstallationStatus>>(raw)
                        .map_err(decode_err)?,
                }
            } else {
                serde_json::from_value(raw).map_err(decode_err)?
            };
            Payload::Installation(report)
        }
        ResourceKey::Totals(_) => Payload::Totals(serde_json::from_slice(bytes).map_err(decode_err)?),
        ResourceKey::Tables(election) => {
            let mut rows: Vec<TableResult> = serde_json::from_slice(bytes).map_err(decode_err)?;
            for row in rows.iter_mut().filter(|r| r.cod_eleccion == 0) {
                row.cod_eleccion = election.code();
            }
            Payload::Tables(rows)
        }
    };

    // The installation summary may legitimately carry only the percentage.
    if payload.is_empty() && key != ResourceKey::Installation {
        return Err(PayloadError::Empty { resource: key });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_follow_upstream_archive_names() {
        let timeouts = FetchTimeouts::default();
        let totals = ResourceDescriptor::for_key(ResourceKey::Totals(Election::Presidential), &timeouts);
        assert_eq!(totals.archive, "total_votacion_4.zip");
        assert_eq!(totals.entry, "total_votacion_4.json");
        assert_eq!(totals.timeout, timeouts.small);

        let tables = ResourceDescriptor::for_key(ResourceKey::Tables(Election::Deputies), &timeouts);
        assert_eq!(tables.archive, "mesas_6.zip");
        assert_eq!(tables.timeout, timeouts.large);

        assert_eq!(catalog(&[Election::Senators], &timeouts).len(), 4);
    }

    #[test]
    fn table_rows_inherit_the_race_code() {
        let payload = decode_payload(
            ResourceKey::Tables(Election::Senators),
            br#"[{"iteracion":"8","id_mesa":"77","total_emitidos":10}]"#,
        )
        .unwrap();
        let Payload::Tables(rows) = &payload else {
            panic!("expected tables payload");
        };
        assert_eq!(rows[0].cod_eleccion, 5);
        assert_eq!(payload.marker(), Some("8"));
    }

    #[test]
    fn installation_accepts_summary_or_rows() {
        let summary = decode_payload(ResourceKey::Installation, br#"{"iteracion":"3","porc":"99,7"}"#).unwrap();
        assert_eq!(summary.marker(), Some("3"));

        let rows = decode_payload(
            ResourceKey::Installation,
            br#"[{"id_mesa":1,"instalada":1},{"id_mesa":2,"instalada":0}]"#,
        )
        .unwrap();
        let Payload::Installation(report) = rows else {
            panic!("expected installation payload");
        };
        assert_eq!(report.completion_percent(), Some(50.0));
    }

    #[test]
    fn empty_and_malformed_payloads_are_rejected() {
        let empty = decode_payload(ResourceKey::Totals(Election::Presidential), b"[]").unwrap_err();
        assert!(matches!(empty, PayloadError::Empty { .. }));

        let malformed = decode_payload(ResourceKey::Territories, b"{\"oops\":").unwrap_err();
        assert!(matches!(malformed, PayloadError::Decode { .. }));
    }

    #[tokio::test]
    async fn memory_source_counts_fetches_and_reports_missing_archives() {
        let source = MemoryArchiveSource::new();
        let resource = ResourceDescriptor::for_key(ResourceKey::Installation, &FetchTimeouts::default());

        let missing = fetch_payload(&source, &resource).await.unwrap_err();
        assert!(matches!(missing, FetchError::HttpStatus { status: 404, .. }));

        source.put_json(&resource, br#"{"porc":"10"}"#).await.unwrap();
        let payload = fetch_payload(&source, &resource).await.unwrap();
        assert_eq!(payload, br#"{"porc":"10"}"#);
        assert_eq!(source.fetches_of("constitucion.zip").await, 2);
        assert_eq!(source.total_fetches(), 2);
    }
}
