use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use servel_core::{
    AggregateResult, Candidate, Election, GeoUnit, InstallationStatus, ResourceState, TableResult,
    Territory,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("document encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Counters for one submitted chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkOutcome {
    pub inserted: u64,
    pub modified: u64,
    /// Update-only merges: records that matched at least one stored row.
    pub matched: u64,
    /// Update-only merges: records that matched nothing.
    pub unmatched: u64,
    /// Records that failed individually while the rest of the chunk went through.
    pub failed: u64,
}

impl ChunkOutcome {
    pub fn absorb(&mut self, other: ChunkOutcome) {
        self.inserted += other.inserted;
        self.modified += other.modified;
        self.matched += other.matched;
        self.unmatched += other.unmatched;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub territories: u64,
    pub table_results: u64,
    pub aggregate_results: u64,
    pub candidates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StoreBackend::Postgres),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend `{other}`")),
        }
    }
}

/// One collection per entity, each upserted by its natural key.
///
/// Every write method receives one chunk and attempts every record in it; an
/// `Err` means the chunk as a whole could not be applied.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn upsert_territories(&self, chunk: &[Territory]) -> Result<ChunkOutcome, StoreError>;

    /// Drops territories whose id is not in `keep`. Returns the number removed.
    async fn retain_territories(&self, keep: &[String]) -> Result<u64, StoreError>;

    async fn upsert_table_results(&self, chunk: &[TableResult]) -> Result<ChunkOutcome, StoreError>;

    /// Update-only: refreshes `instalada` on existing table rows of every race.
    async fn apply_installation(
        &self,
        chunk: &[InstallationStatus],
    ) -> Result<ChunkOutcome, StoreError>;

    /// Snapshots stamped with an older marker than the stored one are skipped.
    async fn upsert_aggregates(&self, chunk: &[AggregateResult]) -> Result<ChunkOutcome, StoreError>;

    async fn upsert_candidates(&self, chunk: &[Candidate]) -> Result<ChunkOutcome, StoreError>;

    async fn resource_states(&self) -> Result<Vec<ResourceState>, StoreError>;

    async fn save_resource_state(&self, state: &ResourceState) -> Result<(), StoreError>;

    async fn table_results(
        &self,
        election: Election,
        unit: GeoUnit,
    ) -> Result<Vec<TableResult>, StoreError>;

    async fn aggregates(&self, election: Election) -> Result<Vec<AggregateResult>, StoreError>;

    async fn candidates(&self) -> Result<Vec<Candidate>, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;
}
