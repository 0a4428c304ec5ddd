//! Chunked bulk merges with best-effort reporting.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use serde::Serialize;
use servel_storage::{ChunkOutcome, StoreError};
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const TABLES_CHUNK_SIZE: usize = 500;

/// Totals for one merge across all of its chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub inserted: u64,
    pub modified: u64,
    /// Records submitted after key deduplication.
    pub attempted: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub duplicates: u64,
    pub processed_chunks: u64,
    pub failed_chunks: u64,
    /// Records in failed chunks plus records rejected individually.
    pub failed_records: u64,
    /// Rows removed after a complete reload.
    pub pruned: u64,
}

impl MergeReport {
    /// True only when every chunk and every record in it was written.
    pub fn is_complete(&self) -> bool {
        self.failed_chunks == 0 && self.failed_records == 0
    }

    pub fn absorb(&mut self, other: MergeReport) {
        self.inserted += other.inserted;
        self.modified += other.modified;
        self.attempted += other.attempted;
        self.matched += other.matched;
        self.unmatched += other.unmatched;
        self.duplicates += other.duplicates;
        self.processed_chunks += other.processed_chunks;
        self.failed_chunks += other.failed_chunks;
        self.failed_records += other.failed_records;
        self.pruned += other.pruned;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchUpserter {
    chunk_size: usize,
}

impl Default for BatchUpserter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl BatchUpserter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Feeds `records` to `write` one chunk at a time.
    ///
    /// Keys are deduplicated across the whole input before chunking, so the
    /// chunk size never changes which records are written. A failed chunk is
    /// logged and counted; later chunks still run.
    pub async fn merge<T, K, F, W, Fut>(
        &self,
        label: &str,
        records: Vec<T>,
        key: F,
        mut write: W,
    ) -> MergeReport
    where
        K: Eq + Hash,
        F: Fn(&T) -> K,
        W: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<ChunkOutcome, StoreError>>,
    {
        let mut report = MergeReport::default();
        let raw_len = records.len();
        let records = dedupe_by_key(records, &key);
        report.duplicates = (raw_len - records.len()) as u64;
        let mut remaining = records.into_iter();

        for index in 0.. {
            let chunk: Vec<T> = remaining.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let size = chunk.len() as u64;
            report.attempted += size;

            match write(chunk).await {
                Ok(outcome) => {
                    report.processed_chunks += 1;
                    report.inserted += outcome.inserted;
                    report.modified += outcome.modified;
                    report.matched += outcome.matched;
                    report.unmatched += outcome.unmatched;
                    report.failed_records += outcome.failed;
                    debug!(
                        resource = label,
                        chunk = index,
                        records = size,
                        inserted = outcome.inserted,
                        modified = outcome.modified,
                        "chunk merged"
                    );
                }
                Err(err) => {
                    report.failed_chunks += 1;
                    report.failed_records += size;
                    warn!(resource = label, chunk = index, records = size, error = %err, "chunk merge failed");
                }
            }
        }
        report
    }
}

/// Keeps the last record per key, at the position of its first occurrence.
fn dedupe_by_key<T, K, F>(records: Vec<T>, key: &F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut positions: HashMap<K, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<T> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(&key(&record)) {
            Some(&at) => out[at] = record,
            None => {
                positions.insert(key(&record), out.len());
                out.push(record);
            }
        }
    }
    out
}
