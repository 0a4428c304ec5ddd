//! Process-local store used by tests and by `SERVEL_STORE=memory`.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use servel_core::{
    marker_not_older, AggregateResult, Candidate, Election, GeoUnit, InstallationStatus, ResourceKey,
    ResourceState, TableResult, Territory,
};
use tokio::sync::RwLock;

use crate::store::{ChunkOutcome, DocumentStore, StoreCounts, StoreError};

#[derive(Debug, Default)]
struct Collections {
    territories: BTreeMap<String, Territory>,
    tables: BTreeMap<(i64, String), TableResult>,
    aggregates: BTreeMap<(i64, String), AggregateResult>,
    candidates: BTreeMap<i64, Candidate>,
    resources: BTreeMap<ResourceKey, ResourceState>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
    failing_ids: HashSet<String>,
    rejected_ids: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any chunk holding one of these table ids fails as a whole.
    pub fn fail_chunks_containing<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// These table ids are refused one by one while the rest of their chunk is
    /// written, the way the Postgres per-record fallback reports a bad row.
    pub fn reject_records<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rejected_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    fn check_chunk<'a>(&self, mut ids: impl Iterator<Item = &'a str>) -> Result<(), StoreError> {
        match ids.find(|id| self.failing_ids.contains(*id)) {
            Some(id) => Err(StoreError::Rejected(format!("chunk holds rejected table {id}"))),
            None => Ok(()),
        }
    }
}

fn upsert_entry<K: Ord, V: Clone + PartialEq>(
    map: &mut BTreeMap<K, V>,
    key: K,
    value: &V,
    outcome: &mut ChunkOutcome,
) {
    match map.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(value.clone());
            outcome.inserted += 1;
        }
        Entry::Occupied(mut slot) => {
            if slot.get() != value {
                slot.insert(value.clone());
                outcome.modified += 1;
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upsert_territories(&self, chunk: &[Territory]) -> Result<ChunkOutcome, StoreError> {
        self.check_chunk(chunk.iter().map(|t| t.id_mesa.as_str()))?;
        let mut collections = self.collections.write().await;
        let mut outcome = ChunkOutcome::default();
        for territory in chunk {
            if self.rejected_ids.contains(&territory.id_mesa) {
                outcome.failed += 1;
                continue;
            }
            upsert_entry(
                &mut collections.territories,
                territory.id_mesa.clone(),
                territory,
                &mut outcome,
            );
        }
        Ok(outcome)
    }

    async fn retain_territories(&self, keep: &[String]) -> Result<u64, StoreError> {
        let keep = keep.iter().collect::<HashSet<_>>();
        let mut collections = self.collections.write().await;
        let before = collections.territories.len();
        collections.territories.retain(|id, _| keep.contains(id));
        Ok((before - collections.territories.len()) as u64)
    }

    async fn upsert_table_results(&self, chunk: &[TableResult]) -> Result<ChunkOutcome, StoreError> {
        self.check_chunk(chunk.iter().map(|t| t.id_mesa.as_str()))?;
        let mut collections = self.collections.write().await;
        let mut outcome = ChunkOutcome::default();
        for table in chunk {
            if self.rejected_ids.contains(&table.id_mesa) {
                outcome.failed += 1;
                continue;
            }
            upsert_entry(
                &mut collections.tables,
                (table.cod_eleccion, table.id_mesa.clone()),
                table,
                &mut outcome,
            );
        }
        Ok(outcome)
    }

    async fn apply_installation(
        &self,
        chunk: &[InstallationStatus],
    ) -> Result<ChunkOutcome, StoreError> {
        self.check_chunk(chunk.iter().map(|s| s.id_mesa.as_str()))?;
        let mut collections = self.collections.write().await;
        let mut outcome = ChunkOutcome::default();
        for status in chunk {
            let mut matched = false;
            for ((_, id_mesa), table) in collections.tables.iter_mut() {
                if *id_mesa != status.id_mesa {
                    continue;
                }
                matched = true;
                if table.instalada != status.instalada {
                    table.instalada = status.instalada;
                    outcome.modified += 1;
                }
            }
            if matched {
                outcome.matched += 1;
            } else {
                outcome.unmatched += 1;
            }
        }
        Ok(outcome)
    }

    async fn upsert_aggregates(&self, chunk: &[AggregateResult]) -> Result<ChunkOutcome, StoreError> {
        let mut collections = self.collections.write().await;
        let mut outcome = ChunkOutcome::default();
        for result in chunk {
            let key = (result.id_eleccion, result.name.clone());
            if let Some(stored) = collections.aggregates.get(&key) {
                if !marker_not_older(result.iteracion.as_deref(), stored.iteracion.as_deref()) {
                    continue;
                }
            }
            upsert_entry(&mut collections.aggregates, key, result, &mut outcome);
        }
        Ok(outcome)
    }

    async fn upsert_candidates(&self, chunk: &[Candidate]) -> Result<ChunkOutcome, StoreError> {
        let mut collections = self.collections.write().await;
        let mut outcome = ChunkOutcome::default();
        for candidate in chunk {
            upsert_entry(&mut collections.candidates, candidate.id, candidate, &mut outcome);
        }
        Ok(outcome)
    }

    async fn resource_states(&self) -> Result<Vec<ResourceState>, StoreError> {
        Ok(self.collections.read().await.resources.values().cloned().collect())
    }

    async fn save_resource_state(&self, state: &ResourceState) -> Result<(), StoreError> {
        self.collections
            .write()
            .await
            .resources
            .insert(state.key, state.clone());
        Ok(())
    }

    async fn table_results(
        &self,
        election: Election,
        unit: GeoUnit,
    ) -> Result<Vec<TableResult>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .tables
            .values()
            .filter(|t| t.cod_eleccion == election.code() && unit.contains(t))
            .cloned()
            .collect())
    }

    async fn aggregates(&self, election: Election) -> Result<Vec<AggregateResult>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .aggregates
            .values()
            .filter(|a| a.id_eleccion == election.code())
            .cloned()
            .collect())
    }

    async fn candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        Ok(self.collections.read().await.candidates.values().cloned().collect())
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let collections = self.collections.read().await;
        Ok(StoreCounts {
            territories: collections.territories.len() as u64,
            table_results: collections.tables.len() as u64,
            aggregate_results: collections.aggregates.len() as u64,
            candidates: collections.candidates.len() as u64,
        })
    }
}
