//! Postgres-backed document store: one JSONB document per natural key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use servel_core::{
    AggregateResult, Candidate, Election, GeoUnit, InstallationStatus, ResourceKey, ResourceState,
    TableResult, Territory,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::store::{ChunkOutcome, DocumentStore, StoreCounts, StoreError};

const UPSERT_TERRITORIES: &str = r#"
    INSERT INTO territories (id_mesa, id_region, id_cirsen, id_distrito, id_comuna, doc, updated_at)
    SELECT r.doc->>'id_mesa',
           (r.doc->>'id_region')::bigint,
           (r.doc->>'id_cirsen')::bigint,
           (r.doc->>'id_distrito')::bigint,
           (r.doc->>'id_comuna')::bigint,
           r.doc,
           NOW()
      FROM jsonb_array_elements($1::jsonb) AS r(doc)
    ON CONFLICT (id_mesa) DO UPDATE
       SET id_region = EXCLUDED.id_region,
           id_cirsen = EXCLUDED.id_cirsen,
           id_distrito = EXCLUDED.id_distrito,
           id_comuna = EXCLUDED.id_comuna,
           doc = EXCLUDED.doc,
           updated_at = NOW()
     WHERE territories.doc IS DISTINCT FROM EXCLUDED.doc
    RETURNING (xmax = 0) AS inserted
"#;

const UPSERT_TABLE_RESULTS: &str = r#"
    INSERT INTO table_results
           (cod_eleccion, id_mesa, id_region, id_cirsen, id_distrito, id_comuna,
            instalada, iteracion, doc, updated_at)
    SELECT (r.doc->>'cod_eleccion')::bigint,
           r.doc->>'id_mesa',
           (r.doc->>'id_region')::bigint,
           (r.doc->>'id_cirsen')::bigint,
           (r.doc->>'id_distrito')::bigint,
           (r.doc->>'id_comuna')::bigint,
           COALESCE((r.doc->>'instalada')::bigint, 0),
           r.doc->>'iteracion',
           r.doc,
           NOW()
      FROM jsonb_array_elements($1::jsonb) AS r(doc)
    ON CONFLICT (cod_eleccion, id_mesa) DO UPDATE
       SET id_region = EXCLUDED.id_region,
           id_cirsen = EXCLUDED.id_cirsen,
           id_distrito = EXCLUDED.id_distrito,
           id_comuna = EXCLUDED.id_comuna,
           instalada = EXCLUDED.instalada,
           iteracion = EXCLUDED.iteracion,
           doc = EXCLUDED.doc,
           updated_at = NOW()
     WHERE table_results.doc IS DISTINCT FROM EXCLUDED.doc
    RETURNING (xmax = 0) AS inserted
"#;

const UPSERT_AGGREGATES: &str = r#"
    INSERT INTO aggregate_results (id_eleccion, name, iteracion, doc, updated_at)
    SELECT (r.doc->>'id_eleccion')::bigint,
           r.doc->>'name',
           r.doc->>'iteracion',
           r.doc,
           NOW()
      FROM jsonb_array_elements($1::jsonb) AS r(doc)
    ON CONFLICT (id_eleccion, name) DO UPDATE
       SET iteracion = EXCLUDED.iteracion,
           doc = EXCLUDED.doc,
           updated_at = NOW()
     WHERE aggregate_results.doc IS DISTINCT FROM EXCLUDED.doc
       AND (length(COALESCE(EXCLUDED.iteracion, '')), COALESCE(EXCLUDED.iteracion, '') COLLATE "C")
        >= (length(COALESCE(aggregate_results.iteracion, '')), COALESCE(aggregate_results.iteracion, '') COLLATE "C")
    RETURNING (xmax = 0) AS inserted
"#;

const UPSERT_CANDIDATES: &str = r#"
    INSERT INTO candidates (id, doc, updated_at)
    SELECT (r.doc->>'id')::bigint, r.doc, NOW()
      FROM jsonb_array_elements($1::jsonb) AS r(doc)
    ON CONFLICT (id) DO UPDATE
       SET doc = EXCLUDED.doc,
           updated_at = NOW()
     WHERE candidates.doc IS DISTINCT FROM EXCLUDED.doc
    RETURNING (xmax = 0) AS inserted
"#;

const APPLY_INSTALLATION: &str = r#"
    UPDATE table_results t
       SET instalada = s.instalada,
           doc = jsonb_set(t.doc, '{instalada}', to_jsonb(s.instalada)),
           updated_at = NOW()
      FROM (
            SELECT e->>'id_mesa' AS id_mesa,
                   COALESCE((e->>'instalada')::bigint, 0) AS instalada
              FROM jsonb_array_elements($1::jsonb) AS e
           ) s
     WHERE t.id_mesa = s.id_mesa
       AND t.instalada IS DISTINCT FROM s.instalada
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn run_upsert(&self, sql: &str, docs: JsonValue) -> Result<ChunkOutcome, StoreError> {
        let rows = sqlx::query(sql).bind(docs).fetch_all(&self.pool).await?;
        let mut outcome = ChunkOutcome::default();
        for row in rows {
            if row.try_get::<bool, _>("inserted")? {
                outcome.inserted += 1;
            } else {
                outcome.modified += 1;
            }
        }
        Ok(outcome)
    }

    /// One bulk statement per chunk; if it fails, every record is retried on its
    /// own so a single bad row cannot sink its neighbours.
    async fn upsert_documents<T: Serialize>(
        &self,
        sql: &str,
        chunk: &[T],
    ) -> Result<ChunkOutcome, StoreError> {
        let docs = chunk
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        let bulk_err = match self.run_upsert(sql, JsonValue::Array(docs.clone())).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };
        warn!(error = %bulk_err, records = docs.len(), "bulk upsert failed; applying records one by one");

        let total = docs.len() as u64;
        let mut outcome = ChunkOutcome::default();
        let mut last_err = None;
        for doc in docs {
            match self.run_upsert(sql, JsonValue::Array(vec![doc])).await {
                Ok(single) => outcome.absorb(single),
                Err(err) => {
                    outcome.failed += 1;
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) if outcome.failed == total => Err(err),
            _ => Ok(outcome),
        }
    }

    async fn fetch_docs<T: DeserializeOwned>(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<T>, StoreError> {
        let rows = query.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: JsonValue = row.try_get("doc")?;
            out.push(serde_json::from_value(doc)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_territories(&self, chunk: &[Territory]) -> Result<ChunkOutcome, StoreError> {
        self.upsert_documents(UPSERT_TERRITORIES, chunk).await
    }

    async fn retain_territories(&self, keep: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM territories WHERE NOT (id_mesa = ANY($1))")
            .bind(keep)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_table_results(&self, chunk: &[TableResult]) -> Result<ChunkOutcome, StoreError> {
        self.upsert_documents(UPSERT_TABLE_RESULTS, chunk).await
    }

    async fn apply_installation(
        &self,
        chunk: &[InstallationStatus],
    ) -> Result<ChunkOutcome, StoreError> {
        let ids = chunk.iter().map(|s| s.id_mesa.clone()).collect::<Vec<_>>();
        let matched: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT id_mesa) FROM table_results WHERE id_mesa = ANY($1)",
        )
        .bind(&ids)
        .fetch_one(&self.pool)
        .await?;

        let docs = serde_json::to_value(chunk)?;
        let updated = sqlx::query(APPLY_INSTALLATION)
            .bind(docs)
            .execute(&self.pool)
            .await?;

        let matched = matched.max(0) as u64;
        Ok(ChunkOutcome {
            modified: updated.rows_affected(),
            matched,
            unmatched: (chunk.len() as u64).saturating_sub(matched),
            ..ChunkOutcome::default()
        })
    }

    async fn upsert_aggregates(&self, chunk: &[AggregateResult]) -> Result<ChunkOutcome, StoreError> {
        self.upsert_documents(UPSERT_AGGREGATES, chunk).await
    }

    async fn upsert_candidates(&self, chunk: &[Candidate]) -> Result<ChunkOutcome, StoreError> {
        self.upsert_documents(UPSERT_CANDIDATES, chunk).await
    }

    async fn resource_states(&self) -> Result<Vec<ResourceState>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT resource_key, archive, last_marker, last_synced_at
              FROM sync_resources
             ORDER BY resource_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_key: String = row.try_get("resource_key")?;
            let Ok(key) = raw_key.parse::<ResourceKey>() else {
                warn!(resource_key = %raw_key, "ignoring unknown persisted resource");
                continue;
            };
            out.push(ResourceState {
                key,
                archive: row.try_get("archive")?,
                last_marker: row.try_get("last_marker")?,
                last_synced_at: row.try_get::<Option<DateTime<Utc>>, _>("last_synced_at")?,
            });
        }
        Ok(out)
    }

    async fn save_resource_state(&self, state: &ResourceState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_resources (resource_key, archive, last_marker, last_synced_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (resource_key) DO UPDATE
               SET archive = EXCLUDED.archive,
                   last_marker = EXCLUDED.last_marker,
                   last_synced_at = EXCLUDED.last_synced_at
            "#,
        )
        .bind(state.key.to_string())
        .bind(&state.archive)
        .bind(&state.last_marker)
        .bind(state.last_synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn table_results(
        &self,
        election: Election,
        unit: GeoUnit,
    ) -> Result<Vec<TableResult>, StoreError> {
        let (sql, unit_id) = match unit {
            GeoUnit::District(id) => (
                "SELECT doc FROM table_results WHERE cod_eleccion = $1 AND id_distrito = $2 ORDER BY id_mesa",
                id,
            ),
            GeoUnit::Circumscription(id) => (
                "SELECT doc FROM table_results WHERE cod_eleccion = $1 AND id_cirsen = $2 ORDER BY id_mesa",
                id,
            ),
        };
        self.fetch_docs(sqlx::query(sql).bind(election.code()).bind(unit_id))
            .await
    }

    async fn aggregates(&self, election: Election) -> Result<Vec<AggregateResult>, StoreError> {
        self.fetch_docs(
            sqlx::query("SELECT doc FROM aggregate_results WHERE id_eleccion = $1 ORDER BY name")
                .bind(election.code()),
        )
        .await
    }

    async fn candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        self.fetch_docs(sqlx::query("SELECT doc FROM candidates ORDER BY id"))
            .await
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM territories) AS territories,
                   (SELECT COUNT(*) FROM table_results) AS table_results,
                   (SELECT COUNT(*) FROM aggregate_results) AS aggregate_results,
                   (SELECT COUNT(*) FROM candidates) AS candidates
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let count = |name: &str| -> Result<u64, StoreError> {
            Ok(row.try_get::<i64, _>(name)?.max(0) as u64)
        };
        Ok(StoreCounts {
            territories: count("territories")?,
            table_results: count("table_results")?,
            aggregate_results: count("aggregate_results")?,
            candidates: count("candidates")?,
        })
    }
}
