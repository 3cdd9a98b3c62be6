use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use extract::ExtractedEntity;
use ingest::{Document, DocumentChunk, PipelineState};

use crate::embeddings::Embedding;
use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    document_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    source_path TEXT NOT NULL,
    current_state TEXT NOT NULL,
    priority INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    retry_stage TEXT,
    last_error TEXT,
    document_type TEXT,
    schema_id TEXT,
    failed_step TEXT,
    lease_owner TEXT,
    lease_expires_at INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_claim
    ON documents (current_state, priority DESC, created_at);

CREATE TABLE IF NOT EXISTS document_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL REFERENCES documents(document_id),
    from_state TEXT NOT NULL,
    to_state TEXT NOT NULL,
    reason TEXT,
    at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transitions_document
    ON document_transitions (document_id, id);

CREATE TABLE IF NOT EXISTS extracted_entities (
    entity_id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(document_id),
    entity_type TEXT NOT NULL,
    normalized_value TEXT NOT NULL,
    confidence REAL NOT NULL,
    raw_span TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS document_chunks (
    chunk_id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(document_id),
    sequence_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    entity_ids TEXT NOT NULL,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    owner_id TEXT NOT NULL,
    model_version TEXT NOT NULL,
    owner_kind TEXT NOT NULL,
    document_id TEXT NOT NULL REFERENCES documents(document_id),
    dimension INTEGER NOT NULL,
    point_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    PRIMARY KEY (owner_id, model_version)
);
"#;

const DOCUMENT_COLUMNS: &str = "document_id, tenant_id, source_path, current_state, priority, \
     retry_count, retry_stage, last_error, document_type, schema_id, failed_step, \
     created_at, updated_at";

/// One row of the append-only transition log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub document_id: String,
    pub from_state: PipelineState,
    pub to_state: PipelineState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub by_state: BTreeMap<String, u64>,
    /// Documents not yet in a terminal state.
    pub active: u64,
    pub leased: u64,
}

/// A committed chunk of a completed document, as seen by search.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub entity_ids: Vec<String>,
}

/// Relational source of truth: documents, their transitions, and the
/// status of every entity, chunk and embedding row.
#[derive(Debug, Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(url, "Connected to metadata store");
        Ok(store)
    }

    /// Single-connection in-memory database; the connection is pinned so the
    /// schema survives for the life of the pool.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (
                document_id, tenant_id, source_path, current_state, priority,
                retry_count, retry_stage, last_error, document_type, schema_id,
                failed_step, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.document_id)
        .bind(&document.tenant_id)
        .bind(&document.source_path)
        .bind(document.current_state.as_str())
        .bind(i64::from(document.priority))
        .bind(i64::from(document.retry_count))
        .bind(document.retry_stage.map(|s| s.as_str()))
        .bind(&document.last_error)
        .bind(&document.document_type)
        .bind(&document.schema_id)
        .bind(&document.failed_step)
        .bind(document.created_at)
        .bind(document.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(document.document_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE document_id = ?"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_document(&r)).transpose()
    }

    /// Persist the state-owned columns of `document` and append the
    /// transition to the log, atomically.
    pub async fn apply_transition(
        &self,
        document: &Document,
        from: PipelineState,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET current_state = ?, retry_count = ?, retry_stage = ?, last_error = ?,
                document_type = ?, schema_id = ?, updated_at = ?
            WHERE document_id = ?
            "#,
        )
        .bind(document.current_state.as_str())
        .bind(i64::from(document.retry_count))
        .bind(document.retry_stage.map(|s| s.as_str()))
        .bind(&document.last_error)
        .bind(&document.document_type)
        .bind(&document.schema_id)
        .bind(document.updated_at)
        .bind(&document.document_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Database(sqlx::Error::RowNotFound));
        }

        sqlx::query(
            r#"
            INSERT INTO document_transitions (document_id, from_state, to_state, reason, at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.document_id)
        .bind(from.as_str())
        .bind(document.current_state.as_str())
        .bind(reason)
        .bind(document.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            document_id = %document.document_id,
            from = %from,
            to = %document.current_state,
            "Persisted transition"
        );
        Ok(())
    }

    pub async fn transitions(&self, document_id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, from_state, to_state, reason, at
            FROM document_transitions WHERE document_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<TransitionRecord, StoreError> {
                Ok(TransitionRecord {
                    document_id: r.try_get("document_id")?,
                    from_state: parse_state(r, "from_state", "document_transitions")?,
                    to_state: parse_state(r, "to_state", "document_transitions")?,
                    reason: r.try_get("reason")?,
                    at: r.try_get("at")?,
                })
            })
            .collect()
    }

    pub async fn set_failed_step(
        &self,
        document_id: &str,
        step: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE documents SET failed_step = ? WHERE document_id = ?")
            .bind(step)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Claim the highest-priority, oldest document that is neither terminal
    /// nor held by a live lease.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Document>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let expires = now + lease.as_millis() as i64;

        let row = sqlx::query(&format!(
            r#"
            UPDATE documents
            SET lease_owner = ?, lease_expires_at = ?
            WHERE document_id = (
                SELECT document_id FROM documents
                WHERE current_state NOT IN ('COMPLETED', 'FAILED')
                  AND (lease_owner IS NULL OR lease_expires_at < ?)
                ORDER BY priority DESC, created_at ASC, document_id ASC
                LIMIT 1
            )
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(expires)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_document(&r)).transpose()
    }

    /// Extend the lease; returns false when the worker no longer holds it.
    pub async fn renew_lease(
        &self,
        document_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let expires = Utc::now().timestamp_millis() + lease.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE documents SET lease_expires_at = ? WHERE document_id = ? AND lease_owner = ?",
        )
        .bind(expires)
        .bind(document_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Give a lease taken by `from` back to `to` with a fresh expiry.
    /// Returns false when `from` no longer holds it.
    pub async fn hand_back_lease(
        &self,
        document_id: &str,
        from: &str,
        to: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let expires = Utc::now().timestamp_millis() + lease.as_millis() as i64;
        let result = sqlx::query(
            r#"
            UPDATE documents SET lease_owner = ?, lease_expires_at = ?
            WHERE document_id = ? AND lease_owner = ?
            "#,
        )
        .bind(to)
        .bind(expires)
        .bind(document_id)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_lease(&self, document_id: &str, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE documents SET lease_owner = NULL, lease_expires_at = NULL
            WHERE document_id = ? AND lease_owner = ?
            "#,
        )
        .bind(document_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE current_state NOT IN ('COMPLETED', 'FAILED')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT current_state, COUNT(*) AS total,
                   SUM(CASE WHEN lease_owner IS NOT NULL THEN 1 ELSE 0 END) AS leased
            FROM documents GROUP BY current_state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state = parse_state(&row, "current_state", "documents")?;
            let total: i64 = row.try_get("total")?;
            let leased: i64 = row.try_get("leased")?;
            if !state.is_terminal() {
                stats.active += total as u64;
                stats.leased += leased as u64;
            }
            stats.by_state.insert(state.as_str().to_string(), total as u64);
        }
        Ok(stats)
    }

    /// Write this run's rows as `pending`, superseding whatever the document
    /// had before. Embeddings are only superseded within the same model
    /// version; other versions are left alone.
    pub async fn write_pending(
        &self,
        document_id: &str,
        entities: &[ExtractedEntity],
        chunks: &[DocumentChunk],
        embeddings: &[(Embedding, u64)],
        model_version: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE extracted_entities SET status = 'superseded' WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE document_chunks SET status = 'superseded' WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE embeddings SET status = 'superseded' WHERE document_id = ? AND model_version = ?",
        )
        .bind(document_id)
        .bind(model_version)
        .execute(&mut *tx)
        .await?;

        for entity in entities {
            sqlx::query(
                r#"
                INSERT INTO extracted_entities (
                    entity_id, document_id, entity_type, normalized_value,
                    confidence, raw_span, status, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
                ON CONFLICT(entity_id) DO UPDATE SET
                    entity_type = excluded.entity_type,
                    normalized_value = excluded.normalized_value,
                    confidence = excluded.confidence,
                    raw_span = excluded.raw_span,
                    status = 'pending',
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entity.entity_id)
            .bind(document_id)
            .bind(&entity.entity_type)
            .bind(&entity.normalized_value)
            .bind(f64::from(entity.confidence))
            .bind(&entity.raw_span)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for chunk in chunks {
            let entity_ids = serde_json::to_string(&chunk.entity_ids).map_err(|e| {
                StoreError::Corrupt {
                    table: "document_chunks",
                    message: e.to_string(),
                }
            })?;
            sqlx::query(
                r#"
                INSERT INTO document_chunks (
                    chunk_id, document_id, sequence_index, text, token_count, entity_ids, status
                )
                VALUES (?, ?, ?, ?, ?, ?, 'pending')
                ON CONFLICT(chunk_id) DO UPDATE SET
                    sequence_index = excluded.sequence_index,
                    entity_ids = excluded.entity_ids,
                    status = 'pending'
                "#,
            )
            .bind(&chunk.chunk_id)
            .bind(document_id)
            .bind(chunk.sequence_index as i64)
            .bind(&chunk.text)
            .bind(chunk.token_count as i64)
            .bind(entity_ids)
            .execute(&mut *tx)
            .await?;
        }

        for (embedding, point_id) in embeddings {
            sqlx::query(
                r#"
                INSERT INTO embeddings (
                    owner_id, model_version, owner_kind, document_id, dimension, point_id, status
                )
                VALUES (?, ?, ?, ?, ?, ?, 'pending')
                ON CONFLICT(owner_id, model_version) DO UPDATE SET
                    dimension = excluded.dimension,
                    point_id = excluded.point_id,
                    status = 'pending'
                "#,
            )
            .bind(&embedding.owner_id)
            .bind(&embedding.model_version)
            .bind(embedding.owner_kind.as_str())
            .bind(document_id)
            .bind(embedding.vector.len() as i64)
            // SQLite integers are signed; keep the bit pattern
            .bind(*point_id as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Vector points of rows a later run replaced.
    pub async fn superseded_points(&self, document_id: &str) -> Result<Vec<u64>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT point_id FROM embeddings WHERE document_id = ? AND status = 'superseded'",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|id| id as u64).collect())
    }

    /// Drop superseded rows once their graph and vector copies are gone.
    pub async fn purge_superseded(&self, document_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["extracted_entities", "document_chunks", "embeddings"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE document_id = ? AND status = 'superseded'"
            ))
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Flip every pending row of the document to `committed` and clear the
    /// failure checkpoint, in one transaction.
    pub async fn commit_document(&self, document_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["extracted_entities", "document_chunks", "embeddings"] {
            sqlx::query(&format!(
                "UPDATE {table} SET status = 'committed' WHERE document_id = ? AND status = 'pending'"
            ))
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE documents SET failed_step = NULL WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Committed entities of a document.
    pub async fn committed_entities(
        &self,
        document_id: &str,
    ) -> Result<Vec<ExtractedEntity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, document_id, entity_type, normalized_value, confidence, raw_span
            FROM extracted_entities
            WHERE document_id = ? AND status = 'committed'
            ORDER BY entity_id
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entity).collect()
    }

    /// Count of entity rows per status for a document, for diagnostics.
    pub async fn entity_status_counts(
        &self,
        document_id: &str,
    ) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM extracted_entities WHERE document_id = ? GROUP BY status",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            counts.insert(status, total as u64);
        }
        Ok(counts)
    }

    /// Of the given chunk ids, those that are committed, belong to a
    /// `COMPLETED` document, and are owned by the tenant.
    pub async fn visible_chunks(
        &self,
        tenant_id: &str,
        chunk_ids: &[String],
    ) -> Result<Vec<VisibleChunk>, StoreError> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT c.chunk_id, c.document_id, c.entity_ids
            FROM document_chunks c
            JOIN documents d ON d.document_id = c.document_id
            WHERE c.status = 'committed'
              AND d.current_state = 'COMPLETED'
              AND d.tenant_id = "#,
        );
        builder.push_bind(tenant_id);
        builder.push(" AND c.chunk_id IN (");
        let mut separated = builder.separated(", ");
        for id in chunk_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| -> Result<VisibleChunk, StoreError> {
                let raw: String = r.try_get("entity_ids")?;
                let entity_ids =
                    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                        table: "document_chunks",
                        message: e.to_string(),
                    })?;
                Ok(VisibleChunk {
                    chunk_id: r.try_get("chunk_id")?,
                    document_id: r.try_get("document_id")?,
                    entity_ids,
                })
            })
            .collect()
    }

    /// Committed entities among the given ids.
    pub async fn entities_by_id(
        &self,
        entity_ids: &[String],
    ) -> Result<Vec<ExtractedEntity>, StoreError> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT entity_id, document_id, entity_type, normalized_value, confidence, raw_span
            FROM extracted_entities
            WHERE status = 'committed' AND entity_id IN ("#,
        );
        let mut separated = builder.separated(", ");
        for id in entity_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_entity).collect()
    }
}

fn parse_state(row: &SqliteRow, column: &str, table: &'static str) -> Result<PipelineState, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse::<PipelineState>().map_err(|e| StoreError::Corrupt {
        table,
        message: e.to_string(),
    })
}

fn row_to_document(row: &SqliteRow) -> Result<Document, StoreError> {
    let retry_stage: Option<String> = row.try_get("retry_stage")?;
    let retry_stage = retry_stage
        .map(|s| s.parse::<PipelineState>())
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            table: "documents",
            message: e.to_string(),
        })?;
    let priority: i64 = row.try_get("priority")?;
    let retry_count: i64 = row.try_get("retry_count")?;

    Ok(Document {
        document_id: row.try_get("document_id")?,
        tenant_id: row.try_get("tenant_id")?,
        source_path: row.try_get("source_path")?,
        current_state: parse_state(row, "current_state", "documents")?,
        priority: priority.clamp(0, u8::MAX as i64) as u8,
        retry_count: retry_count.max(0) as u32,
        retry_stage,
        last_error: row.try_get("last_error")?,
        document_type: row.try_get("document_type")?,
        schema_id: row.try_get("schema_id")?,
        failed_step: row.try_get("failed_step")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_entity(row: &SqliteRow) -> Result<ExtractedEntity, StoreError> {
    let confidence: f64 = row.try_get("confidence")?;
    Ok(ExtractedEntity {
        entity_id: row.try_get("entity_id")?,
        document_id: row.try_get("document_id")?,
        entity_type: row.try_get("entity_type")?,
        normalized_value: row.try_get("normalized_value")?,
        confidence: confidence as f32,
        raw_span: row.try_get("raw_span")?,
        spans: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::OwnerKind;
    use ingest::IntakeRequest;

    fn document(id: &str, priority: i64) -> Document {
        IntakeRequest::new("tenant-a", "/tmp/a.txt")
            .with_id(id)
            .with_priority(priority)
            .into_document(Utc::now())
            .unwrap()
    }

    fn entity(document_id: &str, value: &str) -> ExtractedEntity {
        ExtractedEntity {
            entity_id: format!("{document_id}-{value}"),
            document_id: document_id.into(),
            entity_type: "person".into(),
            normalized_value: value.into(),
            confidence: 0.9,
            raw_span: value.into(),
            spans: vec![(0, value.len())],
        }
    }

    #[tokio::test]
    async fn duplicate_document_is_rejected() {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        store.insert_document(&document("doc-1", 5)).await.unwrap();
        let err = store.insert_document(&document("doc-1", 5)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == "doc-1"));
    }

    #[tokio::test]
    async fn transition_updates_row_and_log() {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        let mut doc = document("doc-1", 5);
        store.insert_document(&doc).await.unwrap();

        doc.current_state = PipelineState::Classifying;
        store
            .apply_transition(&doc, PipelineState::Queued, Some("claimed"))
            .await
            .unwrap();

        let loaded = store.get_document("doc-1").await.unwrap().unwrap();
        assert_eq!(loaded.current_state, PipelineState::Classifying);

        let log = store.transitions("doc-1").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].from_state, PipelineState::Queued);
        assert_eq!(log[0].to_state, PipelineState::Classifying);
        assert_eq!(log[0].reason.as_deref(), Some("claimed"));
    }

    #[tokio::test]
    async fn claim_orders_by_priority_and_honors_leases() {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        store.insert_document(&document("low", 1)).await.unwrap();
        store.insert_document(&document("high", 9)).await.unwrap();

        let lease = Duration::from_secs(60);
        let first = store.claim_next("w1", lease).await.unwrap().unwrap();
        assert_eq!(first.document_id, "high");
        let second = store.claim_next("w2", lease).await.unwrap().unwrap();
        assert_eq!(second.document_id, "low");
        assert!(store.claim_next("w3", lease).await.unwrap().is_none());

        assert!(!store.renew_lease("high", "w2", lease).await.unwrap());
        store.release_lease("high", "w1").await.unwrap();
        let again = store.claim_next("w3", lease).await.unwrap().unwrap();
        assert_eq!(again.document_id, "high");
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed() {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        store.insert_document(&document("doc-1", 5)).await.unwrap();

        store.claim_next("w1", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = store.claim_next("w2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(reclaimed.map(|d| d.document_id).as_deref(), Some("doc-1"));
    }

    #[tokio::test]
    async fn lease_handed_back_to_the_original_holder() {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        store.insert_document(&document("doc-1", 5)).await.unwrap();

        store.claim_next("w1", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.claim_next("w2", Duration::from_secs(60)).await.unwrap().unwrap();

        let lease = Duration::from_secs(60);
        assert!(store.hand_back_lease("doc-1", "w2", "w1", lease).await.unwrap());
        assert!(!store.hand_back_lease("doc-1", "w2", "w1", lease).await.unwrap());
        assert!(store.renew_lease("doc-1", "w1", lease).await.unwrap());
        assert!(!store.renew_lease("doc-1", "w2", lease).await.unwrap());
        assert!(store.claim_next("w3", lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rerun_supersedes_previous_rows() {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        store.insert_document(&document("doc-1", 5)).await.unwrap();

        let alice = entity("doc-1", "Alice");
        let bob = entity("doc-1", "Bob");
        store
            .write_pending("doc-1", &[alice.clone(), bob], &[], &[], "m1")
            .await
            .unwrap();
        store.commit_document("doc-1").await.unwrap();

        store
            .write_pending("doc-1", &[alice.clone()], &[], &[], "m1")
            .await
            .unwrap();
        store.commit_document("doc-1").await.unwrap();

        let committed = store.committed_entities("doc-1").await.unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].entity_id, alice.entity_id);

        let counts = store.entity_status_counts("doc-1").await.unwrap();
        assert_eq!(counts.get("committed"), Some(&1));
        assert_eq!(counts.get("superseded"), Some(&1));
    }

    #[tokio::test]
    async fn chunks_visible_only_when_committed_and_completed() {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        let mut doc = document("doc-1", 5);
        store.insert_document(&doc).await.unwrap();

        let chunk = DocumentChunk::new("doc-1", 0, "Alice met Bob.", (0, 14), vec!["e1".into()]);
        let embedding = Embedding {
            owner_id: chunk.chunk_id.clone(),
            owner_kind: OwnerKind::Chunk,
            vector: vec![0.1, 0.2],
            model_version: "m1".into(),
        };
        store
            .write_pending("doc-1", &[], &[chunk.clone()], &[(embedding, 42)], "m1")
            .await
            .unwrap();
        let ids = vec![chunk.chunk_id.clone()];

        assert!(store.visible_chunks("tenant-a", &ids).await.unwrap().is_empty());

        store.commit_document("doc-1").await.unwrap();
        assert!(store.visible_chunks("tenant-a", &ids).await.unwrap().is_empty());

        doc.current_state = PipelineState::Completed;
        store
            .apply_transition(&doc, PipelineState::Storing, None)
            .await
            .unwrap();
        let visible = store.visible_chunks("tenant-a", &ids).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].entity_ids, vec!["e1".to_string()]);

        assert!(store.visible_chunks("tenant-b", &ids).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_stats_split_active_and_terminal() {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        let mut done = document("done", 5);
        store.insert_document(&done).await.unwrap();
        store.insert_document(&document("waiting", 5)).await.unwrap();

        done.current_state = PipelineState::Failed;
        store
            .apply_transition(&done, PipelineState::Queued, Some("boom"))
            .await
            .unwrap();

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.by_state.get("FAILED"), Some(&1));
        assert_eq!(stats.by_state.get("QUEUED"), Some(&1));
        assert_eq!(store.active_count().await.unwrap(), 1);
    }
}
