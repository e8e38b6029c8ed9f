//! Ingestion pipeline orchestration.
//!
//! Producer side durably enqueues a processing request and returns — the
//! upload path never waits on processing. Consumer side runs one worker
//! task per broker partition: fetch bytes → guarded extraction → chunk →
//! persist → publish completion. Chunk persistence replaces the whole set
//! for a file hash inside one transaction, so at-least-once redelivery
//! never duplicates rows. Transient failures retry on a fixed backoff;
//! permanent ones dead-letter immediately.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{Envelope, ReliableBroker};
use crate::chunk;
use crate::config::{BrokerConfig, ChunkingConfig, IngestionConfig};
use crate::error::{Result, TidepoolError};
use crate::models::{CompletionMessage, FileStatus, ProcessingMessage};
use crate::object_store::ObjectStore;
use crate::parser::{self, MemoryGuard};

pub struct IngestionPipeline {
    pool: SqlitePool,
    broker: Arc<dyn ReliableBroker>,
    store: Arc<dyn ObjectStore>,
    guard: Arc<MemoryGuard>,
    chunking: ChunkingConfig,
    broker_cfg: BrokerConfig,
    io_timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(
        pool: SqlitePool,
        broker: Arc<dyn ReliableBroker>,
        store: Arc<dyn ObjectStore>,
        chunking: ChunkingConfig,
        broker_cfg: BrokerConfig,
        ingestion: &IngestionConfig,
    ) -> Self {
        Self {
            pool,
            broker,
            store,
            guard: Arc::new(MemoryGuard::new(ingestion.max_in_flight_bytes)),
            chunking,
            broker_cfg,
            io_timeout: Duration::from_secs(ingestion.io_timeout_secs),
        }
    }

    /// Record the upload and enqueue one processing request, keyed by file
    /// hash. Returns as soon as the message is accepted by the broker;
    /// processing outcome is observable via file status and the
    /// dead-letter topic.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit(
        &self,
        file_hash: &str,
        file_name: &str,
        storage_locator: &str,
        owner_user_id: &str,
        org_tag: &str,
        is_public: bool,
        content_type: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO files (file_hash, file_name, storage_locator, owner_user_id, org_tag, \
                                is_public, status, uploaded_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'pending', ?) \
             ON CONFLICT(file_hash) DO UPDATE SET \
                file_name = excluded.file_name, \
                storage_locator = excluded.storage_locator, \
                owner_user_id = excluded.owner_user_id, \
                org_tag = excluded.org_tag, \
                is_public = excluded.is_public, \
                status = 'pending'",
        )
        .bind(file_hash)
        .bind(file_name)
        .bind(storage_locator)
        .bind(owner_user_id)
        .bind(org_tag)
        .bind(is_public)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        let message = ProcessingMessage {
            message_id: Uuid::new_v4().to_string(),
            file_hash: file_hash.to_string(),
            storage_locator: storage_locator.to_string(),
            owner_user_id: owner_user_id.to_string(),
            org_tag: org_tag.to_string(),
            is_public,
            content_type: content_type.to_string(),
        };
        let payload = serde_json::to_string(&message)
            .map_err(|e| TidepoolError::Validation(format!("serialize processing message: {e}")))?;

        // Bounded client-level retries; the idempotent broker makes a
        // retried publish safe.
        let mut attempt = 0u32;
        loop {
            match self
                .broker
                .publish(
                    &self.broker_cfg.processing_topic,
                    &message.file_hash,
                    &message.message_id,
                    payload.clone(),
                )
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < self.broker_cfg.producer_retries => {
                    warn!(file_hash, attempt, error = %e, "publish failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(file_hash, owner_user_id, org_tag, "processing request enqueued");
        Ok(())
    }

    /// Spawn one worker task per partition of the processing topic.
    pub fn spawn_workers(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let receivers = self
            .broker
            .subscribe(&self.broker_cfg.processing_topic, &self.broker_cfg.group_id)?;

        let handles = receivers
            .into_iter()
            .enumerate()
            .map(|(partition, mut rx)| {
                let pipeline = Arc::clone(self);
                tokio::spawn(async move {
                    info!(partition, "ingestion worker started");
                    while let Some(envelope) = rx.recv().await {
                        pipeline.handle_delivery(envelope).await;
                    }
                    info!(partition, "ingestion worker stopped");
                })
            })
            .collect();
        Ok(handles)
    }

    async fn handle_delivery(&self, envelope: Envelope) {
        let message: ProcessingMessage = match serde_json::from_str(&envelope.payload) {
            Ok(m) => m,
            Err(e) => {
                error!(topic = %envelope.topic, error = %e, "malformed processing message");
                self.redirect_to_dead_letter(&envelope, &format!("malformed payload: {e}"), 1)
                    .await;
                return;
            }
        };

        let backoff = Duration::from_secs(self.broker_cfg.retry_backoff_secs);
        let mut attempt = 1u32;
        loop {
            match self.process(&message).await {
                Ok(chunk_count) => {
                    info!(
                        file_hash = %message.file_hash,
                        chunk_count,
                        attempt,
                        "file ingested"
                    );
                    self.publish_completion(&message, chunk_count).await;
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.broker_cfg.max_attempts => {
                    warn!(
                        file_hash = %message.file_hash,
                        attempt,
                        error = %e,
                        "ingestion attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        file_hash = %message.file_hash,
                        attempt,
                        error = %e,
                        "ingestion failed, dead-lettering"
                    );
                    self.redirect_to_dead_letter(&envelope, &e.to_string(), attempt)
                        .await;
                    if let Err(se) = self.mark_dead_lettered(&message.file_hash).await {
                        error!(file_hash = %message.file_hash, error = %se, "failed to record dead-letter status");
                    }
                    return;
                }
            }
        }
    }

    /// One ingestion attempt. The message is acknowledged (by returning
    /// `Ok`) only after the chunk transaction commits.
    async fn process(&self, message: &ProcessingMessage) -> Result<usize> {
        let bytes = timeout(self.io_timeout, self.store.get(&message.storage_locator))
            .await
            .map_err(|_| {
                TidepoolError::TransientIo(format!(
                    "storage get timed out after {:?}",
                    self.io_timeout
                ))
            })??;

        let _permit = self.guard.acquire(bytes.len())?;
        let content_type = message.content_type.clone();
        let text = tokio::task::spawn_blocking(move || parser::extract_text(&bytes, &content_type))
            .await
            .map_err(|e| TidepoolError::TransientIo(format!("extraction task failed: {e}")))??;

        let chunks = if self.chunking.overlap_size > 0 {
            chunk::split_with_overlap(
                &text,
                self.chunking.max_chunk_size,
                self.chunking.overlap_size,
            )
        } else {
            chunk::split(&text, self.chunking.max_chunk_size)
        };

        self.persist_chunks(message, &chunks).await?;
        Ok(chunks.len())
    }

    /// Replace the whole chunk set for the file hash and flip its status,
    /// in one transaction. Idempotent under redelivery.
    async fn persist_chunks(&self, message: &ProcessingMessage, chunks: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE file_hash = ?")
            .bind(&message.file_hash)
            .execute(&mut *tx)
            .await?;

        for (i, text) in chunks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO chunks (file_hash, chunk_index, text, owner_user_id, org_tag, is_public) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&message.file_hash)
            .bind((i + 1) as i64)
            .bind(text)
            .bind(&message.owner_user_id)
            .bind(&message.org_tag)
            .bind(message.is_public)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE files SET status = ? WHERE file_hash = ?")
            .bind(FileStatus::Completed.as_str())
            .bind(&message.file_hash)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn publish_completion(&self, message: &ProcessingMessage, chunk_count: usize) {
        let completion = CompletionMessage {
            file_hash: message.file_hash.clone(),
            chunk_count,
            completed_at: chrono::Utc::now(),
        };
        let payload = match serde_json::to_string(&completion) {
            Ok(p) => p,
            Err(e) => {
                warn!(file_hash = %message.file_hash, error = %e, "serialize completion failed");
                return;
            }
        };
        // Chunks are committed; a failed completion publish must not fail
        // the message.
        if let Err(e) = self
            .broker
            .publish(
                &self.broker_cfg.completion_topic,
                &message.file_hash,
                &Uuid::new_v4().to_string(),
                payload,
            )
            .await
        {
            warn!(file_hash = %message.file_hash, error = %e, "completion publish failed");
        }
    }

    async fn redirect_to_dead_letter(&self, envelope: &Envelope, error: &str, attempts: u32) {
        if let Err(e) = self.broker.dead_letter(envelope, error, attempts).await {
            error!(
                topic = %envelope.topic,
                partition = envelope.partition,
                error = %e,
                "dead-letter publish failed"
            );
        }
    }

    async fn mark_dead_lettered(&self, file_hash: &str) -> Result<()> {
        sqlx::query("UPDATE files SET status = ? WHERE file_hash = ?")
            .bind(FileStatus::DeadLettered.as_str())
            .bind(file_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use crate::db;
    use crate::documents;
    use crate::object_store::FsObjectStore;
    use crate::parser::MIME_TEXT;

    async fn pipeline_with(
        broker_cfg: BrokerConfig,
    ) -> (Arc<IngestionPipeline>, Arc<ChannelBroker>, tempfile::TempDir, SqlitePool) {
        let pool = db::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(ChannelBroker::new(&broker_cfg));
        let store = Arc::new(FsObjectStore::new(dir.path().to_path_buf(), "key"));
        let pipeline = Arc::new(IngestionPipeline::new(
            pool.clone(),
            Arc::clone(&broker) as Arc<dyn ReliableBroker>,
            store,
            ChunkingConfig {
                max_chunk_size: 50,
                overlap_size: 0,
            },
            broker_cfg,
            &IngestionConfig::default(),
        ));
        (pipeline, broker, dir, pool)
    }

    fn message(file_hash: &str) -> ProcessingMessage {
        ProcessingMessage {
            message_id: "m1".into(),
            file_hash: file_hash.into(),
            storage_locator: file_hash.into(),
            owner_user_id: "alice".into(),
            org_tag: "ENG".into(),
            is_public: false,
            content_type: MIME_TEXT.into(),
        }
    }

    #[tokio::test]
    async fn processing_twice_does_not_duplicate_chunks() {
        let (pipeline, _broker, dir, pool) = pipeline_with(BrokerConfig::default()).await;
        std::fs::write(dir.path().join("hash-1"), "alpha beta.\n\ngamma delta.").unwrap();

        let msg = message("hash-1");
        let first = pipeline.process(&msg).await.unwrap();
        // Redelivery after a crash between persist and ack.
        let second = pipeline.process(&msg).await.unwrap();
        assert_eq!(first, second);

        let chunks = documents::chunks_for_file(&pool, "hash-1").await.unwrap();
        assert_eq!(chunks.len(), first);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, (i + 1) as i64);
            assert_eq!(c.owner_user_id, "alice");
            assert_eq!(c.org_tag, "ENG");
            assert!(!c.is_public);
        }
    }

    #[tokio::test]
    async fn submit_records_pending_file_and_publishes_once() {
        let (pipeline, broker, _dir, pool) = pipeline_with(BrokerConfig::default()).await;
        let mut receivers = broker.subscribe("file-processing", "test").unwrap();

        pipeline
            .submit("hash-2", "doc.txt", "hash-2", "alice", "ENG", true, MIME_TEXT)
            .await
            .unwrap();

        let file = documents::get_file(&pool, "hash-2").await.unwrap();
        assert_eq!(file.status, FileStatus::Pending);
        assert!(file.is_public);

        let partition = broker.partition_for("hash-2");
        let envelope = receivers[partition].recv().await.unwrap();
        let msg: ProcessingMessage = serde_json::from_str(&envelope.payload).unwrap();
        assert_eq!(msg.file_hash, "hash-2");
        assert_eq!(envelope.key, "hash-2");
    }

    #[tokio::test]
    async fn permanent_content_failure_is_not_retryable() {
        let (pipeline, _broker, dir, _pool) = pipeline_with(BrokerConfig::default()).await;
        std::fs::write(dir.path().join("bad-pdf"), "not a pdf").unwrap();

        let mut msg = message("bad-pdf");
        msg.content_type = crate::parser::MIME_PDF.into();
        let err = pipeline.process(&msg).await.unwrap_err();
        assert!(matches!(err, TidepoolError::PermanentContent(_)));
        assert!(!err.is_retryable());
    }
}
