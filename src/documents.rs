//! File records and document lifecycle.
//!
//! Deletion cascades across the search index, object store, chunk rows,
//! and the file record as a sequence of independent fallible steps;
//! partial failures are collected into a [`DeletionOutcome`] instead of
//! aborting the remaining steps.

use std::collections::BTreeSet;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::{Result, TidepoolError};
use crate::models::{FileRecord, FileStatus, IngestedChunk};
use crate::object_store::ObjectStore;
use crate::search_index::SearchIndex;
use crate::tag_cache::TagResolver;

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    file_hash: String,
    file_name: String,
    storage_locator: String,
    owner_user_id: String,
    org_tag: String,
    is_public: i64,
    status: String,
    uploaded_at: i64,
}

impl FileRow {
    pub(crate) fn into_record(self) -> Result<FileRecord> {
        let status = FileStatus::parse(&self.status).ok_or_else(|| {
            TidepoolError::TransientIo(format!(
                "unknown file status {:?} for {}",
                self.status, self.file_hash
            ))
        })?;
        Ok(FileRecord {
            file_hash: self.file_hash,
            file_name: self.file_name,
            storage_locator: self.storage_locator,
            owner_user_id: self.owner_user_id,
            org_tag: self.org_tag,
            is_public: self.is_public != 0,
            status,
            uploaded_at: self.uploaded_at,
        })
    }
}

const SELECT_FILE: &str = "SELECT file_hash, file_name, storage_locator, owner_user_id, \
                           org_tag, is_public, status, uploaded_at FROM files";

pub async fn get_file(pool: &SqlitePool, file_hash: &str) -> Result<FileRecord> {
    sqlx::query_as::<_, FileRow>(&format!("{SELECT_FILE} WHERE file_hash = ?"))
        .bind(file_hash)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| TidepoolError::NotFound(format!("file {file_hash}")))?
        .into_record()
}

pub async fn files_owned_by(pool: &SqlitePool, owner_user_id: &str) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query_as::<_, FileRow>(&format!(
        "{SELECT_FILE} WHERE owner_user_id = ? ORDER BY uploaded_at DESC, file_hash"
    ))
    .bind(owner_user_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(FileRow::into_record).collect()
}

/// All files the requester may see. Resolves the requester's effective
/// tags (cache first, graph on miss) and filters at the SQL level.
pub async fn accessible_files(
    pool: &SqlitePool,
    resolver: &TagResolver,
    username: &str,
) -> Result<Vec<FileRecord>> {
    let effective: BTreeSet<String> = resolver.effective_tags(username).await?;
    crate::access::accessible_files(pool, username, &effective).await
}

/// Ordered chunks for a file.
pub async fn chunks_for_file(pool: &SqlitePool, file_hash: &str) -> Result<Vec<IngestedChunk>> {
    let rows = sqlx::query_as::<_, (String, i64, String, String, String, i64)>(
        "SELECT file_hash, chunk_index, text, owner_user_id, org_tag, is_public \
         FROM chunks WHERE file_hash = ? ORDER BY chunk_index ASC",
    )
    .bind(file_hash)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(
            |(file_hash, chunk_index, text, owner_user_id, org_tag, is_public)| IngestedChunk {
                file_hash,
                chunk_index,
                text,
                owner_user_id,
                org_tag,
                is_public: is_public != 0,
            },
        )
        .collect())
}

/// Presigned download URL for a stored file.
pub async fn download_url(
    pool: &SqlitePool,
    store: &dyn ObjectStore,
    file_hash: &str,
    ttl_secs: u64,
) -> Result<String> {
    let file = get_file(pool, file_hash).await?;
    store.presigned_download_url(&file.storage_locator, ttl_secs)
}

/// One failed step of a cascading delete.
#[derive(Debug, serde::Serialize)]
pub struct DeletionFailure {
    pub step: &'static str,
    pub error: String,
}

/// Structured result of a cascading delete. The delete is considered done
/// even with partial failures; operators replay failed steps from logs.
#[derive(Debug, serde::Serialize)]
pub struct DeletionOutcome {
    pub file_hash: String,
    pub failures: Vec<DeletionFailure>,
}

impl DeletionOutcome {
    pub fn fully_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delete a document and its dependent resources: search index entries,
/// the stored object, chunk rows, and the file record. Each step runs
/// regardless of earlier failures. Tolerates an ingestion still in flight
/// (zero chunk rows is not an error). Only a missing file record aborts.
pub async fn delete_document(
    pool: &SqlitePool,
    store: &dyn ObjectStore,
    index: &dyn SearchIndex,
    file_hash: &str,
) -> Result<DeletionOutcome> {
    let file = get_file(pool, file_hash).await?;
    let mut failures = Vec::new();

    if let Err(e) = index.delete_by_file_hash(file_hash).await {
        warn!(file_hash, error = %e, "search index delete failed");
        failures.push(DeletionFailure {
            step: "search_index",
            error: e.to_string(),
        });
    }

    match store.delete(&file.storage_locator).await {
        Ok(_) => {}
        Err(e) => {
            warn!(file_hash, error = %e, "object store delete failed");
            failures.push(DeletionFailure {
                step: "object_store",
                error: e.to_string(),
            });
        }
    }

    if let Err(e) = sqlx::query("DELETE FROM chunks WHERE file_hash = ?")
        .bind(file_hash)
        .execute(pool)
        .await
    {
        warn!(file_hash, error = %e, "chunk delete failed");
        failures.push(DeletionFailure {
            step: "chunks",
            error: e.to_string(),
        });
    }

    if let Err(e) = sqlx::query("DELETE FROM files WHERE file_hash = ?")
        .bind(file_hash)
        .execute(pool)
        .await
    {
        warn!(file_hash, error = %e, "file record delete failed");
        failures.push(DeletionFailure {
            step: "file_record",
            error: e.to_string(),
        });
    }

    info!(
        file_hash,
        failed_steps = failures.len(),
        "document deletion finished"
    );
    Ok(DeletionOutcome {
        file_hash: file_hash.to_string(),
        failures,
    })
}
