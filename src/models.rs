//! Core data types that flow through the ingestion and access-control
//! pipeline.
//!
//! `org_tags` is a native set in code; the comma-joined form exists only at
//! the storage boundary, via [`encode_tags`] / [`decode_tags`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tag id of the protected default organization, created at bootstrap.
pub const DEFAULT_ORG_TAG: &str = "DEFAULT";

/// Prefix of the per-user private tag auto-created at registration.
pub const PRIVATE_TAG_PREFIX: &str = "PRIVATE_";

/// Returns the private tag id owned by `username`.
pub fn private_tag_id(username: &str) -> String {
    format!("{PRIVATE_TAG_PREFIX}{username}")
}

/// A node in the organization tag forest.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OrganizationTag {
    pub tag_id: String,
    pub name: String,
    pub description: String,
    pub parent_tag: Option<String>,
    pub created_at: i64,
}

/// Tag tree view node. Leaf nodes omit the `children` field entirely.
#[derive(Debug, Clone, Serialize)]
pub struct TagTreeNode {
    pub tag_id: String,
    pub name: String,
    pub description: String,
    pub parent_tag: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TagTreeNode>,
}

/// A registered principal. Credential material lives outside this core.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub org_tags: BTreeSet<String>,
    pub primary_org: Option<String>,
    pub is_admin: bool,
    pub created_at: i64,
}

/// Encode a tag set into its comma-joined storage form.
pub fn encode_tags(tags: &BTreeSet<String>) -> String {
    tags.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Decode the comma-joined storage form back into a tag set.
/// Empty segments are dropped, so `""` decodes to the empty set.
pub fn decode_tags(joined: &str) -> BTreeSet<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Ingestion status of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Completed,
    DeadLettered,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Completed => "completed",
            FileStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<FileStatus> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "completed" => Some(FileStatus::Completed),
            "dead_lettered" => Some(FileStatus::DeadLettered),
            _ => None,
        }
    }
}

/// An uploaded file awaiting or past ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub file_hash: String,
    pub file_name: String,
    pub storage_locator: String,
    pub owner_user_id: String,
    pub org_tag: String,
    pub is_public: bool,
    pub status: FileStatus,
    pub uploaded_at: i64,
}

/// One bounded slice of extracted document text. `chunk_index` is 1-based
/// and order-significant within a file; `(file_hash, chunk_index)` is
/// unique in storage.
#[derive(Debug, Clone, Serialize)]
pub struct IngestedChunk {
    pub file_hash: String,
    pub chunk_index: i64,
    pub text: String,
    pub owner_user_id: String,
    pub org_tag: String,
    pub is_public: bool,
}

/// Wire entity published to the processing topic. Delivered at-least-once;
/// the consumer is idempotent with respect to `file_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMessage {
    pub message_id: String,
    pub file_hash: String,
    pub storage_locator: String,
    pub owner_user_id: String,
    pub org_tag: String,
    pub is_public: bool,
    pub content_type: String,
}

/// Published to the completion topic after a file's chunks commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub file_hash: String,
    pub chunk_count: usize,
    pub completed_at: DateTime<Utc>,
}
