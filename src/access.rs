//! Access filter for ingested resources.
//!
//! A resource is visible to a requester iff they own it, it is public, or
//! its org tag is in the requester's effective tag set. With an empty
//! effective set only the owner/public branches apply. Private tags never
//! leak: the tag graph has no edges into another user's private tag, so it
//! can never enter a foreign effective set.

use std::collections::BTreeSet;

use sqlx::SqlitePool;

use crate::documents::FileRow;
use crate::error::Result;
use crate::models::FileRecord;

/// The visibility predicate, shared by SQL and in-memory filtering.
pub fn is_visible(
    owner_user_id: &str,
    org_tag: &str,
    is_public: bool,
    requester: &str,
    effective_tags: &BTreeSet<String>,
) -> bool {
    owner_user_id == requester || is_public || effective_tags.contains(org_tag)
}

/// Filter an in-memory collection of file records.
pub fn filter_visible<'a>(
    files: impl IntoIterator<Item = &'a FileRecord>,
    requester: &str,
    effective_tags: &BTreeSet<String>,
) -> Vec<&'a FileRecord> {
    files
        .into_iter()
        .filter(|f| is_visible(&f.owner_user_id, &f.org_tag, f.is_public, requester, effective_tags))
        .collect()
}

/// All files the requester may see, filtered at the SQL level. Admits
/// exactly the set [`is_visible`] admits.
pub async fn accessible_files(
    pool: &SqlitePool,
    requester: &str,
    effective_tags: &BTreeSet<String>,
) -> Result<Vec<FileRecord>> {
    let rows = if effective_tags.is_empty() {
        sqlx::query_as::<_, FileRow>(
            "SELECT file_hash, file_name, storage_locator, owner_user_id, org_tag, is_public, \
                    status, uploaded_at \
             FROM files WHERE owner_user_id = ? OR is_public = 1 \
             ORDER BY uploaded_at DESC, file_hash",
        )
        .bind(requester)
        .fetch_all(pool)
        .await?
    } else {
        let placeholders = vec!["?"; effective_tags.len()].join(", ");
        let sql = format!(
            "SELECT file_hash, file_name, storage_locator, owner_user_id, org_tag, is_public, \
                    status, uploaded_at \
             FROM files WHERE owner_user_id = ? OR is_public = 1 OR org_tag IN ({placeholders}) \
             ORDER BY uploaded_at DESC, file_hash"
        );
        let mut query = sqlx::query_as::<_, FileRow>(&sql).bind(requester);
        for tag in effective_tags {
            query = query.bind(tag);
        }
        query.fetch_all(pool).await?
    };

    rows.into_iter().map(FileRow::into_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileStatus;

    fn record(owner: &str, org_tag: &str, is_public: bool) -> FileRecord {
        FileRecord {
            file_hash: format!("{owner}-{org_tag}"),
            file_name: "doc.txt".into(),
            storage_locator: "loc".into(),
            owner_user_id: owner.into(),
            org_tag: org_tag.into(),
            is_public,
            status: FileStatus::Completed,
            uploaded_at: 0,
        }
    }

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn public_files_are_visible_to_everyone() {
        let f = record("someone", "ENG", true);
        assert!(is_visible(&f.owner_user_id, &f.org_tag, f.is_public, "stranger", &tags(&[])));
    }

    #[test]
    fn owner_sees_own_files_with_empty_effective_set() {
        let f = record("alice", "PRIVATE_alice", false);
        assert!(is_visible(&f.owner_user_id, &f.org_tag, f.is_public, "alice", &tags(&[])));
    }

    #[test]
    fn tag_match_grants_visibility() {
        let f = record("bob", "ENG", false);
        assert!(is_visible(&f.owner_user_id, &f.org_tag, f.is_public, "alice", &tags(&["ENG"])));
    }

    #[test]
    fn empty_effective_set_hides_org_files() {
        let f = record("bob", "ENG", false);
        assert!(!is_visible(&f.owner_user_id, &f.org_tag, f.is_public, "alice", &tags(&[])));
    }

    #[test]
    fn foreign_private_tags_do_not_leak() {
        let f = record("bob", "PRIVATE_bob", false);
        // Alice's effective set can never contain PRIVATE_bob; even a rich
        // set of org tags does not admit the file.
        assert!(!is_visible(
            &f.owner_user_id,
            &f.org_tag,
            f.is_public,
            "alice",
            &tags(&["ENG", "SALES", "PRIVATE_alice"]),
        ));
    }

    #[test]
    fn filter_visible_applies_all_branches() {
        let files = vec![
            record("alice", "PRIVATE_alice", false),
            record("bob", "ENG", false),
            record("carol", "SALES", true),
            record("dave", "PRIVATE_dave", false),
        ];
        let visible = filter_visible(&files, "alice", &tags(&["ENG", "PRIVATE_alice"]));
        let hashes: Vec<&str> = visible.iter().map(|f| f.file_hash.as_str()).collect();
        assert_eq!(
            hashes,
            vec!["alice-PRIVATE_alice", "bob-ENG", "carol-SALES"]
        );
    }
}
