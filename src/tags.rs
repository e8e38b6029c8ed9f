//! Organization tag hierarchy.
//!
//! Tags form a forest: each tag has at most one parent, and re-parenting
//! runs a cycle guard on every write. Mutations are serialized by a single
//! writer lock because the cycle check needs a consistent snapshot of
//! parent pointers during its ancestor walk; reads go straight to the
//! pool. Every mutation synchronously invalidates the whole tag
//! resolution cache before returning.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Result, TidepoolError};
use crate::models::{OrganizationTag, TagTreeNode, DEFAULT_ORG_TAG};
use crate::tag_cache::TagResolutionCache;

/// Fields for a new tag.
#[derive(Debug, Clone)]
pub struct CreateTag {
    pub tag_id: String,
    pub name: String,
    pub description: String,
    pub parent_tag: Option<String>,
}

/// Partial update. `parent_tag` uses the double-option pattern: outer
/// `None` leaves the parent unchanged, `Some(None)` re-roots the tag.
#[derive(Debug, Clone, Default)]
pub struct UpdateTag {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_tag: Option<Option<String>>,
}

pub struct TagGraph {
    pool: SqlitePool,
    cache: Arc<TagResolutionCache>,
    write_lock: Mutex<()>,
}

impl TagGraph {
    pub fn new(pool: SqlitePool, cache: Arc<TagResolutionCache>) -> Self {
        Self {
            pool,
            cache,
            write_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<TagResolutionCache> {
        &self.cache
    }

    pub async fn fetch(&self, tag_id: &str) -> Result<Option<OrganizationTag>> {
        let tag = sqlx::query_as::<_, OrganizationTag>(
            "SELECT tag_id, name, description, parent_tag, created_at \
             FROM organization_tags WHERE tag_id = ?",
        )
        .bind(tag_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tag)
    }

    pub async fn get(&self, tag_id: &str) -> Result<OrganizationTag> {
        self.fetch(tag_id)
            .await?
            .ok_or_else(|| TidepoolError::NotFound(format!("organization tag {tag_id}")))
    }

    pub async fn create_tag(&self, new_tag: CreateTag) -> Result<OrganizationTag> {
        if new_tag.tag_id.trim().is_empty() {
            return Err(TidepoolError::Validation("tag id must not be empty".into()));
        }
        if new_tag.tag_id.contains(',') {
            return Err(TidepoolError::Validation(
                "tag id must not contain commas".into(),
            ));
        }

        let _guard = self.write_lock.lock().await;

        if self.fetch(&new_tag.tag_id).await?.is_some() {
            return Err(TidepoolError::Conflict(format!(
                "tag id {} already exists",
                new_tag.tag_id
            )));
        }
        if let Some(parent) = &new_tag.parent_tag {
            if self.fetch(parent).await?.is_none() {
                return Err(TidepoolError::NotFound(format!("parent tag {parent}")));
            }
        }

        let created_at = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO organization_tags (tag_id, name, description, parent_tag, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&new_tag.tag_id)
        .bind(&new_tag.name)
        .bind(&new_tag.description)
        .bind(&new_tag.parent_tag)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        self.cache.invalidate_all();
        info!(tag_id = %new_tag.tag_id, parent = ?new_tag.parent_tag, "organization tag created");

        Ok(OrganizationTag {
            tag_id: new_tag.tag_id,
            name: new_tag.name,
            description: new_tag.description,
            parent_tag: new_tag.parent_tag,
            created_at,
        })
    }

    /// Create a root tag if it does not exist yet. Used by registration
    /// (private tags) and bootstrap (the default tag).
    pub async fn ensure_tag(&self, tag_id: &str, name: &str, description: &str) -> Result<()> {
        match self
            .create_tag(CreateTag {
                tag_id: tag_id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                parent_tag: None,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(TidepoolError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn update_tag(&self, tag_id: &str, update: UpdateTag) -> Result<OrganizationTag> {
        let _guard = self.write_lock.lock().await;

        let mut tag = self.get(tag_id).await?;

        if let Some(new_parent) = &update.parent_tag {
            if let Some(parent) = new_parent {
                if parent == tag_id {
                    return Err(TidepoolError::Validation(
                        "a tag cannot be its own parent".into(),
                    ));
                }
                if self.fetch(parent).await?.is_none() {
                    return Err(TidepoolError::NotFound(format!("parent tag {parent}")));
                }
                if self.would_form_cycle(tag_id, parent).await? {
                    return Err(TidepoolError::Conflict(format!(
                        "setting {parent} as parent of {tag_id} would create a cycle"
                    )));
                }
            }
            tag.parent_tag = new_parent.clone();
        }
        if let Some(name) = update.name {
            tag.name = name;
        }
        if let Some(description) = update.description {
            tag.description = description;
        }

        sqlx::query(
            "UPDATE organization_tags SET name = ?, description = ?, parent_tag = ? \
             WHERE tag_id = ?",
        )
        .bind(&tag.name)
        .bind(&tag.description)
        .bind(&tag.parent_tag)
        .bind(tag_id)
        .execute(&self.pool)
        .await?;

        self.cache.invalidate_all();
        info!(tag_id, parent = ?tag.parent_tag, "organization tag updated");
        Ok(tag)
    }

    /// Re-parent a tag. `None` makes it a root.
    pub async fn set_parent(&self, tag_id: &str, new_parent: Option<&str>) -> Result<()> {
        self.update_tag(
            tag_id,
            UpdateTag {
                parent_tag: Some(new_parent.map(str::to_string)),
                ..UpdateTag::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Walk from `new_parent` upward; if `tag_id` is encountered the edit
    /// would close a cycle. This is the authoritative guard and runs on
    /// every re-parent.
    async fn would_form_cycle(&self, tag_id: &str, new_parent: &str) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut current = Some(new_parent.to_string());
        while let Some(id) = current {
            if id == tag_id {
                return Ok(true);
            }
            // A corrupted parent chain must not spin forever.
            if !seen.insert(id.clone()) {
                return Ok(true);
            }
            current = sqlx::query_scalar::<_, Option<String>>(
                "SELECT parent_tag FROM organization_tags WHERE tag_id = ?",
            )
            .bind(&id)
            .fetch_optional(&self.pool)
            .await?
            .flatten();
        }
        Ok(false)
    }

    pub async fn delete_tag(&self, tag_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        self.get(tag_id).await?;

        if tag_id == DEFAULT_ORG_TAG {
            return Err(TidepoolError::Validation(
                "the default organization tag cannot be deleted".into(),
            ));
        }

        let child_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM organization_tags WHERE parent_tag = ?")
                .bind(tag_id)
                .fetch_one(&self.pool)
                .await?;
        if child_count > 0 {
            return Err(TidepoolError::Conflict(format!(
                "tag {tag_id} has {child_count} child tags"
            )));
        }

        let user_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM users \
             WHERE (',' || org_tags || ',') LIKE ('%,' || ? || ',%') OR primary_org = ?",
        )
        .bind(tag_id)
        .bind(tag_id)
        .fetch_one(&self.pool)
        .await?;
        if user_count > 0 {
            return Err(TidepoolError::Conflict(format!(
                "tag {tag_id} is assigned to {user_count} users"
            )));
        }

        let file_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE org_tag = ?")
            .bind(tag_id)
            .fetch_one(&self.pool)
            .await?;
        if file_count > 0 {
            return Err(TidepoolError::Conflict(format!(
                "tag {tag_id} is associated with {file_count} documents"
            )));
        }

        sqlx::query("DELETE FROM organization_tags WHERE tag_id = ?")
            .bind(tag_id)
            .execute(&self.pool)
            .await?;

        self.cache.invalidate_all();
        info!(tag_id, "organization tag deleted");
        Ok(())
    }

    /// Direct children, ordered by tag id.
    pub async fn children(&self, tag_id: &str) -> Result<Vec<OrganizationTag>> {
        self.get(tag_id).await?;
        let children = sqlx::query_as::<_, OrganizationTag>(
            "SELECT tag_id, name, description, parent_tag, created_at \
             FROM organization_tags WHERE parent_tag = ? ORDER BY tag_id",
        )
        .bind(tag_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(children)
    }

    /// Parent chain from `tag_id`'s parent up to the forest root,
    /// terminating on the first missing or null parent.
    pub async fn ancestors(&self, tag_id: &str) -> Result<Vec<String>> {
        let tag = self.get(tag_id).await?;
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = tag.parent_tag;
        while let Some(id) = current {
            if !seen.insert(id.clone()) {
                break;
            }
            let parent = sqlx::query_scalar::<_, Option<String>>(
                "SELECT parent_tag FROM organization_tags WHERE tag_id = ?",
            )
            .bind(&id)
            .fetch_optional(&self.pool)
            .await?;
            match parent {
                Some(next) => {
                    chain.push(id);
                    current = next;
                }
                // Dangling reference: the chain ends here.
                None => break,
            }
        }
        Ok(chain)
    }

    /// Full forest view: children grouped under each root. Leaf nodes omit
    /// the `children` field when serialized.
    pub async fn tree(&self) -> Result<Vec<TagTreeNode>> {
        let all = sqlx::query_as::<_, OrganizationTag>(
            "SELECT tag_id, name, description, parent_tag, created_at \
             FROM organization_tags ORDER BY tag_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let ids: HashSet<&str> = all.iter().map(|t| t.tag_id.as_str()).collect();
        let mut by_parent: HashMap<&str, Vec<&OrganizationTag>> = HashMap::new();
        let mut roots = Vec::new();
        for tag in &all {
            match tag.parent_tag.as_deref().filter(|p| ids.contains(p)) {
                Some(parent) => by_parent.entry(parent).or_default().push(tag),
                None => roots.push(tag),
            }
        }

        fn build(tag: &OrganizationTag, by_parent: &HashMap<&str, Vec<&OrganizationTag>>) -> TagTreeNode {
            let children = by_parent
                .get(tag.tag_id.as_str())
                .map(|kids| kids.iter().map(|k| build(k, by_parent)).collect())
                .unwrap_or_default();
            TagTreeNode {
                tag_id: tag.tag_id.clone(),
                name: tag.name.clone(),
                description: tag.description.clone(),
                parent_tag: tag.parent_tag.clone(),
                children,
            }
        }

        Ok(roots.into_iter().map(|t| build(t, &by_parent)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn graph() -> TagGraph {
        let pool = db::connect_in_memory().await.unwrap();
        TagGraph::new(pool, Arc::new(TagResolutionCache::new()))
    }

    fn tag(id: &str, parent: Option<&str>) -> CreateTag {
        CreateTag {
            tag_id: id.to_string(),
            name: format!("{id} name"),
            description: String::new(),
            parent_tag: parent.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn create_and_fetch() {
        let g = graph().await;
        g.create_tag(tag("ENG", None)).await.unwrap();
        let tag = g.get("ENG").await.unwrap();
        assert_eq!(tag.name, "ENG name");
        assert!(tag.parent_tag.is_none());
    }

    #[tokio::test]
    async fn duplicate_id_conflicts() {
        let g = graph().await;
        g.create_tag(tag("ENG", None)).await.unwrap();
        let err = g.create_tag(tag("ENG", None)).await.unwrap_err();
        assert!(matches!(err, TidepoolError::Conflict(_)));
    }

    #[tokio::test]
    async fn missing_parent_rejected() {
        let g = graph().await;
        let err = g.create_tag(tag("ENG", Some("NOPE"))).await.unwrap_err();
        assert!(matches!(err, TidepoolError::NotFound(_)));
    }

    #[tokio::test]
    async fn self_parent_rejected() {
        let g = graph().await;
        g.create_tag(tag("A", None)).await.unwrap();
        let err = g.set_parent("A", Some("A")).await.unwrap_err();
        assert!(matches!(err, TidepoolError::Validation(_)));
    }

    #[tokio::test]
    async fn reparenting_under_own_descendant_is_rejected() {
        let g = graph().await;
        g.create_tag(tag("A", None)).await.unwrap();
        g.create_tag(tag("B", Some("A"))).await.unwrap();

        let err = g.set_parent("A", Some("B")).await.unwrap_err();
        assert!(matches!(err, TidepoolError::Conflict(_)));

        // Tree unchanged.
        assert_eq!(g.get("A").await.unwrap().parent_tag, None);
        assert_eq!(g.get("B").await.unwrap().parent_tag.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn ancestors_never_contain_self_after_valid_mutations() {
        let g = graph().await;
        g.create_tag(tag("A", None)).await.unwrap();
        g.create_tag(tag("B", Some("A"))).await.unwrap();
        g.create_tag(tag("C", Some("B"))).await.unwrap();
        g.set_parent("C", Some("A")).await.unwrap();
        g.set_parent("B", Some("C")).await.unwrap();

        for id in ["A", "B", "C"] {
            let chain = g.ancestors(id).await.unwrap();
            assert!(!chain.contains(&id.to_string()), "{id} is its own ancestor");
        }
    }

    #[tokio::test]
    async fn ancestors_walk_to_root() {
        let g = graph().await;
        g.create_tag(tag("ROOT", None)).await.unwrap();
        g.create_tag(tag("MID", Some("ROOT"))).await.unwrap();
        g.create_tag(tag("LEAF", Some("MID"))).await.unwrap();

        let chain = g.ancestors("LEAF").await.unwrap();
        assert_eq!(chain, vec!["MID".to_string(), "ROOT".to_string()]);
        assert!(g.ancestors("ROOT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_with_children_conflicts_and_leaves_tree_unchanged() {
        let g = graph().await;
        g.create_tag(tag("A", None)).await.unwrap();
        g.create_tag(tag("B", Some("A"))).await.unwrap();

        let err = g.delete_tag("A").await.unwrap_err();
        assert!(matches!(err, TidepoolError::Conflict(_)));
        assert!(g.fetch("A").await.unwrap().is_some());
        assert!(g.fetch("B").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn default_tag_is_protected() {
        let g = graph().await;
        g.create_tag(tag(DEFAULT_ORG_TAG, None)).await.unwrap();
        let err = g.delete_tag(DEFAULT_ORG_TAG).await.unwrap_err();
        assert!(matches!(err, TidepoolError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_leaf_succeeds() {
        let g = graph().await;
        g.create_tag(tag("A", None)).await.unwrap();
        g.create_tag(tag("B", Some("A"))).await.unwrap();
        g.delete_tag("B").await.unwrap();
        assert!(g.fetch("B").await.unwrap().is_none());
        g.delete_tag("A").await.unwrap();
    }

    #[tokio::test]
    async fn tree_groups_children_and_leaves_omit_children_field() {
        let g = graph().await;
        g.create_tag(tag("A", None)).await.unwrap();
        g.create_tag(tag("B", Some("A"))).await.unwrap();
        g.create_tag(tag("Z", None)).await.unwrap();

        let tree = g.tree().await.unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].tag_id, "A");
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].tag_id, "B");

        let json = serde_json::to_value(&tree).unwrap();
        // Leaf nodes carry no children field at all.
        assert!(json[0]["children"][0].get("children").is_none());
        assert!(json[1].get("children").is_none());
    }

    #[tokio::test]
    async fn mutations_invalidate_the_cache() {
        let pool = db::connect_in_memory().await.unwrap();
        let cache = Arc::new(TagResolutionCache::new());
        let g = TagGraph::new(pool, Arc::clone(&cache));

        g.create_tag(tag("A", None)).await.unwrap();
        cache.insert(
            "alice",
            crate::tag_cache::ResolvedTags {
                effective: Default::default(),
                primary: None,
            },
        );
        g.create_tag(tag("B", Some("A"))).await.unwrap();
        assert!(cache.is_empty());
    }
}
