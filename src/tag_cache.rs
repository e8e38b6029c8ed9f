//! Resolved-tag cache and the effective-tag resolver.
//!
//! Maps a principal to its resolved effective tag set (direct assignments
//! plus every ancestor) and primary tag. Entries are read concurrently by
//! many requesters; invalidation is synchronous — every hierarchy mutation
//! calls [`TagResolutionCache::invalidate_all`] before returning, so a
//! stale read can only occur inside the mutating call itself.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{Result, TidepoolError};
use crate::tags::TagGraph;
use crate::users;

/// Cached resolution result for one principal.
#[derive(Debug, Clone)]
pub struct ResolvedTags {
    pub effective: BTreeSet<String>,
    pub primary: Option<String>,
}

/// Concurrent map from username to [`ResolvedTags`].
#[derive(Default)]
pub struct TagResolutionCache {
    entries: RwLock<HashMap<String, ResolvedTags>>,
}

impl TagResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, username: &str) -> Option<ResolvedTags> {
        self.entries.read().get(username).cloned()
    }

    pub fn insert(&self, username: &str, resolved: ResolvedTags) {
        self.entries.write().insert(username.to_string(), resolved);
    }

    /// Sufficient after a direct per-user assignment change.
    pub fn invalidate_user(&self, username: &str) {
        self.entries.write().remove(username);
    }

    /// Mandatory after any hierarchy mutation: ancestor chains for
    /// arbitrarily many users may have changed.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write();
        let dropped = entries.len();
        entries.clear();
        debug!(dropped, "tag resolution cache invalidated");
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Computes effective tag sets, consulting the cache first and falling
/// back to an ancestor walk over the [`TagGraph`] on a miss.
pub struct TagResolver {
    pool: SqlitePool,
    graph: Arc<TagGraph>,
    cache: Arc<TagResolutionCache>,
}

impl TagResolver {
    pub fn new(pool: SqlitePool, graph: Arc<TagGraph>, cache: Arc<TagResolutionCache>) -> Self {
        Self { pool, graph, cache }
    }

    /// The user's direct tags plus every ancestor of each.
    pub async fn effective_tags(&self, username: &str) -> Result<BTreeSet<String>> {
        Ok(self.resolve(username).await?.effective)
    }

    pub async fn primary_org(&self, username: &str) -> Result<Option<String>> {
        Ok(self.resolve(username).await?.primary)
    }

    async fn resolve(&self, username: &str) -> Result<ResolvedTags> {
        if let Some(hit) = self.cache.get(username) {
            return Ok(hit);
        }

        let user = users::get_user_by_username(&self.pool, username).await?;
        let mut effective = user.org_tags.clone();
        for tag in &user.org_tags {
            match self.graph.ancestors(tag).await {
                Ok(ancestors) => effective.extend(ancestors),
                // A dangling assignment contributes no ancestors.
                Err(TidepoolError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let resolved = ResolvedTags {
            effective,
            primary: user.primary_org.clone(),
        };
        self.cache.insert(username, resolved.clone());
        debug!(username, tags = resolved.effective.len(), "resolved effective tags");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::tags::CreateTag;

    async fn setup() -> (SqlitePool, Arc<TagGraph>, Arc<TagResolutionCache>, TagResolver) {
        let pool = db::connect_in_memory().await.unwrap();
        let cache = Arc::new(TagResolutionCache::new());
        let graph = Arc::new(TagGraph::new(pool.clone(), Arc::clone(&cache)));
        let resolver = TagResolver::new(pool.clone(), Arc::clone(&graph), Arc::clone(&cache));
        (pool, graph, cache, resolver)
    }

    async fn create(graph: &TagGraph, id: &str, parent: Option<&str>) {
        graph
            .create_tag(CreateTag {
                tag_id: id.to_string(),
                name: id.to_string(),
                description: String::new(),
                parent_tag: parent.map(str::to_string),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn effective_tags_include_ancestors() {
        let (pool, graph, _cache, resolver) = setup().await;
        create(&graph, "ROOT", None).await;
        create(&graph, "MID", Some("ROOT")).await;
        create(&graph, "LEAF", Some("MID")).await;
        let user = users::register_user(&pool, &graph, "alice").await.unwrap();
        users::assign_org_tags(&pool, &graph, user.id, vec!["LEAF".into()])
            .await
            .unwrap();

        let tags = resolver.effective_tags("alice").await.unwrap();
        assert!(tags.contains("LEAF"));
        assert!(tags.contains("MID"));
        assert!(tags.contains("ROOT"));
        assert!(tags.contains("PRIVATE_alice"));
    }

    #[tokio::test]
    async fn effective_set_is_superset_of_direct_set() {
        let (pool, graph, _cache, resolver) = setup().await;
        create(&graph, "A", None).await;
        create(&graph, "B", Some("A")).await;
        let user = users::register_user(&pool, &graph, "bob").await.unwrap();
        users::assign_org_tags(&pool, &graph, user.id, vec!["B".into()])
            .await
            .unwrap();

        let direct = users::get_user_by_username(&pool, "bob").await.unwrap().org_tags;
        let effective = resolver.effective_tags("bob").await.unwrap();
        assert!(effective.is_superset(&direct));
    }

    #[tokio::test]
    async fn cache_hit_skips_recomputation_until_invalidated() {
        let (pool, graph, cache, resolver) = setup().await;
        create(&graph, "A", None).await;
        create(&graph, "B", None).await;
        let user = users::register_user(&pool, &graph, "carol").await.unwrap();
        users::assign_org_tags(&pool, &graph, user.id, vec!["B".into()])
            .await
            .unwrap();

        let before = resolver.effective_tags("carol").await.unwrap();
        assert!(!before.contains("A"));

        // Re-parent B under A: the mutation invalidates every entry, so the
        // next read sees the new ancestor chain.
        graph.set_parent("B", Some("A")).await.unwrap();
        assert!(cache.is_empty());

        let after = resolver.effective_tags("carol").await.unwrap();
        assert!(after.contains("A"));
    }

    #[tokio::test]
    async fn primary_org_resolves_through_the_cache() {
        let (pool, graph, _cache, resolver) = setup().await;
        create(&graph, "ENG", None).await;
        let user = users::register_user(&pool, &graph, "erin").await.unwrap();
        assert_eq!(
            resolver.primary_org("erin").await.unwrap().as_deref(),
            Some("PRIVATE_erin")
        );

        users::assign_org_tags(&pool, &graph, user.id, vec!["ENG".into()])
            .await
            .unwrap();
        users::set_primary_org(&pool, &graph, "erin", "ENG").await.unwrap();
        assert_eq!(
            resolver.primary_org("erin").await.unwrap().as_deref(),
            Some("ENG")
        );
    }

    #[tokio::test]
    async fn cache_agrees_with_fresh_computation_after_invalidate_all() {
        let (pool, graph, cache, resolver) = setup().await;
        create(&graph, "X", None).await;
        create(&graph, "Y", Some("X")).await;
        let user = users::register_user(&pool, &graph, "dave").await.unwrap();
        users::assign_org_tags(&pool, &graph, user.id, vec!["Y".into()])
            .await
            .unwrap();

        let cached = resolver.effective_tags("dave").await.unwrap();
        cache.invalidate_all();
        let fresh = resolver.effective_tags("dave").await.unwrap();
        assert_eq!(cached, fresh);
    }
}
