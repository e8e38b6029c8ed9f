//! User registry: registration with auto-created private tags, tag
//! assignment, primary-org selection, and the admin bootstrap step.
//!
//! Bootstrap is an explicit startup call with an injected pool handle,
//! run once under application lifecycle control — there is no ambient
//! static state.

use std::collections::BTreeSet;

use sqlx::SqlitePool;
use tracing::info;

use crate::config::BootstrapConfig;
use crate::error::{Result, TidepoolError};
use crate::models::{
    decode_tags, encode_tags, private_tag_id, OrganizationTag, User, DEFAULT_ORG_TAG,
};
use crate::tag_cache::ResolvedTags;
use crate::tags::TagGraph;

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    org_tags: String,
    primary_org: Option<String>,
    is_admin: i64,
    created_at: i64,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            org_tags: decode_tags(&row.org_tags),
            primary_org: row.primary_org,
            is_admin: row.is_admin != 0,
            created_at: row.created_at,
        }
    }
}

const SELECT_USER: &str =
    "SELECT id, username, org_tags, primary_org, is_admin, created_at FROM users";

pub async fn get_user_by_username(pool: &SqlitePool, username: &str) -> Result<User> {
    let row = sqlx::query_as::<_, UserRow>(&format!("{SELECT_USER} WHERE username = ?"))
        .bind(username)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| TidepoolError::NotFound(format!("user {username}")))?;
    Ok(row.into())
}

pub async fn get_user_by_id(pool: &SqlitePool, id: i64) -> Result<User> {
    let row = sqlx::query_as::<_, UserRow>(&format!("{SELECT_USER} WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| TidepoolError::NotFound(format!("user id {id}")))?;
    Ok(row.into())
}

/// Register a new user. Creates the `PRIVATE_<username>` tag, assigns it
/// as the sole direct tag and primary org, and primes the resolution
/// cache. The private tag is a root, so its effective set is itself.
pub async fn register_user(pool: &SqlitePool, graph: &TagGraph, username: &str) -> Result<User> {
    let username = username.trim();
    if username.is_empty() {
        return Err(TidepoolError::Validation("username must not be empty".into()));
    }
    if username.contains(',') {
        return Err(TidepoolError::Validation(
            "username must not contain commas".into(),
        ));
    }

    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Err(TidepoolError::Conflict(format!(
            "username {username} already exists"
        )));
    }

    graph
        .ensure_tag(
            DEFAULT_ORG_TAG,
            "Default organization",
            "System default organization tag",
        )
        .await?;

    let private = private_tag_id(username);
    graph
        .ensure_tag(
            &private,
            &format!("{username}'s private space"),
            "Per-user private tag, visible only to its owner",
        )
        .await?;

    let created_at = chrono::Utc::now().timestamp();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO users (username, org_tags, primary_org, is_admin, created_at) \
         VALUES (?, ?, ?, 0, ?) RETURNING id",
    )
    .bind(username)
    .bind(&private)
    .bind(&private)
    .bind(created_at)
    .fetch_one(pool)
    .await?;

    let mut effective = BTreeSet::new();
    effective.insert(private.clone());
    graph.cache().insert(
        username,
        ResolvedTags {
            effective,
            primary: Some(private.clone()),
        },
    );

    info!(username, "user registered with private organization tag");

    Ok(User {
        id,
        username: username.to_string(),
        org_tags: [private.clone()].into_iter().collect(),
        primary_org: Some(private),
        is_admin: false,
        created_at,
    })
}

/// Replace a user's direct tag assignments. The user's private tag can
/// never be stripped: it is re-added whenever the new set omits it. If the
/// current primary org falls out of the new set it is repaired, preferring
/// the private tag.
pub async fn assign_org_tags(
    pool: &SqlitePool,
    graph: &TagGraph,
    user_id: i64,
    tags: Vec<String>,
) -> Result<User> {
    let user = get_user_by_id(pool, user_id).await?;

    for tag in &tags {
        if graph.fetch(tag).await?.is_none() {
            return Err(TidepoolError::NotFound(format!("organization tag {tag}")));
        }
    }

    let mut final_tags: BTreeSet<String> = tags.into_iter().collect();
    let private = private_tag_id(&user.username);
    if user.org_tags.contains(&private) {
        final_tags.insert(private.clone());
    }

    let primary = match &user.primary_org {
        Some(p) if final_tags.contains(p) => Some(p.clone()),
        _ if final_tags.contains(&private) => Some(private),
        _ => final_tags.iter().next().cloned(),
    };

    sqlx::query("UPDATE users SET org_tags = ?, primary_org = ? WHERE id = ?")
        .bind(encode_tags(&final_tags))
        .bind(&primary)
        .bind(user_id)
        .execute(pool)
        .await?;

    graph.cache().invalidate_user(&user.username);
    info!(
        username = %user.username,
        tags = final_tags.len(),
        "organization tags assigned"
    );

    Ok(User {
        org_tags: final_tags,
        primary_org: primary,
        ..user
    })
}

/// Set the user's primary org. Must be one of their direct tags.
pub async fn set_primary_org(
    pool: &SqlitePool,
    graph: &TagGraph,
    username: &str,
    tag: &str,
) -> Result<()> {
    let user = get_user_by_username(pool, username).await?;
    if !user.org_tags.contains(tag) {
        return Err(TidepoolError::Validation(format!(
            "organization tag {tag} is not assigned to {username}"
        )));
    }

    sqlx::query("UPDATE users SET primary_org = ? WHERE username = ?")
        .bind(tag)
        .bind(username)
        .execute(pool)
        .await?;

    graph.cache().invalidate_user(username);
    Ok(())
}

/// A user's direct tag assignments with tag details, for display.
#[derive(Debug, serde::Serialize)]
pub struct UserOrgTags {
    pub org_tags: BTreeSet<String>,
    pub primary_org: Option<String>,
    pub details: Vec<OrganizationTag>,
}

pub async fn user_org_tags(
    pool: &SqlitePool,
    graph: &TagGraph,
    username: &str,
) -> Result<UserOrgTags> {
    let user = get_user_by_username(pool, username).await?;
    let mut details = Vec::new();
    for tag in &user.org_tags {
        if let Some(detail) = graph.fetch(tag).await? {
            details.push(detail);
        }
    }
    Ok(UserOrgTags {
        org_tags: user.org_tags,
        primary_org: user.primary_org,
        details,
    })
}

/// Idempotent startup step: ensure the default tag, the configured admin
/// org tags, and the admin account exist.
pub async fn run_admin_bootstrap(
    pool: &SqlitePool,
    graph: &TagGraph,
    config: &BootstrapConfig,
) -> Result<()> {
    graph
        .ensure_tag(
            DEFAULT_ORG_TAG,
            "Default organization",
            "System default organization tag",
        )
        .await?;
    for tag in &config.admin_org_tags {
        graph.ensure_tag(tag, tag, "").await?;
    }

    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE username = ?")
        .bind(&config.admin_username)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        info!(username = %config.admin_username, "admin account already present");
        return Ok(());
    }

    let tags: BTreeSet<String> = config.admin_org_tags.iter().cloned().collect();
    sqlx::query(
        "INSERT INTO users (username, org_tags, primary_org, is_admin, created_at) \
         VALUES (?, ?, ?, 1, ?)",
    )
    .bind(&config.admin_username)
    .bind(encode_tags(&tags))
    .bind(&config.admin_primary_org)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    info!(username = %config.admin_username, "admin account created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::tag_cache::TagResolutionCache;
    use crate::tags::CreateTag;
    use std::sync::Arc;

    async fn setup() -> (SqlitePool, TagGraph) {
        let pool = db::connect_in_memory().await.unwrap();
        let graph = TagGraph::new(pool.clone(), Arc::new(TagResolutionCache::new()));
        (pool, graph)
    }

    async fn create_tag(graph: &TagGraph, id: &str) {
        graph
            .create_tag(CreateTag {
                tag_id: id.to_string(),
                name: id.to_string(),
                description: String::new(),
                parent_tag: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn registration_creates_private_tag_and_assigns_it() {
        let (pool, graph) = setup().await;
        let user = register_user(&pool, &graph, "alice").await.unwrap();

        assert!(user.org_tags.contains("PRIVATE_alice"));
        assert_eq!(user.primary_org.as_deref(), Some("PRIVATE_alice"));
        assert!(graph.fetch("PRIVATE_alice").await.unwrap().is_some());
        assert!(graph.fetch(DEFAULT_ORG_TAG).await.unwrap().is_some());

        let reloaded = get_user_by_username(&pool, "alice").await.unwrap();
        assert_eq!(reloaded.org_tags, user.org_tags);
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let (pool, graph) = setup().await;
        register_user(&pool, &graph, "alice").await.unwrap();
        let err = register_user(&pool, &graph, "alice").await.unwrap_err();
        assert!(matches!(err, TidepoolError::Conflict(_)));
    }

    #[tokio::test]
    async fn blank_username_rejected() {
        let (pool, graph) = setup().await;
        let err = register_user(&pool, &graph, "  ").await.unwrap_err();
        assert!(matches!(err, TidepoolError::Validation(_)));
    }

    #[tokio::test]
    async fn assignment_never_strips_the_private_tag() {
        let (pool, graph) = setup().await;
        let user = register_user(&pool, &graph, "alice").await.unwrap();
        create_tag(&graph, "ENG").await;

        let updated = assign_org_tags(&pool, &graph, user.id, vec!["ENG".into()])
            .await
            .unwrap();
        assert!(updated.org_tags.contains("ENG"));
        assert!(updated.org_tags.contains("PRIVATE_alice"));
    }

    #[tokio::test]
    async fn assignment_rejects_unknown_tags() {
        let (pool, graph) = setup().await;
        let user = register_user(&pool, &graph, "alice").await.unwrap();
        let err = assign_org_tags(&pool, &graph, user.id, vec!["NOPE".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, TidepoolError::NotFound(_)));
    }

    #[tokio::test]
    async fn primary_org_repaired_when_it_falls_out_of_the_set() {
        let (pool, graph) = setup().await;
        let user = register_user(&pool, &graph, "alice").await.unwrap();
        create_tag(&graph, "ENG").await;
        create_tag(&graph, "SALES").await;

        assign_org_tags(&pool, &graph, user.id, vec!["ENG".into()])
            .await
            .unwrap();
        set_primary_org(&pool, &graph, "alice", "ENG").await.unwrap();

        // ENG is dropped; primary falls back to the private tag.
        let updated = assign_org_tags(&pool, &graph, user.id, vec!["SALES".into()])
            .await
            .unwrap();
        assert_eq!(updated.primary_org.as_deref(), Some("PRIVATE_alice"));
    }

    #[tokio::test]
    async fn set_primary_requires_membership() {
        let (pool, graph) = setup().await;
        register_user(&pool, &graph, "alice").await.unwrap();
        create_tag(&graph, "ENG").await;
        let err = set_primary_org(&pool, &graph, "alice", "ENG")
            .await
            .unwrap_err();
        assert!(matches!(err, TidepoolError::Validation(_)));
    }

    #[tokio::test]
    async fn admin_bootstrap_is_idempotent() {
        let (pool, graph) = setup().await;
        let cfg = BootstrapConfig::default();
        run_admin_bootstrap(&pool, &graph, &cfg).await.unwrap();
        run_admin_bootstrap(&pool, &graph, &cfg).await.unwrap();

        let admin = get_user_by_username(&pool, "admin").await.unwrap();
        assert!(admin.is_admin);
        assert!(admin.org_tags.contains(DEFAULT_ORG_TAG));
        assert_eq!(admin.primary_org.as_deref(), Some(DEFAULT_ORG_TAG));
    }
}
