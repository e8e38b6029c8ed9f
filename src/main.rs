//! # Tidepool CLI (`tide`)
//!
//! Thin command-line front end over the tidepool core. The HTTP layer
//! lives elsewhere; this binary exists for operations and local runs.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tide init` | Create the database and run schema migrations |
//! | `tide bootstrap` | Ensure the default tag and admin account exist |
//! | `tide worker` | Run ingestion workers until interrupted |
//! | `tide submit <path>` | Upload a file and ingest it |
//! | `tide tags …` | Tag hierarchy administration |
//! | `tide users …` | User registration and tag assignment |
//! | `tide files …` | List accessible / owned files |
//! | `tide download <hash>` | Presigned download URL for a file |
//! | `tide delete <hash>` | Delete a document and its dependent resources |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing_subscriber::EnvFilter;

use tidepool::broker::{ChannelBroker, ReliableBroker};
use tidepool::config::{load_config, Config};
use tidepool::documents;
use tidepool::models::FileStatus;
use tidepool::object_store::{FsObjectStore, ObjectStore};
use tidepool::parser;
use tidepool::pipeline::IngestionPipeline;
use tidepool::search_index::NoopSearchIndex;
use tidepool::tag_cache::{TagResolutionCache, TagResolver};
use tidepool::tags::{CreateTag, TagGraph, UpdateTag};
use tidepool::db;
use tidepool::users;

#[derive(Parser)]
#[command(name = "tide", about = "Multi-tenant knowledge base core")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "tidepool.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and run schema migrations.
    Init,
    /// Ensure the default tag and admin account exist.
    Bootstrap,
    /// Run ingestion workers until interrupted.
    Worker,
    /// Upload a file, enqueue it, and wait for the ingestion outcome.
    Submit {
        path: PathBuf,
        /// Owning user (username).
        #[arg(long)]
        owner: String,
        /// Org tag for the document; defaults to the owner's primary org.
        #[arg(long)]
        org_tag: Option<String>,
        /// Make the document visible to everyone.
        #[arg(long)]
        public: bool,
        /// Override the content type guessed from the file extension.
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Tag hierarchy administration.
    Tags {
        #[command(subcommand)]
        command: TagsCommand,
    },
    /// User registration and tag assignment.
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    /// File listings.
    Files {
        #[command(subcommand)]
        command: FilesCommand,
    },
    /// Presigned download URL for a stored file.
    Download {
        file_hash: String,
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },
    /// Delete a document and its dependent resources.
    Delete { file_hash: String },
}

#[derive(Subcommand)]
enum TagsCommand {
    Create {
        tag_id: String,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Re-parent a tag; omit --parent to make it a root.
    SetParent {
        tag_id: String,
        #[arg(long)]
        parent: Option<String>,
    },
    Rename {
        tag_id: String,
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Delete { tag_id: String },
    Tree,
    Children { tag_id: String },
    Ancestors { tag_id: String },
}

#[derive(Subcommand)]
enum UsersCommand {
    Register { username: String },
    /// Replace a user's direct tag assignments.
    Assign {
        user_id: i64,
        tags: Vec<String>,
    },
    SetPrimary { username: String, tag: String },
    Show { username: String },
}

#[derive(Subcommand)]
enum FilesCommand {
    /// Files the user may access (own, public, org-visible).
    List {
        #[arg(long)]
        user: String,
    },
    /// Files the user uploaded.
    Mine {
        #[arg(long)]
        user: String,
    },
}

struct App {
    config: Config,
    pool: SqlitePool,
    graph: Arc<TagGraph>,
    resolver: TagResolver,
    store: Arc<FsObjectStore>,
}

impl App {
    async fn build(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        db::migrate(&pool).await?;
        let cache = Arc::new(TagResolutionCache::new());
        let graph = Arc::new(TagGraph::new(pool.clone(), Arc::clone(&cache)));
        let resolver = TagResolver::new(pool.clone(), Arc::clone(&graph), cache);
        let store = Arc::new(FsObjectStore::new(
            config.storage.root.clone(),
            &config.storage.url_signing_key,
        ));
        Ok(Self {
            config,
            pool,
            graph,
            resolver,
            store,
        })
    }

    fn pipeline(&self) -> Arc<IngestionPipeline> {
        let broker = Arc::new(ChannelBroker::new(&self.config.broker));
        Arc::new(IngestionPipeline::new(
            self.pool.clone(),
            broker as Arc<dyn ReliableBroker>,
            Arc::clone(&self.store) as Arc<dyn ObjectStore>,
            self.config.chunking.clone(),
            self.config.broker.clone(),
            &self.config.ingestion,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let app = App::build(config).await?;

    match cli.command {
        Command::Init => {
            println!("database ready at {}", app.config.db.path.display());
        }
        Command::Bootstrap => {
            users::run_admin_bootstrap(&app.pool, &app.graph, &app.config.bootstrap).await?;
            println!("bootstrap complete");
        }
        Command::Worker => {
            users::run_admin_bootstrap(&app.pool, &app.graph, &app.config.bootstrap).await?;
            let pipeline = app.pipeline();
            let handles = pipeline.spawn_workers()?;
            println!("workers running on {} partitions; ctrl-c to stop", handles.len());
            tokio::signal::ctrl_c().await?;
        }
        Command::Submit {
            path,
            owner,
            org_tag,
            public,
            content_type,
        } => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let file_hash = hex::encode(Sha256::digest(&bytes));
            let content_type =
                content_type.unwrap_or_else(|| guess_content_type(&file_name).to_string());

            let user = users::get_user_by_username(&app.pool, &owner).await?;
            let org_tag = match org_tag {
                Some(t) => t,
                None => user
                    .primary_org
                    .clone()
                    .unwrap_or_else(|| tidepool::models::DEFAULT_ORG_TAG.to_string()),
            };

            app.store.put(&file_hash, &bytes).await?;

            // The in-process broker lives inside this invocation, so run
            // the workers here and wait for the outcome.
            let pipeline = app.pipeline();
            let _workers = pipeline.spawn_workers()?;
            pipeline
                .submit(
                    &file_hash,
                    &file_name,
                    &file_hash,
                    &user.username,
                    &org_tag,
                    public,
                    &content_type,
                )
                .await?;

            let outcome = wait_for_outcome(&app.pool, &file_hash, &app.config).await?;
            println!("submit {file_name}");
            println!("  file_hash: {file_hash}");
            println!("  org_tag: {org_tag}");
            println!("  status: {}", outcome.as_str());
        }
        Command::Tags { command } => run_tags(&app, command).await?,
        Command::Users { command } => run_users(&app, command).await?,
        Command::Files { command } => run_files(&app, command).await?,
        Command::Download { file_hash, ttl } => {
            let url =
                documents::download_url(&app.pool, app.store.as_ref(), &file_hash, ttl).await?;
            println!("{url}");
        }
        Command::Delete { file_hash } => {
            let outcome = documents::delete_document(
                &app.pool,
                app.store.as_ref(),
                &NoopSearchIndex,
                &file_hash,
            )
            .await?;
            if outcome.fully_succeeded() {
                println!("deleted {file_hash}");
            } else {
                println!("deleted {file_hash} with partial failures:");
                for failure in &outcome.failures {
                    println!("  {}: {}", failure.step, failure.error);
                }
            }
        }
    }

    Ok(())
}

async fn run_tags(app: &App, command: TagsCommand) -> Result<()> {
    match command {
        TagsCommand::Create {
            tag_id,
            name,
            description,
            parent,
        } => {
            let tag = app
                .graph
                .create_tag(CreateTag {
                    tag_id,
                    name,
                    description,
                    parent_tag: parent,
                })
                .await?;
            println!("created {}", tag.tag_id);
        }
        TagsCommand::SetParent { tag_id, parent } => {
            app.graph.set_parent(&tag_id, parent.as_deref()).await?;
            println!("ok");
        }
        TagsCommand::Rename {
            tag_id,
            name,
            description,
        } => {
            app.graph
                .update_tag(
                    &tag_id,
                    UpdateTag {
                        name: Some(name),
                        description,
                        parent_tag: None,
                    },
                )
                .await?;
            println!("ok");
        }
        TagsCommand::Delete { tag_id } => {
            app.graph.delete_tag(&tag_id).await?;
            println!("deleted {tag_id}");
        }
        TagsCommand::Tree => {
            let tree = app.graph.tree().await?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
        TagsCommand::Children { tag_id } => {
            for child in app.graph.children(&tag_id).await? {
                println!("{}", child.tag_id);
            }
        }
        TagsCommand::Ancestors { tag_id } => {
            for ancestor in app.graph.ancestors(&tag_id).await? {
                println!("{ancestor}");
            }
        }
    }
    Ok(())
}

async fn run_users(app: &App, command: UsersCommand) -> Result<()> {
    match command {
        UsersCommand::Register { username } => {
            let user = users::register_user(&app.pool, &app.graph, &username).await?;
            println!("registered {} (id {})", user.username, user.id);
        }
        UsersCommand::Assign { user_id, tags } => {
            let user = users::assign_org_tags(&app.pool, &app.graph, user_id, tags).await?;
            println!(
                "assigned: {}",
                tidepool::models::encode_tags(&user.org_tags)
            );
        }
        UsersCommand::SetPrimary { username, tag } => {
            users::set_primary_org(&app.pool, &app.graph, &username, &tag).await?;
            println!("ok");
        }
        UsersCommand::Show { username } => {
            let info = users::user_org_tags(&app.pool, &app.graph, &username).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }
    Ok(())
}

async fn run_files(app: &App, command: FilesCommand) -> Result<()> {
    let files = match command {
        FilesCommand::List { user } => {
            documents::accessible_files(&app.pool, &app.resolver, &user).await?
        }
        FilesCommand::Mine { user } => documents::files_owned_by(&app.pool, &user).await?,
    };
    for file in files {
        println!(
            "{}  {:14}  {:24}  {}",
            file.file_hash,
            file.status.as_str(),
            file.org_tag,
            file.file_name
        );
    }
    Ok(())
}

fn guess_content_type(file_name: &str) -> &'static str {
    match file_name.rsplit('.').next().map(str::to_ascii_lowercase) {
        Some(ext) if ext == "md" || ext == "markdown" => parser::MIME_MARKDOWN,
        Some(ext) if ext == "pdf" => parser::MIME_PDF,
        Some(ext) if ext == "docx" => parser::MIME_DOCX,
        _ => parser::MIME_TEXT,
    }
}

/// Poll the file status until ingestion settles or the retry budget (plus
/// margin) elapses.
async fn wait_for_outcome(
    pool: &SqlitePool,
    file_hash: &str,
    config: &Config,
) -> Result<FileStatus> {
    let budget = Duration::from_secs(
        config.broker.max_attempts as u64 * config.broker.retry_backoff_secs + 30,
    );
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let file = documents::get_file(pool, file_hash).await?;
        if file.status != FileStatus::Pending {
            return Ok(file.status);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(file.status);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
