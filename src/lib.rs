//! # Tidepool
//!
//! Multi-tenant knowledge base core: an asynchronous, failure-tolerant
//! document ingestion pipeline coupled with a hierarchical organization-tag
//! access-control resolver. Every ingested chunk is access-tagged, and
//! every read path resolves the requester's effective tag set before
//! filtering.
//!
//! ## Architecture
//!
//! ```text
//! upload ─▶ submit ─▶ ┌────────────────┐    ┌───────────────────┐
//!                     │ ReliableBroker │───▶│ IngestionPipeline │
//!                     │ retry + DLT    │    │ fetch → extract → │
//!                     └────────────────┘    │ chunk → persist   │
//!                                           └───────────────────┘
//!
//! read ─▶ ┌──────────────┐ effective ┌────────────────────┐ miss ┌──────────┐
//!         │ AccessFilter │◀──────────│ TagResolutionCache │─────▶│ TagGraph │
//!         └──────────────┘   tags    └────────────────────┘      └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy and retry classification |
//! | [`tags`] | Organization tag forest with cycle-safe re-parenting |
//! | [`tag_cache`] | Effective-tag resolution and caching |
//! | [`users`] | Registration, private tags, assignment, bootstrap |
//! | [`access`] | Visibility filter over ingested resources |
//! | [`chunk`] | Boundary-preserving text chunking |
//! | [`broker`] | Reliable broker abstraction, retry and dead-letter plumbing |
//! | [`parser`] | Text extraction and the extraction memory guard |
//! | [`pipeline`] | Ingestion producer and consumer workers |
//! | [`documents`] | File queries and cascading deletion |
//! | [`object_store`] | Object storage collaborator |
//! | [`search_index`] | Search index collaborator |
//! | [`db`] | Database connection and schema |

pub mod access;
pub mod broker;
pub mod chunk;
pub mod config;
pub mod db;
pub mod documents;
pub mod error;
pub mod models;
pub mod object_store;
pub mod parser;
pub mod pipeline;
pub mod search_index;
pub mod tag_cache;
pub mod tags;
pub mod users;
