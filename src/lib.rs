//! # casebridge
//!
//! Bulk migration engine for test-management export bundles.
//!
//! A job moves a bundle through three stages: the analyzer streams it into
//! staging, the resolver settles reference entities from the operator's
//! mapping configuration, and the importer runs one transformer per entity
//! type in dependency order.
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌──────────────┐
//! │  Bundle  │──▶│ Analyzer  │──▶│  Staging   │──▶│   Importer   │
//! │  (JSON)  │   │ (stream)  │   │  (SQLite)  │   │ (chunked tx) │
//! └──────────┘   └───────────┘   └────────────┘   └──────┬───────┘
//!                                                        ▼
//!                                                 ┌──────────────┐
//!                                                 │ Target model │
//!                                                 └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`jobs`] | Job records, status contract and activity log |
//! | [`analyzer`] | Streaming bundle analysis into staging |
//! | [`sqlite_staging`] | SQLite staging backend |
//! | [`resolver`] | Reference-entity resolution from the mapping |
//! | [`context`] | Job-scoped import state |
//! | [`coerce`] | Value coercion for target columns |
//! | [`transform`] | Per-entity transformers and the chunk pipeline |
//! | [`importer`] | Dependency-ordered import of a job |
//! | [`reindex`] | Downstream search reindex signal |
//! | [`worker`] | Job entry points and lifecycle transitions |
//! | [`progress`] | CLI progress reporting |
//! | [`status`] | Status and dataset overviews |

pub mod analyzer;
pub mod coerce;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod importer;
pub mod jobs;
pub mod migrate;
pub mod progress;
pub mod reindex;
pub mod resolver;
pub mod sqlite_staging;
pub mod status;
pub mod transform;
pub mod worker;
