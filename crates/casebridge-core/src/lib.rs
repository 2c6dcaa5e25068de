//! # casebridge core
//!
//! Runtime-independent building blocks of the casebridge import pipeline:
//! data models, typed source records, the operator mapping document,
//! identifier maps with repository canonicalization, rich-text
//! normalization, progress counters, ETA estimation and the staging store
//! abstraction.
//!
//! This crate has no tokio, sqlx or filesystem dependencies. The SQLite
//! staging backend and the importer itself live in the `casebridge` crate.

pub mod estimate;
pub mod identifiers;
pub mod mapping;
pub mod models;
pub mod progress;
pub mod records;
pub mod richtext;
pub mod staging;
