//! Claims synchronization pipeline.
//!
//! Keeps an institutional corpus in sync with an external identity
//! registry: a reconciliation engine diffs registry profiles against an
//! append-only claims log, and a supervised chain of worker stages
//! enriches each claim, fuzzy-matches it to an author position, and hands
//! the updated document off for reindexing.

pub mod bus;
pub mod config;
pub mod error;
pub mod identity;
pub mod importer;
pub mod matcher;
pub mod models;
pub mod registry;
pub mod stage;
pub mod stages;
pub mod store;
pub mod supervisor;
