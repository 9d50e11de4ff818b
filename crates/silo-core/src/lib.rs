//! silo-core - columnar storage and bitmap query engine for biological sequence collections
//!
//! This crate provides:
//! - per-position compressed-bitmap indices over aligned sequence columns
//! - an insertion sub-index with a 3-mer pre-filter over free-text insertions
//! - a bitmap operator algebra (intersection/union/threshold/selection/...)
//! - a filter-expression compiler with algebraic simplification
//! - the query actions (aggregation, mutation-frequency, FASTA export, phylogenetic
//!   tree traversal, ...) that consume the compiled bitmaps

pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod query;

pub use config::EngineConfig;
pub use error::SiloError;
