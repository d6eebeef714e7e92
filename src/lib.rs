//! Crate root: module orchestration for the CAFE/trait association engine.
//!
//! - `error`: the typed error taxonomy.
//! - `bitset`: compact indexed bitmask, shared by branch sets, tip sets, and
//!   permutation samples.
//! - `tree`: tree canonicalization into a branch-indexed structure.
//! - `asr`: Mk2 ancestral-state reconstruction and foreground derivation.
//! - `family`: per-family branch-delta data model.
//! - `sampler`: constrained, topology-aware permutation sampling.
//! - `stats`: binary and rate-mode test statistics.
//! - `fisher`: Fisher-exact alternative with Tarone screening.
//! - `scheduler`: two-stage parallel permutation execution, with caching.
//! - `cache`: permutation sample cache file format.
//! - `correction`: Benjamini-Hochberg correction and ranked reporting.
//! - `config`: CLI / run configuration schema.
//! - `logging`: logger setup.
//! - `metadata`: run-metadata assembly.
//! - `io`: CAFE table, trait TSV, and output writers.

pub mod asr;
pub mod bitset;
pub mod cache;
pub mod config;
pub mod correction;
pub mod error;
pub mod family;
pub mod fisher;
pub mod io;
pub mod logging;
pub mod metadata;
pub mod sampler;
pub mod scheduler;
pub mod stats;
pub mod tree;

pub use bitset::Bitset;
pub use error::{CafeError, Result};
pub use tree::CanonicalTree;
