//! Error taxonomy for the engine.
//!
//! Fatal errors (input validation, semantic CLI incompatibilities) are
//! represented here and propagate with `?`. Recoverable conditions (cache
//! mismatch, sampling-budget exhaustion, per-family absence of foreground,
//! Tarone untestability) are *not* modeled as errors: they are recorded as
//! data (a `status` field or a metadata note) so the statistical loops never
//! use exceptions for control flow.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CafeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tree file {path} contains no NEXUS TREE entry")]
    NoTreeFound { path: PathBuf },

    #[error("failed to parse tree: {0}")]
    TreeParse(String),

    #[error("duplicate canonical branch label: {0}")]
    DuplicateBranchLabel(String),

    #[error("non-root node has no label; cannot form a branch key")]
    UnlabeledBranch,

    #[error("branch '{0}' has non-finite or negative length")]
    InvalidBranchLength(String),

    #[error("branch '{0}' has length 0, which is invalid in rate mode")]
    ZeroLengthInRateMode(String),

    #[error("unknown branch key '{0}' referenced in {1}")]
    UnknownBranchKey(String, &'static str),

    #[error("species set does not match tree tip set: {0}")]
    SpeciesMismatch(String),

    #[error("missing value in trait column for species '{0}'")]
    MissingTraitValue(String),

    #[error("could not auto-detect a binary trait column; pass --trait-column")]
    AmbiguousTraitColumn,

    #[error("trait column '{0}' not found in trait table")]
    UnknownTraitColumn(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("ASR fit did not converge to finite, positive rates")]
    AsrFitFailed,

    #[error("permutation sampling exceeded the hard restart budget for family '{0}'")]
    SamplingBudgetExhausted(String),

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CafeError>;

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CafeError {
    CafeError::Io {
        path: path.into(),
        source,
    }
}
