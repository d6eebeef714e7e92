//! Run-metadata assembler (component I).
//!
//! Collects everything an auditor would need to reproduce or sanity-check a
//! run into one JSON document, written alongside the TSV outputs.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::Config;
use crate::error::{io_err, Result};
use crate::fisher::TaroneResult;
use crate::scheduler::SchedulerStats;

#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputDigest {
    pub path: PathBuf,
    /// Hex-encoded `DefaultHasher` digest of the file's bytes. Stable within
    /// a build, sufficient to detect an input silently changing between two
    /// runs an auditor is comparing; not a cryptographic checksum.
    pub digest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraitColumnSelection {
    pub column: String,
    pub auto_detected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeFacts {
    pub n_tips: usize,
    pub n_branches: usize,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AsrFacts {
    pub q01: f64,
    pub q10: f64,
    pub log_likelihood: f64,
    pub n_fg_01: usize,
    pub n_fg_10: usize,
    pub posterior_hi: f64,
    pub posterior_lo: f64,
    pub tie_policy: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermutationFacts {
    pub n_perm_initial: usize,
    pub n_perm_refine: usize,
    pub restarts_stage1: usize,
    pub restarts_stage2: usize,
    pub fallbacks_stage1: usize,
    pub fallbacks_stage2: usize,
    pub cache_status: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaroneFacts {
    pub m_total: usize,
    pub m_testable: usize,
    pub alpha_star: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultsSummary {
    pub n_tested: usize,
    pub n_top_hits: usize,
    pub family_results_path: PathBuf,
    pub top_hits_path: PathBuf,
    pub top_pvalues_path: PathBuf,
    pub pvalue_hist_path: Option<PathBuf>,
    pub qq_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub tool: Tool,
    pub inputs: Vec<InputDigest>,
    pub parameters: Config,
    pub trait_column: TraitColumnSelection,
    pub tree: TreeFacts,
    pub asr: AsrFacts,
    pub permutation: Option<PermutationFacts>,
    pub tarone: Option<TaroneFacts>,
    pub results: ResultsSummary,
    pub warnings: Vec<String>,
}

fn digest_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| io_err(path.to_path_buf(), e))?;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    Ok(format!("{:016x}", hasher.finish()))
}

/// Builds the digest list for every input file the run actually consumed.
pub fn collect_input_digests(paths: &[&Path]) -> Result<Vec<InputDigest>> {
    paths
        .iter()
        .map(|p| {
            Ok(InputDigest {
                path: p.to_path_buf(),
                digest: digest_file(p)?,
            })
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
pub fn assemble(
    config: &Config,
    inputs: Vec<InputDigest>,
    trait_column: TraitColumnSelection,
    tree: TreeFacts,
    asr: AsrFacts,
    permutation: Option<(&PermutationFacts, &SchedulerStats)>,
    tarone: Option<TaroneResult>,
    results: ResultsSummary,
    warnings: Vec<String>,
) -> RunMetadata {
    let permutation = permutation.map(|(facts, stats)| PermutationFacts {
        cache_status: stats.cache_status.clone(),
        ..facts.clone()
    });
    let tarone = tarone.map(|t| TaroneFacts {
        m_total: t.m_total,
        m_testable: t.m_testable,
        alpha_star: t.alpha_star,
    });
    RunMetadata {
        tool: Tool { name: env!("CARGO_PKG_NAME"), version: env!("CARGO_PKG_VERSION") },
        inputs,
        parameters: config.clone(),
        trait_column,
        tree,
        asr,
        permutation,
        tarone,
        results,
        warnings,
    }
}

pub fn write(path: &Path, metadata: &RunMetadata) -> Result<()> {
    let json = serde_json::to_vec_pretty(metadata)?;
    std::fs::write(path, json).map_err(|e| io_err(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_for_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let d1 = digest_file(&file).unwrap();
        let d2 = digest_file(&file).unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn digest_differs_for_different_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"hello").unwrap();
        std::fs::write(&b, b"world").unwrap();
        assert_ne!(digest_file(&a).unwrap(), digest_file(&b).unwrap());
    }
}
