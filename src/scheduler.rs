//! Two-stage parallel permutation scheduler (component G).
//!
//! Samples are generated in fixed-size chunks, each chunk computed
//! independently (the teacher's `compute_pairwise_*_parallel` functions in
//! `distances.rs` used the same rayon chunk-then-reduce shape for pairwise
//! distance matrices); chunks are always concatenated in index order so the
//! resulting sequence — and every downstream p-value — is identical
//! regardless of how many worker threads ran it.
//!
//! All families share one sample pool per stage (the cache file carries no
//! per-family field, per spec §6.4), generated under a fixed sampling
//! token rather than a real family id.

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;

use crate::bitset::Bitset;
use crate::cache::{self, CacheLoad, CacheMiss, Fingerprint};
use crate::error::Result;
use crate::family::Family;
use crate::sampler::{self, BinIndex, Sample};
use crate::stats::{evaluate_binary, evaluate_rate, empirical_p, Direction};
use crate::tree::CanonicalTree;

const CHUNK_SIZE: usize = 256;
/// All families are scored against the same sample pool; `sample()`'s
/// `family_id` argument is folded into the per-sample RNG seed for
/// reproducibility but carries no per-family meaning here.
const SHARED_SAMPLE_TOKEN: &str = "__shared__";

#[derive(Debug, Clone, Copy)]
pub enum Mode {
    Binary,
    Rate,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub mode: Mode,
    pub direction: Direction,
    pub restrict_to_significant: bool,
    pub seed: u64,
    pub n_perm_initial: usize,
    pub n_perm_refine: usize,
    pub refine_p_threshold: f64,
    pub include_trait_loss: bool,
    pub jobs: usize,
    pub perm_cache: Option<std::path::PathBuf>,
    /// Suppresses the stage progress bars; mirrors the CLI's `--quiet` flag.
    pub quiet: bool,
}

#[derive(Debug, Clone)]
pub struct PermFamilyResult {
    pub stat_obs: f64,
    pub p_empirical: f64,
    pub n_perm_used: usize,
    pub refined: bool,
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub restarts_stage1: usize,
    pub restarts_stage2: usize,
    pub fallbacks_stage1: usize,
    pub fallbacks_stage2: usize,
    pub cache_status: Vec<String>,
}

fn build_pool(jobs: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .map_err(|e| crate::error::CafeError::Invariant(format!("failed to build thread pool: {e}")))
}

fn generate_chunked(
    tree: &CanonicalTree,
    bin_index: &BinIndex,
    fg_01: &Bitset,
    fg_10: &Bitset,
    seed: u64,
    stage: u32,
    n: usize,
    include_trait_loss: bool,
) -> Result<(Vec<Sample>, usize, usize)> {
    let n_chunks = n.div_ceil(CHUNK_SIZE).max(1);
    let chunk_results: Result<Vec<Vec<Sample>>> = (0..n_chunks)
        .into_par_iter()
        .map(|chunk_index| {
            let start = chunk_index * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(n);
            (start..end)
                .map(|i| {
                    sampler::sample(
                        tree,
                        bin_index,
                        fg_01,
                        fg_10,
                        seed,
                        SHARED_SAMPLE_TOKEN,
                        stage,
                        i as u64,
                        include_trait_loss,
                    )
                })
                .collect::<Result<Vec<Sample>>>()
        })
        .collect();
    let chunks = chunk_results?;
    let mut restarts = 0usize;
    let mut fallbacks = 0usize;
    let mut flat = Vec::with_capacity(n);
    for chunk in chunks {
        for s in chunk {
            restarts += s.restarts;
            if s.fallback_dependent_to_independent {
                fallbacks += 1;
            }
            flat.push(s);
        }
    }
    Ok((flat, restarts, fallbacks))
}

/// Obtains `n` stage samples, trying the cache first and falling back to
/// generation; the cache is only ever skipped, never treated as an error.
fn obtain_samples(
    tree: &CanonicalTree,
    bin_index: &BinIndex,
    fg_01: &Bitset,
    fg_10: &Bitset,
    config: &ScheduleConfig,
    stage: u32,
    n: usize,
    stats: &mut SchedulerStats,
) -> Result<Vec<Sample>> {
    let fingerprint = Fingerprint {
        tree_fingerprint: tree.fingerprint,
        include_trait_loss: config.include_trait_loss,
        fg_01: fg_01.clone(),
        fg_10: fg_10.clone(),
    };

    if let Some(path) = &config.perm_cache {
        match cache::load(path, &fingerprint, stage, tree.words)? {
            CacheLoad::Hit { samples, .. } if samples.len() >= n => {
                info!("permutation cache hit for stage {stage}: {} samples", samples.len());
                return Ok(samples.into_iter().take(n).collect());
            }
            CacheLoad::Hit { samples, .. } => {
                stats.cache_status.push(format!(
                    "cache ignored: stage {stage} had {} samples, need {n}",
                    samples.len()
                ));
            }
            CacheLoad::Miss(reason) => {
                let msg = match reason {
                    CacheMiss::NotFound => "no cache file present".to_string(),
                    CacheMiss::Unreadable(e) => format!("cache unreadable: {e}"),
                    CacheMiss::FingerprintMismatch => "fingerprint mismatch".to_string(),
                };
                warn!("cache ignored: {msg}");
                stats.cache_status.push(format!("cache ignored: {msg}"));
            }
        }
    }

    let (samples, restarts, fallbacks) =
        generate_chunked(tree, bin_index, fg_01, fg_10, config.seed, stage, n, config.include_trait_loss)?;
    if stage == 1 {
        stats.restarts_stage1 = restarts;
        stats.fallbacks_stage1 = fallbacks;
    } else {
        stats.restarts_stage2 = restarts;
        stats.fallbacks_stage2 = fallbacks;
    }

    if let Some(path) = &config.perm_cache {
        cache::save(path, &fingerprint, config.seed, stage, &samples)?;
    }
    Ok(samples)
}

/// Runs the two-stage permutation procedure for every family, returning one
/// result per family in the same order as `families`.
pub fn run(
    tree: &CanonicalTree,
    families: &[Family],
    fg_01: &Bitset,
    fg_10: &Bitset,
    config: &ScheduleConfig,
) -> Result<(Vec<PermFamilyResult>, SchedulerStats)> {
    let mut stats = SchedulerStats::default();
    let bin_index = BinIndex::build(tree);
    let pool = build_pool(config.jobs)?;

    let stage1_samples = obtain_samples(tree, &bin_index, fg_01, fg_10, config, 1, config.n_perm_initial, &mut stats)?;

    let compute = |family: &Family, samples: &[Sample]| -> (f64, f64) {
        let (stat_obs, null) = match config.mode {
            Mode::Binary => evaluate_binary(tree, family, fg_01, fg_10, samples, config.direction, config.restrict_to_significant),
            Mode::Rate => evaluate_rate(family, fg_01, fg_10, samples, config.direction, config.restrict_to_significant),
        };
        let p = empirical_p(stat_obs, &null);
        (stat_obs, p)
    };

    let progress = if config.quiet { ProgressBar::hidden() } else { ProgressBar::new(families.len() as u64) };
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} families (stage 1)")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let stage1_results: Vec<(f64, f64)> = pool.install(|| {
        families
            .par_iter()
            .map(|f| {
                let r = compute(f, &stage1_samples);
                progress.inc(1);
                r
            })
            .collect()
    });
    progress.finish_and_clear();

    let needs_refine = config.n_perm_refine > config.n_perm_initial;
    let mut results = Vec::with_capacity(families.len());

    if !needs_refine {
        for (stat_obs, p) in stage1_results {
            results.push(PermFamilyResult {
                stat_obs,
                p_empirical: p,
                n_perm_used: config.n_perm_initial,
                refined: false,
            });
        }
        return Ok((results, stats));
    }

    let to_refine: Vec<usize> = stage1_results
        .iter()
        .enumerate()
        .filter(|(_, (_, p))| *p <= config.refine_p_threshold)
        .map(|(i, _)| i)
        .collect();

    if to_refine.is_empty() {
        for (stat_obs, p) in stage1_results {
            results.push(PermFamilyResult { stat_obs, p_empirical: p, n_perm_used: config.n_perm_initial, refined: false });
        }
        return Ok((results, stats));
    }

    let stage2_samples = obtain_samples(tree, &bin_index, fg_01, fg_10, config, 2, config.n_perm_refine, &mut stats)?;

    let refine_progress =
        if config.quiet { ProgressBar::hidden() } else { ProgressBar::new(to_refine.len() as u64) };
    refine_progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} families (stage 2 refine)")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let refined: std::collections::HashMap<usize, (f64, f64)> = pool.install(|| {
        to_refine
            .par_iter()
            .map(|&i| {
                let r = (i, compute(&families[i], &stage2_samples));
                refine_progress.inc(1);
                r
            })
            .collect()
    });
    refine_progress.finish_and_clear();

    for (i, (stat_obs, p)) in stage1_results.into_iter().enumerate() {
        if let Some(&(r_stat, r_p)) = refined.get(&i) {
            results.push(PermFamilyResult { stat_obs: r_stat, p_empirical: r_p, n_perm_used: config.n_perm_refine, refined: true });
        } else {
            results.push(PermFamilyResult { stat_obs, p_empirical: p, n_perm_used: config.n_perm_initial, refined: false });
        }
    }

    Ok((results, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{CanonicalTree, LengthPolicy};
    use phylotree::tree::Tree as PhyloTree;

    fn toy_tree() -> CanonicalTree {
        let newick = "((A:1,B:1)AB:1,C:1)root:0;";
        let phylo = PhyloTree::from_newick(newick).unwrap();
        CanonicalTree::from_phylotree(&phylo, LengthPolicy::NonNegative).unwrap()
    }

    fn toy_config(n_initial: usize, n_refine: usize) -> ScheduleConfig {
        ScheduleConfig {
            mode: Mode::Binary,
            direction: Direction::Gain,
            restrict_to_significant: false,
            seed: 7,
            n_perm_initial: n_initial,
            n_perm_refine: n_refine,
            refine_p_threshold: 0.01,
            include_trait_loss: false,
            jobs: 1,
            perm_cache: None,
            quiet: true,
        }
    }

    #[test]
    fn run_is_deterministic_across_job_counts() {
        let tree = toy_tree();
        let a = tree.branch_index["A"];
        let mut deltas = vec![0i64; tree.n_branches];
        deltas[a] = 2;
        let fam = Family::new("f1".into(), &tree, &deltas, false);
        let fg_01 = Bitset::from_indices(tree.words, [a]);
        let fg_10 = Bitset::zeros(tree.words);

        let mut cfg1 = toy_config(30, 30);
        cfg1.jobs = 1;
        let mut cfg4 = toy_config(30, 30);
        cfg4.jobs = 4;

        let (r1, _) = run(&tree, &[fam.clone()], &fg_01, &fg_10, &cfg1).unwrap();
        let (r4, _) = run(&tree, &[fam], &fg_01, &fg_10, &cfg4).unwrap();

        assert_eq!(r1[0].stat_obs, r4[0].stat_obs);
        assert_eq!(r1[0].p_empirical, r4[0].p_empirical);
    }

    #[test]
    fn refine_is_noop_when_refine_le_initial() {
        let tree = toy_tree();
        let a = tree.branch_index["A"];
        let mut deltas = vec![0i64; tree.n_branches];
        deltas[a] = 2;
        let fam = Family::new("f1".into(), &tree, &deltas, false);
        let fg_01 = Bitset::from_indices(tree.words, [a]);
        let fg_10 = Bitset::zeros(tree.words);

        let cfg = toy_config(20, 10);
        let (results, _) = run(&tree, &[fam], &fg_01, &fg_10, &cfg).unwrap();
        assert!(!results[0].refined);
    }
}
