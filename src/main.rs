//! Binary entry point: wires the CLI config through tree canonicalization,
//! ASR, family loading, and the test path the config selects, then writes
//! the TSV/JSON artifacts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use cafe_trait_assoc::asr::{self, PosteriorThresholds};
use cafe_trait_assoc::bitset::Bitset;
use cafe_trait_assoc::config::{BinaryTestArg, Config, ModeArg};
use cafe_trait_assoc::correction::{self, PermRankRow, PrimaryRankRow, TaroneRankRow};
use cafe_trait_assoc::error::CafeError;
use cafe_trait_assoc::family;
use cafe_trait_assoc::fisher::{self, LnFactCache, TaroneResult};
use cafe_trait_assoc::io;
use cafe_trait_assoc::logging;
use cafe_trait_assoc::metadata::{
    self, AsrFacts, InputDigest, PermutationFacts, ResultsSummary, TraitColumnSelection, TreeFacts,
};
use cafe_trait_assoc::scheduler::{self, Mode as SchedMode, ScheduleConfig, SchedulerStats};
use cafe_trait_assoc::stats::{self, Direction};
use cafe_trait_assoc::tree::{CanonicalTree, LengthPolicy};

fn main() {
    let config = Config::parse();
    let log_path = PathBuf::from(format!("{}.log", config.out_prefix.to_string_lossy()));
    logging::init(config.quiet, &log_path);

    if let Err(e) = run(&config) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// Extra per-family fields emitted only on the Fisher-Tarone path (§4.F).
#[derive(Debug, Clone, Copy)]
struct FisherFields {
    a_fg_concordant: u64,
    n_pop: u64,
    k_succ: u64,
    n_draw: u64,
    p_min_attainable: f64,
}

/// Extra per-family fields emitted only in rate mode (§4.E/§8 S6).
#[derive(Debug, Clone, Copy, Default)]
struct RateFields {
    fg_median_signed_rate: Option<f64>,
    bg_mean_signed_rate: Option<f64>,
}

struct FamilyRow {
    family_id: String,
    stat_obs: f64,
    p_primary: Option<f64>,
    p_adjusted: Option<f64>,
    n_perm_used: Option<usize>,
    refined: bool,
    status: &'static str,
    rate: RateFields,
    fisher: Option<FisherFields>,
}

fn run(config: &Config) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;

    let length_policy = if config.mode == ModeArg::Rate {
        LengthPolicy::StrictlyPositive
    } else {
        LengthPolicy::NonNegative
    };
    info!("reading tree from {:?}", config.tree_file);
    let tree = CanonicalTree::from_nexus_file(&config.tree_file, length_policy)
        .with_context(|| format!("reading tree file {:?}", config.tree_file))?;

    info!("reading trait table from {:?}", config.trait_tsv);
    let trait_table = io::read_trait_tsv(&config.trait_tsv, config.trait_column.as_deref())
        .with_context(|| format!("reading trait table {:?}", config.trait_tsv))?;

    let tip_species = tree.tip_species_set();
    let trait_species: std::collections::HashSet<String> = trait_table.values.keys().cloned().collect();
    if tip_species != trait_species {
        Err(CafeError::SpeciesMismatch(format!(
            "tree has {} tips, trait table has {} species",
            tip_species.len(),
            trait_species.len()
        )))?;
    }
    let trait_by_species: HashMap<String, u8> =
        trait_table.values.iter().map(|(k, &v)| (k.clone(), v as u8)).collect();

    let thresholds = PosteriorThresholds { hi: config.asr_posterior_hi, lo: config.asr_posterior_lo };
    info!("fitting Mk2 ancestral-state reconstruction");
    let asr_result = asr::reconstruct(&tree, &trait_by_species, thresholds, config.include_trait_loss)
        .context("ancestral-state reconstruction")?;
    info!(
        "fitted q01={:.5} q10={:.5}, |fg_01|={} |fg_10|={}",
        asr_result.q01, asr_result.q10, asr_result.k01, asr_result.k10
    );

    let change_table_path = config.cafe_dir.join("change_table.tsv");
    info!("reading CAFE change table from {:?}", change_table_path);
    let change_rows = io::read_cafe_change_table(&change_table_path)
        .with_context(|| format!("reading CAFE change table {change_table_path:?}"))?;
    let rate_mode = config.mode == ModeArg::Rate;
    let mut families = family::build_families(&tree, &change_rows, rate_mode).context("building per-family data")?;

    let mut input_paths = vec![config.tree_file.clone(), config.trait_tsv.clone(), change_table_path.clone()];

    if config.cafe_significant_only {
        let prob_table_path = config.cafe_dir.join("branch_probabilities.tsv");
        info!("reading CAFE branch-probability table from {:?}", prob_table_path);
        let prob_rows = io::read_cafe_probability_table(&prob_table_path)
            .with_context(|| format!("reading CAFE branch-probability table {prob_table_path:?}"))?;
        input_paths.push(prob_table_path.clone());
        let prob_by_family: HashMap<&String, &HashMap<String, f64>> =
            prob_rows.iter().map(|(id, m)| (id, m)).collect();
        for fam in families.iter_mut() {
            let mut mask = Bitset::zeros(tree.words);
            if let Some(probs) = prob_by_family.get(&fam.family_id) {
                for (key, &p) in probs.iter() {
                    if tree.is_root_label(key) {
                        continue;
                    }
                    let b = tree.require_branch(key, "CAFE branch-probability table")?;
                    if p <= config.cafe_alpha {
                        mask.set(b);
                    }
                }
            }
            fam.set_cafe_significant(mask);
        }
    }

    let no_foreground = asr_result.fg.is_empty();
    let mut warnings = Vec::new();
    if config.make_plots {
        warnings.push("PDF plotting was requested but is not available in this build".to_string());
    }

    let (rows, permutation_facts, tarone_fact, scheduler_stats) = if no_foreground {
        warn!("no foreground branches under current thresholds; all families marked no_valid_foreground");
        let rows: Vec<FamilyRow> = families
            .iter()
            .map(|f| FamilyRow {
                family_id: f.family_id.clone(),
                stat_obs: 0.0,
                p_primary: None,
                p_adjusted: None,
                n_perm_used: None,
                refined: false,
                status: "no_valid_foreground",
                rate: RateFields::default(),
                fisher: None,
            })
            .collect();
        (rows, None, None, None)
    } else if config.uses_permutation_path() {
        let sched_mode = match config.mode {
            ModeArg::Binary => SchedMode::Binary,
            ModeArg::Rate => SchedMode::Rate,
        };
        let sched_config = ScheduleConfig {
            mode: sched_mode,
            direction: Direction::from(config.direction),
            restrict_to_significant: config.cafe_significant_only,
            seed: config.seed,
            n_perm_initial: config.n_perm_initial,
            n_perm_refine: config.n_perm_refine,
            refine_p_threshold: config.refine_p_threshold,
            include_trait_loss: config.include_trait_loss,
            jobs: config.jobs,
            perm_cache: config.perm_cache.clone(),
            quiet: config.quiet,
        };
        info!("running permutation test over {} families", families.len());
        let (perm_results, stats_out) =
            scheduler::run(&tree, &families, &asr_result.fg_01, &asr_result.fg_10, &sched_config)
                .context("permutation scheduler")?;

        let pvals: Vec<f64> = perm_results.iter().map(|r| r.p_empirical).collect();
        let qvals = correction::bh_qvalues(&pvals);

        let rows: Vec<FamilyRow> = families
            .iter()
            .zip(perm_results.iter())
            .zip(qvals.iter())
            .map(|((f, r), &q)| {
                let rate = if rate_mode {
                    RateFields {
                        fg_median_signed_rate: stats::rate_statistic_median(
                            f,
                            stats::foreground_split(&asr_result.fg_01, &asr_result.fg_10),
                            config.direction.into(),
                            false,
                        ),
                        bg_mean_signed_rate: stats::rate_statistic_background_mean(
                            f,
                            &asr_result.fg_01,
                            &asr_result.fg_10,
                            tree.n_branches,
                            config.direction.into(),
                        ),
                    }
                } else {
                    RateFields::default()
                };
                FamilyRow {
                    family_id: f.family_id.clone(),
                    stat_obs: r.stat_obs,
                    p_primary: Some(r.p_empirical),
                    p_adjusted: Some(q),
                    n_perm_used: Some(r.n_perm_used),
                    refined: r.refined,
                    status: "ok",
                    rate,
                    fisher: None,
                }
            })
            .collect();

        let facts = PermutationFacts {
            n_perm_initial: config.n_perm_initial,
            n_perm_refine: config.n_perm_refine,
            restarts_stage1: stats_out.restarts_stage1,
            restarts_stage2: stats_out.restarts_stage2,
            fallbacks_stage1: stats_out.fallbacks_stage1,
            fallbacks_stage2: stats_out.fallbacks_stage2,
            cache_status: stats_out.cache_status.clone(),
        };
        (rows, Some(facts), None, Some(stats_out))
    } else {
        info!("running Fisher-exact + Tarone screening over {} families", families.len());
        let cache = LnFactCache::build(tree.n_branches + 1);
        let fisher_results: Vec<fisher::FisherResult> = families
            .iter()
            .map(|f| {
                fisher::fisher_for_family(
                    &tree,
                    f,
                    &asr_result.fg_01,
                    &asr_result.fg_10,
                    Direction::from(config.direction),
                    config.cafe_significant_only,
                    &cache,
                )
            })
            .collect();

        let mut order: Vec<usize> = (0..families.len()).collect();
        order.sort_by(|&a, &b| {
            fisher_results[a].p_min_attainable.partial_cmp(&fisher_results[b].p_min_attainable).unwrap()
        });
        let p_min_sorted: Vec<f64> = order.iter().map(|&i| fisher_results[i].p_min_attainable).collect();
        let tarone = fisher::tarone_screen(&p_min_sorted, config.fwer_alpha);

        let rows: Vec<FamilyRow> = families
            .iter()
            .zip(fisher_results.iter())
            .map(|(f, r)| {
                let fisher_fields = FisherFields {
                    a_fg_concordant: r.a_fg_concordant,
                    n_pop: r.n_pop,
                    k_succ: r.k_succ,
                    n_draw: r.n_draw,
                    p_min_attainable: r.p_min_attainable,
                };
                let testable = r.p_min_attainable <= tarone.alpha_star;
                if testable {
                    let p_adj = fisher::tarone_bonferroni(r.p_fisher, tarone.m_testable);
                    FamilyRow {
                        family_id: f.family_id.clone(),
                        stat_obs: r.a_fg_concordant as f64,
                        p_primary: Some(r.p_fisher),
                        p_adjusted: Some(p_adj),
                        n_perm_used: None,
                        refined: false,
                        status: "ok",
                        rate: RateFields::default(),
                        fisher: Some(fisher_fields),
                    }
                } else {
                    FamilyRow {
                        family_id: f.family_id.clone(),
                        stat_obs: r.a_fg_concordant as f64,
                        p_primary: None,
                        p_adjusted: None,
                        n_perm_used: None,
                        refined: false,
                        status: "untestable_tarone",
                        rate: RateFields::default(),
                        fisher: Some(fisher_fields),
                    }
                }
            })
            .collect();
        (rows, None, Some(tarone), None)
    };

    // A family whose CAFE-significance mask eliminates every foreground
    // branch has no local foreground to test even though the run as a whole
    // does; treat it the same as the global no-foreground case (spec's
    // "open question" on this is resolved in DESIGN.md).
    let mut rows = rows;
    if !no_foreground && config.cafe_significant_only {
        for (row, fam) in rows.iter_mut().zip(families.iter()) {
            let local_fg = fam.restrict_to_significant(&asr_result.fg);
            if local_fg.is_empty() {
                row.stat_obs = 0.0;
                row.p_primary = None;
                row.p_adjusted = None;
                row.n_perm_used = None;
                row.refined = false;
                row.status = "no_valid_foreground";
                row.rate = RateFields::default();
                row.fisher = None;
            }
        }
    }

    write_outputs(
        config,
        &tree,
        &rows,
        warnings,
        &input_paths,
        permutation_facts,
        tarone_fact,
        scheduler_stats,
        &trait_table,
        &asr_result,
    )
    .context("writing output artifacts")?;

    info!("done");
    Ok(())
}

/// The `family_results.tsv` column layout is mode-dependent (spec §6.3):
/// rate mode reports signed-rate fields in place of the raw concordance
/// count, and the Fisher-Tarone path reports its 2x2 table and
/// `p_min_attainable` in place of the permutation-only fields.
enum Layout {
    BinaryPermutation,
    Rate,
    FisherTarone,
}

fn layout_for(config: &Config) -> Layout {
    if config.mode == ModeArg::Rate {
        Layout::Rate
    } else if config.binary_test == BinaryTestArg::FisherTarone {
        Layout::FisherTarone
    } else {
        Layout::BinaryPermutation
    }
}

fn header_for(layout: &Layout) -> &'static [&'static str] {
    match layout {
        Layout::BinaryPermutation => {
            &["family_id", "stat_obs", "p_primary", "p_adjusted", "n_perm_used", "refined", "status"]
        }
        Layout::Rate => &[
            "family_id",
            "fg_mean_signed_rate",
            "fg_median_signed_rate",
            "bg_mean_signed_rate",
            "p_primary",
            "p_adjusted",
            "n_perm_used",
            "refined",
            "status",
        ],
        Layout::FisherTarone => &[
            "family_id",
            "stat_obs",
            "p_primary",
            "p_adjusted",
            "status",
            "a_fg_concordant",
            "n_pop",
            "k_succ",
            "n_draw",
            "p_min_attainable",
        ],
    }
}

fn na(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.6}")).unwrap_or_else(|| "NA".to_string())
}

fn format_row(r: &FamilyRow, layout: &Layout) -> Vec<String> {
    match layout {
        Layout::BinaryPermutation => vec![
            r.family_id.clone(),
            format!("{:.6}", r.stat_obs),
            na(r.p_primary),
            na(r.p_adjusted),
            r.n_perm_used.map(|n| n.to_string()).unwrap_or_else(|| "NA".to_string()),
            r.refined.to_string(),
            r.status.to_string(),
        ],
        Layout::Rate => vec![
            r.family_id.clone(),
            format!("{:.6}", r.stat_obs),
            na(r.rate.fg_median_signed_rate),
            na(r.rate.bg_mean_signed_rate),
            na(r.p_primary),
            na(r.p_adjusted),
            r.n_perm_used.map(|n| n.to_string()).unwrap_or_else(|| "NA".to_string()),
            r.refined.to_string(),
            r.status.to_string(),
        ],
        Layout::FisherTarone => {
            let f = r.fisher;
            vec![
                r.family_id.clone(),
                format!("{:.6}", r.stat_obs),
                na(r.p_primary),
                na(r.p_adjusted),
                r.status.to_string(),
                f.map(|x| x.a_fg_concordant.to_string()).unwrap_or_else(|| "NA".to_string()),
                f.map(|x| x.n_pop.to_string()).unwrap_or_else(|| "NA".to_string()),
                f.map(|x| x.k_succ.to_string()).unwrap_or_else(|| "NA".to_string()),
                f.map(|x| x.n_draw.to_string()).unwrap_or_else(|| "NA".to_string()),
                f.map(|x| format!("{:.6}", x.p_min_attainable)).unwrap_or_else(|| "NA".to_string()),
            ]
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_outputs(
    config: &Config,
    tree: &CanonicalTree,
    rows: &[FamilyRow],
    warnings: Vec<String>,
    input_paths: &[PathBuf],
    permutation_facts: Option<PermutationFacts>,
    tarone_fact: Option<TaroneResult>,
    scheduler_stats: Option<SchedulerStats>,
    trait_table: &io::TraitTable,
    asr_result: &asr::AsrResult,
) -> anyhow::Result<()> {
    let prefix = config.out_prefix.to_string_lossy().to_string();
    let family_results_path = PathBuf::from(format!("{prefix}.family_results.tsv"));
    let top_hits_path = PathBuf::from(format!("{prefix}.top_hits.tsv"));
    let top_pvalues_path = PathBuf::from(format!("{prefix}.top_pvalues.tsv"));
    let run_metadata_path = PathBuf::from(format!("{prefix}.run_metadata.json"));

    let layout = layout_for(config);
    let header = header_for(&layout);
    let formatted: Vec<Vec<String>> = rows.iter().map(|r| format_row(r, &layout)).collect();
    io::write_tsv(&family_results_path, header, &formatted)?;

    let defined_primary: Vec<f64> = rows.iter().filter_map(|r| r.p_primary).collect();

    let top_hits_indices: Vec<usize> = if config.uses_permutation_path() {
        let perm_rows: Vec<PermRankRow> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                Some(PermRankRow { index: i, q_bh: r.p_adjusted?, p_empirical: r.p_primary?, stat_obs: r.stat_obs })
            })
            .collect();
        correction::top_hits_permutation(&perm_rows, config.qvalue_threshold)
    } else {
        let tarone_rows: Vec<TaroneRankRow> = rows
            .iter()
            .enumerate()
            .map(|(i, r)| TaroneRankRow {
                index: i,
                reject_tarone: r.status == "ok" && r.p_adjusted.is_some_and(|p| p <= config.fwer_alpha),
                p_bonf_tarone: r.p_adjusted.unwrap_or(1.0),
                p_fisher: r.p_primary.unwrap_or(1.0),
                stat_obs: r.stat_obs,
            })
            .collect();
        correction::top_hits_tarone(&tarone_rows)
    };
    let top_hits_rows: Vec<Vec<String>> = top_hits_indices.iter().map(|&i| formatted[i].clone()).collect();
    io::write_tsv(&top_hits_path, header, &top_hits_rows)?;

    let primary_rows: Vec<PrimaryRankRow> = rows
        .iter()
        .enumerate()
        .filter_map(|(i, r)| {
            Some(PrimaryRankRow { index: i, p_primary: r.p_primary?, p_adjusted: r.p_adjusted.unwrap_or(1.0), stat_obs: r.stat_obs })
        })
        .collect();
    let top_p_indices = correction::top_pvalues(&primary_rows, config.pvalue_top_n);
    let top_p_rows: Vec<Vec<String>> = top_p_indices.iter().map(|&i| formatted[i].clone()).collect();
    io::write_tsv(&top_pvalues_path, header, &top_p_rows)?;

    let (pvalue_hist_path, qq_path) = if defined_primary.is_empty() {
        (None, None)
    } else {
        let hist_path = PathBuf::from(format!("{prefix}.pvalue_hist.tsv"));
        let qq_path = PathBuf::from(format!("{prefix}.qq.tsv"));
        let counts = correction::pvalue_histogram(&defined_primary, config.hist_bins);
        io::write_histogram_tsv(&hist_path, &counts, config.hist_bins)?;
        let qq_rows = correction::qq_table(&defined_primary);
        io::write_qq_tsv(&qq_path, &qq_rows)?;
        (Some(hist_path), Some(qq_path))
    };

    let existing: Vec<&Path> = input_paths.iter().map(|p| p.as_path()).filter(|p| p.exists()).collect();
    let input_digests: Vec<InputDigest> = metadata::collect_input_digests(&existing)?;

    let asr_facts = AsrFacts {
        q01: asr_result.q01,
        q10: asr_result.q10,
        log_likelihood: asr_result.log_likelihood,
        n_fg_01: asr_result.k01,
        n_fg_10: asr_result.k10,
        posterior_hi: config.asr_posterior_hi,
        posterior_lo: config.asr_posterior_lo,
        tie_policy: "inclusive >=/<= at posterior_hi/posterior_lo; lo == hi forces every branch ambiguous",
    };
    let tree_facts =
        TreeFacts { n_tips: tree.n_tips, n_branches: tree.n_branches, fingerprint: format!("{:016x}", tree.fingerprint) };
    let trait_column =
        TraitColumnSelection { column: trait_table.trait_column.clone(), auto_detected: trait_table.trait_column_auto_detected };
    let results_summary = ResultsSummary {
        n_tested: rows.iter().filter(|r| r.status == "ok").count(),
        n_top_hits: top_hits_indices.len(),
        family_results_path: family_results_path.clone(),
        top_hits_path: top_hits_path.clone(),
        top_pvalues_path: top_pvalues_path.clone(),
        pvalue_hist_path,
        qq_path,
    };

    let perm_ref = permutation_facts.as_ref().zip(scheduler_stats.as_ref());
    let metadata_doc = metadata::assemble(
        config,
        input_digests,
        trait_column,
        tree_facts,
        asr_facts,
        perm_ref,
        tarone_fact,
        results_summary,
        warnings,
    );
    metadata::write(&run_metadata_path, &metadata_doc)?;

    info!("wrote {:?}", family_results_path);
    Ok(())
}
