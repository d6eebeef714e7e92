//! Fisher exact test with Tarone screening (component F), the alternative
//! to the permutation path in binary mode.
//!
//! The hypergeometric tail probabilities are computed in log-space from a
//! cached log-factorial table, the same numerical discipline the ASR
//! pruning (`asr.rs`) uses for its transition-matrix algebra.

use crate::family::Family;
use crate::stats::Direction;
use crate::tree::CanonicalTree;

/// Cumulative `ln(k!)` table, built once per run and reused for every
/// family's contingency table (branch counts are bounded by tree size).
pub struct LnFactCache {
    table: Vec<f64>,
}

impl LnFactCache {
    pub fn build(max_n: usize) -> Self {
        let mut table = Vec::with_capacity(max_n + 1);
        table.push(0.0);
        let mut acc = 0.0;
        for k in 1..=max_n {
            acc += (k as f64).ln();
            table.push(acc);
        }
        LnFactCache { table }
    }

    fn ln_fact(&self, n: u64) -> f64 {
        self.table[n as usize]
    }

    fn ln_choose(&self, n: u64, k: u64) -> f64 {
        if k > n {
            return f64::NEG_INFINITY;
        }
        self.ln_fact(n) - self.ln_fact(k) - self.ln_fact(n - k)
    }

    /// `ln P(X = a)` for `X ~ Hypergeometric(population N, successes K, draws n)`.
    fn ln_pmf(&self, n_pop: u64, k_succ: u64, n_draw: u64, a: u64) -> f64 {
        self.ln_choose(k_succ, a) + self.ln_choose(n_pop - k_succ, n_draw - a) - self.ln_choose(n_pop, n_draw)
    }

    /// One-sided `P(X >= a)` for enrichment of successes in the draw.
    fn sf(&self, n_pop: u64, k_succ: u64, n_draw: u64, a: u64) -> f64 {
        let hi = n_draw.min(k_succ);
        if a > hi {
            return 0.0;
        }
        let mut terms = Vec::with_capacity((hi - a + 1) as usize);
        for x in a..=hi {
            terms.push(self.ln_pmf(n_pop, k_succ, n_draw, x));
        }
        crate::asr::logsumexp(&terms).exp()
    }
}

/// A family's 2x2 contingency table (foreground vs background) x
/// (concordant vs not), plus the one-sided p-values derived from it.
#[derive(Debug, Clone, Copy)]
pub struct FisherResult {
    pub a_fg_concordant: u64,
    pub n_pop: u64,
    pub k_succ: u64,
    pub n_draw: u64,
    pub p_fisher: f64,
    pub p_min_attainable: f64,
}

/// Builds the contingency table and one-sided hypergeometric p for a single
/// family, testing enrichment of concordant branches in the foreground.
///
/// Concordance here uses only the primary direction's sign mask (`pos_mask`
/// for gain, `neg_mask` for loss) applied tree-wide: background branches
/// carry no ASR-assigned transition type to split by `01`/`10`, so the
/// richer split definition used by the permutation path (`stats::
/// binary_statistic`) doesn't carry over cleanly to a population-wide
/// count. This keeps the contingency table well-formed (`a <= k_succ`,
/// `a <= n_draw` by construction).
pub fn fisher_for_family(
    tree: &CanonicalTree,
    family: &Family,
    fg_01: &crate::bitset::Bitset,
    fg_10: &crate::bitset::Bitset,
    direction: Direction,
    restrict_to_significant: bool,
    cache: &LnFactCache,
) -> FisherResult {
    let n_pop = tree.n_branches as u64;
    let mut fg_all = fg_01.clone();
    fg_all.or_assign(fg_10);
    let n_draw = fg_all.count_ones() as u64;

    let concordant_mask = match direction {
        Direction::Gain => &family.pos_mask,
        Direction::Loss => &family.neg_mask,
    };
    let concordant_mask = if restrict_to_significant {
        family.restrict_to_significant(concordant_mask)
    } else {
        concordant_mask.clone()
    };

    let k_succ = concordant_mask.count_ones() as u64;
    let a = fg_all.intersection(&concordant_mask).count_ones() as u64;

    let p_fisher = cache.sf(n_pop, k_succ, n_draw, a);
    let max_a = n_draw.min(k_succ);
    let p_min_attainable = cache.sf(n_pop, k_succ, n_draw, max_a);

    FisherResult {
        a_fg_concordant: a,
        n_pop,
        k_succ,
        n_draw,
        p_fisher,
        p_min_attainable,
    }
}

/// Tarone screening outcome: `m_testable` families and the threshold used
/// to determine testability, per the standard Tarone (1990) construction
/// `m_testable = max{k : p_(k) <= alpha/k}`, `alpha* = alpha/m_testable`.
#[derive(Debug, Clone, Copy)]
pub struct TaroneResult {
    pub alpha_star: f64,
    pub m_testable: usize,
    pub m_total: usize,
}

/// Runs Tarone screening over a family's sorted-ascending `p_min_attainable`
/// values. Returns the threshold and testable count; callers compare each
/// family's own `p_min_attainable` against `alpha_star` to decide
/// `untestable_tarone`.
pub fn tarone_screen(p_min_sorted_asc: &[f64], fwer_alpha: f64) -> TaroneResult {
    let m = p_min_sorted_asc.len();
    if m == 0 {
        return TaroneResult { alpha_star: fwer_alpha, m_testable: 0, m_total: 0 };
    }
    for k in (1..=m).rev() {
        let alpha_k = fwer_alpha / k as f64;
        if p_min_sorted_asc[k - 1] <= alpha_k {
            let m_testable = p_min_sorted_asc.iter().filter(|&&p| p <= alpha_k).count();
            return TaroneResult { alpha_star: alpha_k, m_testable, m_total: m };
        }
    }
    TaroneResult { alpha_star: 0.0, m_testable: 0, m_total: m }
}

/// Tarone-Bonferroni adjusted p-value for a testable family.
pub fn tarone_bonferroni(p_fisher: f64, m_testable: usize) -> f64 {
    (p_fisher * m_testable as f64).min(1.0)
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

    #[test]
    fn ln_fact_cache_matches_small_values() {
        let cache = LnFactCache::build(10);
        assert!((cache.ln_fact(0) - 0.0).abs() < 1e-9);
        assert!((cache.ln_fact(3) - 6f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn sf_at_zero_is_one() {
        let cache = LnFactCache::build(20);
        let p = cache.sf(10, 4, 5, 0);
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fisher_for_family_all_concordant_gives_minimal_p() {
        let tree = toy_tree();
        let mut deltas = vec![0i64; tree.n_branches];
        for b in 0..tree.n_branches {
            deltas[b] = 1;
        }
        let fam = Family::new("f1".into(), &tree, &deltas, false);
        let a = tree.branch_index["A"];
        let fg_01 = crate::bitset::Bitset::from_indices(tree.words, [a]);
        let fg_10 = crate::bitset::Bitset::zeros(tree.words);
        let cache = LnFactCache::build(tree.n_branches + 1);
        let res = fisher_for_family(&tree, &fam, &fg_01, &fg_10, Direction::Gain, false, &cache);
        assert_eq!(res.a_fg_concordant, 1);
        assert!((res.p_fisher - 1.0).abs() < 1e-9);
    }

    #[test]
    fn tarone_screen_marks_flat_margins_untestable() {
        // A family whose p_min_attainable is exactly 1 (fixed margins force
        // full concordance) should be screened out regardless of fwer_alpha.
        let p_min = vec![0.01, 1.0];
        let res = tarone_screen(&p_min, 0.05);
        assert!(res.m_testable <= 2);
        assert!(p_min[1] > res.alpha_star);
    }

    #[test]
    fn tarone_bonferroni_clips_to_one() {
        assert_eq!(tarone_bonferroni(0.9, 5), 1.0);
        assert_eq!(tarone_bonferroni(0.01, 2), 0.02);
    }
}
