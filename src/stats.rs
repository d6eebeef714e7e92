//! Test statistics (component E).
//!
//! Binary-mode directional concordance and rate-mode signed-rate contrast,
//! evaluated identically over the observed foreground and every permutation
//! sample so the null distribution is exactly comparable to the observed
//! value.

use crate::bitset::Bitset;
use crate::family::Family;
use crate::sampler::Sample;
use crate::tree::CanonicalTree;

/// Sign convention under test; `Loss` reverses which sign of `delta`/`rate`
/// counts as concordant with a trait transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Gain,
    Loss,
}

/// A branch set split by mark type, shared shape between the observed
/// foreground and a permutation sample.
#[derive(Debug, Clone, Copy)]
pub struct MarkSplit<'a> {
    pub m01: &'a Bitset,
    pub m10: &'a Bitset,
}

impl<'a> From<&'a Sample> for MarkSplit<'a> {
    fn from(s: &'a Sample) -> Self {
        MarkSplit { m01: &s.s01, m10: &s.s10 }
    }
}

/// Counts branches in `m01 ∪ m10` concordant with `direction`, optionally
/// restricted to a CAFE-significance mask.
///
/// `d = gain`: concordant if in `m01 ∩ pos_mask` or `m10 ∩ neg_mask`.
/// `d = loss`: signs reversed.
pub fn binary_statistic(
    family: &Family,
    split: MarkSplit<'_>,
    direction: Direction,
    restrict_to_significant: bool,
) -> u64 {
    let (gain_mask, loss_mask) = (&family.pos_mask, &family.neg_mask);
    let (primary_mask, secondary_mask) = match direction {
        Direction::Gain => (gain_mask, loss_mask),
        Direction::Loss => (loss_mask, gain_mask),
    };

    let concordant_01 = split.m01.intersection(primary_mask);
    let concordant_10 = split.m10.intersection(secondary_mask);
    let mut concordant = concordant_01;
    concordant.or_assign(&concordant_10);

    let concordant = if restrict_to_significant {
        family.restrict_to_significant(&concordant)
    } else {
        concordant
    };
    concordant.count_ones() as u64
}

/// Mean of signed per-branch rates over `m01 ∪ m10` restricted to branches
/// with `length > 0`. Sign is flipped when `direction = loss`. Returns
/// `None` when no branch in the set has a defined rate.
pub fn rate_statistic_mean(
    family: &Family,
    split: MarkSplit<'_>,
    direction: Direction,
    restrict_to_significant: bool,
) -> Option<f64> {
    let rates = family.rate.as_ref().expect("rate mode requires Family::rate");
    let mut m = split.m01.clone();
    m.or_assign(split.m10);
    let m = if restrict_to_significant {
        family.restrict_to_significant(&m)
    } else {
        m
    };
    let sign = match direction {
        Direction::Gain => 1.0,
        Direction::Loss => -1.0,
    };
    let values: Vec<f64> = m
        .iter_ones()
        .filter_map(|b| rates[b].map(|r| r * sign))
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Median of the same signed-rate set used by [`rate_statistic_mean`].
/// Used for secondary per-family reporting, never as the ranking statistic.
pub fn rate_statistic_median(
    family: &Family,
    split: MarkSplit<'_>,
    direction: Direction,
    restrict_to_significant: bool,
) -> Option<f64> {
    let rates = family.rate.as_ref().expect("rate mode requires Family::rate");
    let mut m = split.m01.clone();
    m.or_assign(split.m10);
    let m = if restrict_to_significant {
        family.restrict_to_significant(&m)
    } else {
        m
    };
    let sign = match direction {
        Direction::Gain => 1.0,
        Direction::Loss => -1.0,
    };
    let mut values: Vec<f64> = m
        .iter_ones()
        .filter_map(|b| rates[b].map(|r| r * sign))
        .collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Mean of signed per-branch rates over the background set (every branch not
/// in `fg_01 ∪ fg_10`), restricted to `length > 0`. Same sign convention and
/// `None`-when-empty behavior as [`rate_statistic_mean`]; used for the
/// `bg_mean_signed_rate` secondary report in rate mode.
pub fn rate_statistic_background_mean(
    family: &Family,
    fg_01: &Bitset,
    fg_10: &Bitset,
    n_branches: usize,
    direction: Direction,
) -> Option<f64> {
    let mut fg_all = fg_01.clone();
    fg_all.or_assign(fg_10);
    let background = fg_all.complement(n_branches);

    let rates = family.rate.as_ref().expect("rate mode requires Family::rate");
    let sign = match direction {
        Direction::Gain => 1.0,
        Direction::Loss => -1.0,
    };
    let values: Vec<f64> = background
        .iter_ones()
        .filter_map(|b| rates[b].map(|r| r * sign))
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Observed foreground, reshaped into a [`MarkSplit`] for the statistic
/// functions above.
pub fn foreground_split<'a>(fg_01: &'a Bitset, fg_10: &'a Bitset) -> MarkSplit<'a> {
    MarkSplit { m01: fg_01, m10: fg_10 }
}

/// One-sided empirical p-value with the standard add-one Monte Carlo
/// correction: `p = (1 + |{t_i >= stat_obs}|) / (N + 1)`.
pub fn empirical_p(stat_obs: f64, null_stats: &[f64]) -> f64 {
    let ge = null_stats.iter().filter(|&&t| t >= stat_obs).count();
    (1.0 + ge as f64) / (null_stats.len() as f64 + 1.0)
}

/// Evaluates the binary concordance statistic for every sample in `samples`
/// plus the observed foreground, returning `(stat_obs, null_stats)`.
pub fn evaluate_binary(
    tree: &CanonicalTree,
    family: &Family,
    fg_01: &Bitset,
    fg_10: &Bitset,
    samples: &[Sample],
    direction: Direction,
    restrict_to_significant: bool,
) -> (f64, Vec<f64>) {
    let _ = tree;
    let stat_obs = binary_statistic(family, foreground_split(fg_01, fg_10), direction, restrict_to_significant) as f64;
    let null: Vec<f64> = samples
        .iter()
        .map(|s| binary_statistic(family, MarkSplit::from(s), direction, restrict_to_significant) as f64)
        .collect();
    (stat_obs, null)
}

/// Evaluates the rate-mode mean statistic for every sample in `samples` plus
/// the observed foreground. Samples/foreground that yield no defined rate
/// contribute `0.0` so the permutation distribution stays well-formed; this
/// only happens in pathological all-zero-length neighborhoods.
pub fn evaluate_rate(
    family: &Family,
    fg_01: &Bitset,
    fg_10: &Bitset,
    samples: &[Sample],
    direction: Direction,
    restrict_to_significant: bool,
) -> (f64, Vec<f64>) {
    let stat_obs = rate_statistic_mean(family, foreground_split(fg_01, fg_10), direction, restrict_to_significant)
        .unwrap_or(0.0);
    let null: Vec<f64> = samples
        .iter()
        .map(|s| {
            rate_statistic_mean(family, MarkSplit::from(s), direction, restrict_to_significant).unwrap_or(0.0)
        })
        .collect();
    (stat_obs, null)
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
    fn binary_statistic_counts_concordant_gain() {
        let tree = toy_tree();
        let mut deltas = vec![0i64; tree.n_branches];
        let a = tree.branch_index["A"];
        deltas[a] = 2;
        let fam = Family::new("f1".into(), &tree, &deltas, false);

        let fg_01 = Bitset::from_indices(tree.words, [a]);
        let fg_10 = Bitset::zeros(tree.words);
        let stat = binary_statistic(&fam, foreground_split(&fg_01, &fg_10), Direction::Gain, false);
        assert_eq!(stat, 1);
        let stat_loss = binary_statistic(&fam, foreground_split(&fg_01, &fg_10), Direction::Loss, false);
        assert_eq!(stat_loss, 0);
    }

    #[test]
    fn rate_statistic_mean_matches_hand_computation() {
        let tree = toy_tree();
        let mut deltas = vec![0i64; tree.n_branches];
        let a = tree.branch_index["A"];
        deltas[a] = 2;
        let fam = Family::new("f1".into(), &tree, &deltas, true);

        let fg_01 = Bitset::from_indices(tree.words, [a]);
        let fg_10 = Bitset::zeros(tree.words);
        let mean = rate_statistic_mean(&fam, foreground_split(&fg_01, &fg_10), Direction::Gain, false).unwrap();
        assert_eq!(mean, 2.0);
        let mean_loss = rate_statistic_mean(&fam, foreground_split(&fg_01, &fg_10), Direction::Loss, false).unwrap();
        assert_eq!(mean_loss, -2.0);
    }

    #[test]
    fn rate_statistic_background_mean_excludes_foreground() {
        let tree = toy_tree();
        let mut deltas = vec![0i64; tree.n_branches];
        let a = tree.branch_index["A"];
        let b = tree.branch_index["B"];
        deltas[a] = 2;
        deltas[b] = 4;
        let fam = Family::new("f1".into(), &tree, &deltas, true);

        let fg_01 = Bitset::from_indices(tree.words, [a]);
        let fg_10 = Bitset::zeros(tree.words);
        let bg_mean =
            rate_statistic_background_mean(&fam, &fg_01, &fg_10, tree.n_branches, Direction::Gain).unwrap();
        assert_eq!(bg_mean, 4.0);
    }

    #[test]
    fn empirical_p_add_one_correction() {
        let null = vec![0.0, 1.0, 2.0, 3.0];
        let p = empirical_p(2.0, &null);
        assert_eq!(p, (1.0 + 2.0) / 5.0);
    }

    #[test]
    fn empirical_p_never_zero() {
        let null = vec![-1.0, -2.0, -3.0];
        let p = empirical_p(100.0, &null);
        assert_eq!(p, 1.0 / 4.0);
        assert!(p > 0.0);
    }
}
