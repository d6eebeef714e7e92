//! Maximum-likelihood ancestral-state reconstruction under Mk2 (component B).
//!
//! Fits `q01`, `q10` by two-phase grid search in log-space, runs Felsenstein
//! pruning for the likelihood and a downward pass for per-node posteriors,
//! then thresholds to hard states and derives the foreground branch sets.
//!
//! Grounded on the teacher's traversal style in `snapshot.rs`
//! (`compute_bitsets`: cached bottom-up DFS over `phylotree` node ids) —
//! pruning here is the same DFS shape, just carrying a 2-vector of
//! log-likelihoods per node instead of a bitset.

use crate::bitset::Bitset;
use crate::error::{CafeError, Result};
use crate::tree::CanonicalTree;
use std::collections::HashMap;

/// Hard-state threshold pair, `0 <= lo < hi <= 1` (spec §6.2), except the
/// degenerate `lo == hi` edge case (spec §8 boundary behaviors) where every
/// branch becomes ambiguous.
#[derive(Copy, Clone, Debug)]
pub struct PosteriorThresholds {
    pub hi: f64,
    pub lo: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HardState {
    Zero,
    One,
    Ambiguous,
}

/// Fitted Mk2 rates and per-node posteriors, plus the derived foreground
/// branch bitmasks.
#[derive(Debug, Clone)]
pub struct AsrResult {
    pub q01: f64,
    pub q10: f64,
    pub log_likelihood: f64,
    /// P(state = 1) at the bottom endpoint of branch `b` (the node itself).
    pub posterior_child: Vec<f64>,
    /// P(state = 1) at the top endpoint of branch `b` (its parent, or the
    /// root for branches directly under it).
    pub posterior_parent: Vec<f64>,
    pub hard_child: Vec<HardState>,
    pub hard_parent: Vec<HardState>,
    pub fg_01: Bitset,
    pub fg_10: Bitset,
    pub fg: Bitset,
    pub k01: usize,
    pub k10: usize,
}

/// log-space 2-state transition matrix entries for branch length `t`.
fn log_transition(q01: f64, q10: f64, t: f64) -> [[f64; 2]; 2] {
    let sum = q01 + q10;
    if sum <= 0.0 || !sum.is_finite() {
        // Degenerate: no change possible: P(same) = 1, P(change) = 0.
        return [[0.0, f64::NEG_INFINITY], [f64::NEG_INFINITY, 0.0]];
    }
    let decay = (-sum * t).exp();
    let p00 = (q10 + q01 * decay) / sum;
    let p11 = (q01 + q10 * decay) / sum;
    let p01 = 1.0 - p00;
    let p10 = 1.0 - p11;
    [
        [p00.max(0.0).ln(), p01.max(0.0).ln()],
        [p10.max(0.0).ln(), p11.max(0.0).ln()],
    ]
}

pub(crate) fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Felsenstein pruning: `[log P(subtree below node | node = 0), ... = 1]`
/// for every node, post-order.
fn prune(
    tree: &CanonicalTree,
    trait_values: &HashMap<usize, u8>,
    q01: f64,
    q10: f64,
) -> Vec<[f64; 2]> {
    // node index space: 0..n_branches are the non-root branches (keyed by
    // their child endpoint); we additionally need the root's own
    // likelihood, stored at index `n_branches`.
    let n = tree.n_branches;
    let mut ll = vec![[0.0f64; 2]; n + 1];

    for b in 0..n {
        if tree.is_tip[b] {
            let tip_idx = tree.tip_index[&tree.branch_keys[b]];
            let state = *trait_values.get(&tip_idx).expect("tip trait present");
            ll[b] = if state == 0 {
                [0.0, f64::NEG_INFINITY]
            } else {
                [f64::NEG_INFINITY, 0.0]
            };
        } else {
            let mut acc = [0.0f64; 2];
            for parent_state in 0..2 {
                let mut total = 0.0;
                for &c in &tree.child_branches[b] {
                    let t = tree.length[c];
                    let trans = log_transition(q01, q10, t);
                    let terms = [
                        trans[parent_state][0] + ll[c][0],
                        trans[parent_state][1] + ll[c][1],
                    ];
                    total += logsumexp(&terms);
                }
                acc[parent_state] = total;
            }
            ll[b] = acc;
        }
    }

    // Root: combine all branches whose parent is the root (parent_branch ==
    // None).
    let mut root_acc = [0.0f64; 2];
    for parent_state in 0..2 {
        let mut total = 0.0;
        for b in 0..n {
            if tree.parent_branch[b].is_none() {
                let t = tree.length[b];
                let trans = log_transition(q01, q10, t);
                let terms = [
                    trans[parent_state][0] + ll[b][0],
                    trans[parent_state][1] + ll[b][1],
                ];
                total += logsumexp(&terms);
            }
        }
        root_acc[parent_state] = total;
    }
    ll[n] = root_acc;
    ll
}

fn total_log_likelihood(ll_root: [f64; 2], q01: f64, q10: f64) -> f64 {
    let sum = q01 + q10;
    let (log_pi0, log_pi1) = if sum > 0.0 && sum.is_finite() {
        ((q10 / sum).ln(), (q01 / sum).ln())
    } else {
        (2.0_f64.ln() * -1.0, 2.0_f64.ln() * -1.0)
    };
    logsumexp(&[log_pi0 + ll_root[0], log_pi1 + ll_root[1]])
}

/// Two-phase grid search in log-space over `[1e-4, 1e1]`: 21-point coarse
/// grid per axis, then a 21-point refine within ±1 decade of the coarse
/// maximum. Ties are broken toward smaller rates by scanning in ascending
/// order and using strict `>` for updates.
fn fit_rates(tree: &CanonicalTree, trait_values: &HashMap<usize, u8>) -> Result<(f64, f64, f64)> {
    let grid = |lo: f64, hi: f64| -> Vec<f64> {
        let log_lo = lo.log10();
        let log_hi = hi.log10();
        (0..21)
            .map(|i| {
                let frac = i as f64 / 20.0;
                10f64.powf(log_lo + frac * (log_hi - log_lo))
            })
            .collect()
    };

    let evaluate = |q01: f64, q10: f64| -> f64 {
        let ll = prune(tree, trait_values, q01, q10);
        total_log_likelihood(ll[tree.n_branches], q01, q10)
    };

    let coarse = grid(1e-4, 1e1);
    let mut best = (f64::NEG_INFINITY, coarse[0], coarse[0]);
    for &q01 in &coarse {
        for &q10 in &coarse {
            let ll = evaluate(q01, q10);
            if ll > best.0 {
                best = (ll, q01, q10);
            }
        }
    }

    let refine_range = |center: f64| -> (f64, f64) {
        ((center / 10.0).max(1e-6), (center * 10.0).min(1e3))
    };
    let (q01_lo, q01_hi) = refine_range(best.1);
    let (q10_lo, q10_hi) = refine_range(best.2);
    let refine01 = grid(q01_lo, q01_hi);
    let refine10 = grid(q10_lo, q10_hi);

    for &q01 in &refine01 {
        for &q10 in &refine10 {
            let ll = evaluate(q01, q10);
            if ll > best.0 {
                best = (ll, q01, q10);
            }
        }
    }

    if !best.0.is_finite() || best.1 <= 0.0 || best.2 <= 0.0 {
        return Err(CafeError::AsrFitFailed);
    }
    Ok((best.1, best.2, best.0))
}

/// Downward pass producing per-node marginal posteriors on {0,1}, combining
/// the parent's marginal with the "other subtree" conditional, per spec
/// §4.B. All combination happens in log-space with `logsumexp`
/// renormalization at the end.
fn posteriors(
    tree: &CanonicalTree,
    trait_values: &HashMap<usize, u8>,
    q01: f64,
    q10: f64,
    ll: &[[f64; 2]],
) -> (Vec<f64>, Vec<f64>) {
    let n = tree.n_branches;
    let sum = q01 + q10;
    let (log_pi0, log_pi1) = if sum > 0.0 && sum.is_finite() {
        ((q10 / sum).ln(), (q01 / sum).ln())
    } else {
        (-2f64.ln(), -2f64.ln())
    };

    // log P(node = s, everything outside its subtree) for every node,
    // computed top-down starting from the root prior.
    let mut outside = vec![[0.0f64; 2]; n];

    // Root-children first: "outside" contribution is just the root prior
    // combined with the transition along the branch.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&b| std::cmp::Reverse(b)); // parents before children

    for &b in &order {
        let t = tree.length[b];
        let trans = log_transition(q01, q10, t);
        let parent_outside_and_siblings = match tree.parent_branch[b] {
            None => [log_pi0, log_pi1],
            Some(p) => {
                let mut acc = outside[p];
                for &sib in &tree.child_branches[p] {
                    if sib == b {
                        continue;
                    }
                    let sib_t = tree.length[sib];
                    let sib_trans = log_transition(q01, q10, sib_t);
                    for parent_state in 0..2 {
                        let terms = [
                            sib_trans[parent_state][0] + ll[sib][0],
                            sib_trans[parent_state][1] + ll[sib][1],
                        ];
                        acc[parent_state] += logsumexp(&terms);
                    }
                }
                acc
            }
        };
        for child_state in 0..2 {
            let terms = [
                parent_outside_and_siblings[0] + trans[0][child_state],
                parent_outside_and_siblings[1] + trans[1][child_state],
            ];
            outside[b][child_state] = logsumexp(&terms);
        }
    }

    let mut posterior_child = vec![0.0; n];
    let mut posterior_parent = vec![0.0; n];

    for b in 0..n {
        let unnorm = [outside[b][0] + ll[b][0], outside[b][1] + ll[b][1]];
        let norm = logsumexp(&unnorm);
        posterior_child[b] = if norm.is_finite() {
            (unnorm[1] - norm).exp()
        } else {
            0.5
        };

        // Parent-endpoint posterior: marginal at the parent node (or root).
        let parent_unnorm = match tree.parent_branch[b] {
            None => {
                let mut total_other = [log_pi0, log_pi1];
                for &rb in &order {
                    if tree.parent_branch[rb].is_none() {
                        let rt = tree.length[rb];
                        let rtrans = log_transition(q01, q10, rt);
                        for s in 0..2 {
                            let terms =
                                [rtrans[s][0] + ll[rb][0], rtrans[s][1] + ll[rb][1]];
                            total_other[s] += logsumexp(&terms);
                        }
                    }
                }
                total_other
            }
            Some(p) => [outside[p][0] + ll[p][0], outside[p][1] + ll[p][1]],
        };
        let pnorm = logsumexp(&parent_unnorm);
        posterior_parent[b] = if pnorm.is_finite() {
            (parent_unnorm[1] - pnorm).exp()
        } else {
            0.5
        };
    }

    let _ = trait_values;
    (posterior_child, posterior_parent)
}

fn hard_state(p: f64, thresholds: &PosteriorThresholds) -> HardState {
    if thresholds.lo >= thresholds.hi {
        // §8 boundary: posterior_hi == posterior_lo -> neither side
        // inclusive, every branch ambiguous.
        return HardState::Ambiguous;
    }
    if p >= thresholds.hi {
        HardState::One
    } else if p <= thresholds.lo {
        HardState::Zero
    } else {
        HardState::Ambiguous
    }
}

/// Fits Mk2, computes posteriors, thresholds them, and derives `fg_01` /
/// `fg_10` (the latter only when `include_trait_loss` is set).
pub fn reconstruct(
    tree: &CanonicalTree,
    trait_by_species: &HashMap<String, u8>,
    thresholds: PosteriorThresholds,
    include_trait_loss: bool,
) -> Result<AsrResult> {
    let trait_values: HashMap<usize, u8> = tree
        .tip_index
        .iter()
        .map(|(species, &idx)| {
            let v = *trait_by_species
                .get(species)
                .expect("species presence validated by caller");
            (idx, v)
        })
        .collect();

    let (q01, q10, log_likelihood) = fit_rates(tree, &trait_values)?;
    let ll = prune(tree, &trait_values, q01, q10);
    let (posterior_child, posterior_parent) = posteriors(tree, &trait_values, q01, q10, &ll);

    let hard_child: Vec<HardState> = posterior_child
        .iter()
        .map(|&p| hard_state(p, &thresholds))
        .collect();
    let hard_parent: Vec<HardState> = posterior_parent
        .iter()
        .map(|&p| hard_state(p, &thresholds))
        .collect();

    let mut fg_01 = Bitset::zeros(tree.words);
    let mut fg_10 = Bitset::zeros(tree.words);
    for b in 0..tree.n_branches {
        match (hard_parent[b], hard_child[b]) {
            (HardState::Zero, HardState::One) => fg_01.set(b),
            (HardState::One, HardState::Zero) if include_trait_loss => fg_10.set(b),
            _ => {}
        }
    }
    let fg = fg_01.union(&fg_10);
    let k01 = fg_01.count_ones();
    let k10 = fg_10.count_ones();

    Ok(AsrResult {
        q01,
        q10,
        log_likelihood,
        posterior_child,
        posterior_parent,
        hard_child,
        hard_parent,
        fg_01,
        fg_10,
        fg,
        k01,
        k10,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::LengthPolicy;
    use phylotree::tree::Tree as PhyloTree;

    fn toy_tree_and_trait() -> (CanonicalTree, HashMap<String, u8>) {
        let newick = "((A:1,B:1)AB:1,C:1)root:0;";
        let phylo = PhyloTree::from_newick(newick).unwrap();
        let tree = CanonicalTree::from_phylotree(&phylo, LengthPolicy::NonNegative).unwrap();
        let trait_map: HashMap<String, u8> =
            [("A".into(), 1), ("B".into(), 1), ("C".into(), 0)].into();
        (tree, trait_map)
    }

    #[test]
    fn posteriors_sum_to_one_and_rates_are_positive_finite() {
        let (tree, trait_map) = toy_tree_and_trait();
        let thresholds = PosteriorThresholds { hi: 0.8, lo: 0.2 };
        let res = reconstruct(&tree, &trait_map, thresholds, true).unwrap();
        assert!(res.q01.is_finite() && res.q01 > 0.0);
        assert!(res.q10.is_finite() && res.q10 > 0.0);
        for &p in res.posterior_child.iter().chain(&res.posterior_parent) {
            assert!((0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn equal_thresholds_make_everything_ambiguous() {
        let (tree, trait_map) = toy_tree_and_trait();
        let thresholds = PosteriorThresholds { hi: 0.5, lo: 0.5 };
        let res = reconstruct(&tree, &trait_map, thresholds, true).unwrap();
        assert!(res.fg.is_empty());
        assert_eq!(res.k01, 0);
        assert_eq!(res.k10, 0);
    }

    #[test]
    fn loss_excluded_when_not_requested() {
        let (tree, trait_map) = toy_tree_and_trait();
        let thresholds = PosteriorThresholds { hi: 0.6, lo: 0.4 };
        let res = reconstruct(&tree, &trait_map, thresholds, false).unwrap();
        assert!(res.fg_10.is_empty());
    }

    #[test]
    fn all_equal_traits_give_no_foreground() {
        let newick = "((A:1,B:1)AB:1,C:1)root:0;";
        let phylo = PhyloTree::from_newick(newick).unwrap();
        let tree = CanonicalTree::from_phylotree(&phylo, LengthPolicy::NonNegative).unwrap();
        let trait_map: HashMap<String, u8> =
            [("A".into(), 0), ("B".into(), 0), ("C".into(), 0)].into();
        let thresholds = PosteriorThresholds { hi: 0.9, lo: 0.1 };
        let res = reconstruct(&tree, &trait_map, thresholds, true).unwrap();
        assert_eq!(res.k01, 0);
        assert_eq!(res.k10, 0);
    }
}
