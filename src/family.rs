//! Per-family branch-delta data model (component C).
//!
//! Loads per-family rows from the CAFE change table, indexed into the
//! canonical branch order; undeclared branches default to `delta = 0` and
//! the root is never present (it has no branch). Sign masks and, in rate
//! mode, per-branch rates are materialized once per family so the test-
//! statistic loop (component E) never recomputes them per permutation.

use crate::bitset::Bitset;
use crate::error::Result;
use crate::tree::CanonicalTree;

/// One gene family's per-branch copy-number deltas plus derived masks.
#[derive(Debug, Clone)]
pub struct Family {
    pub family_id: String,
    pub delta: Vec<i64>,
    pub pos_mask: Bitset,
    pub neg_mask: Bitset,
    /// `delta[b] / length[b]`, only defined where `length[b] > 0`; `None`
    /// entries are excluded from rate-mode statistics.
    pub rate: Option<Vec<Option<f64>>>,
    /// Branches whose CAFE branch-probability is `<= cafe_alpha`, when
    /// significance filtering is enabled; `None` when filtering is off.
    pub cafe_significant: Option<Bitset>,
}

impl Family {
    pub fn new(family_id: String, tree: &CanonicalTree, deltas: &[i64], rate_mode: bool) -> Self {
        debug_assert_eq!(deltas.len(), tree.n_branches);
        let mut pos_mask = Bitset::zeros(tree.words);
        let mut neg_mask = Bitset::zeros(tree.words);
        for (b, &d) in deltas.iter().enumerate() {
            if d > 0 {
                pos_mask.set(b);
            } else if d < 0 {
                neg_mask.set(b);
            }
        }
        let rate = if rate_mode {
            Some(
                deltas
                    .iter()
                    .enumerate()
                    .map(|(b, &d)| {
                        let len = tree.length[b];
                        if len > 0.0 {
                            Some(d as f64 / len)
                        } else {
                            None
                        }
                    })
                    .collect(),
            )
        } else {
            None
        };

        Family {
            family_id,
            delta: deltas.to_vec(),
            pos_mask,
            neg_mask,
            rate,
            cafe_significant: None,
        }
    }

    /// Intersects a per-branch set (e.g. a foreground or sample set) with
    /// this family's CAFE-significance mask, when one is present (spec §3
    /// "CAFE-significance mask").
    pub fn restrict_to_significant(&self, set: &Bitset) -> Bitset {
        match &self.cafe_significant {
            Some(mask) => set.intersection(mask),
            None => set.clone(),
        }
    }

    pub fn set_cafe_significant(&mut self, mask: Bitset) {
        self.cafe_significant = Some(mask);
    }
}

/// Builds the per-family table from a parsed change matrix (family id ->
/// branch key -> delta), filling missing branches with 0. A column naming a
/// branch key absent from the tree is fatal (spec §6.1 "Unknown branch keys
/// = fatal"); a column naming the root is silently ignored, since the root
/// carries no branch to index into.
pub fn build_families(
    tree: &CanonicalTree,
    rows: &[(String, std::collections::HashMap<String, i64>)],
    rate_mode: bool,
) -> Result<Vec<Family>> {
    rows.iter()
        .map(|(fam_id, row)| {
            let mut deltas = vec![0i64; tree.n_branches];
            for (key, &val) in row {
                if tree.is_root_label(key) {
                    continue;
                }
                let b = tree.require_branch(key, "CAFE change table")?;
                deltas[b] = val;
            }
            Ok(Family::new(fam_id.clone(), tree, &deltas, rate_mode))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{CanonicalTree, LengthPolicy};
    use phylotree::tree::Tree as PhyloTree;
    use std::collections::HashMap;

    fn toy_tree() -> CanonicalTree {
        let newick = "((A:1,B:1)AB:1,C:1)root:0;";
        let phylo = PhyloTree::from_newick(newick).unwrap();
        CanonicalTree::from_phylotree(&phylo, LengthPolicy::NonNegative).unwrap()
    }

    #[test]
    fn missing_branches_default_to_zero() {
        let tree = toy_tree();
        let mut row = HashMap::new();
        row.insert("A".to_string(), 2i64);
        let fam = Family::new("fam1".into(), &tree, &{
            let mut d = vec![0i64; tree.n_branches];
            d[tree.branch_index["A"]] = 2;
            d
        }, false);
        assert!(fam.pos_mask.get(tree.branch_index["A"]));
        assert!(!fam.pos_mask.get(tree.branch_index["B"]));
        let _ = row;
    }

    #[test]
    fn rate_mode_skips_zero_length_branches() {
        let tree = toy_tree();
        let mut deltas = vec![0i64; tree.n_branches];
        let c = tree.branch_index["C"];
        deltas[c] = 3;
        let fam = Family::new("fam1".into(), &tree, &deltas, true);
        let rate = fam.rate.unwrap();
        assert_eq!(rate[c], Some(3.0));
    }

    #[test]
    fn build_families_rejects_unknown_columns() {
        let tree = toy_tree();
        let mut row = HashMap::new();
        row.insert("A".to_string(), 1i64);
        row.insert("not_a_branch".to_string(), 99i64);
        let err = build_families(&tree, &[("f1".to_string(), row)], false).unwrap_err();
        assert!(matches!(err, crate::error::CafeError::UnknownBranchKey(_, _)));
    }

    #[test]
    fn build_families_fills_missing_with_zero() {
        let tree = toy_tree();
        let mut row = HashMap::new();
        row.insert("A".to_string(), 1i64);
        let fams = build_families(&tree, &[("f1".to_string(), row)], false).unwrap();
        assert_eq!(fams.len(), 1);
        assert!(fams[0].pos_mask.get(tree.branch_index["A"]));
        assert!(!fams[0].pos_mask.get(tree.branch_index["B"]));
    }
}
