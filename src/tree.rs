//! Tree canonicalizer (component A).
//!
//! Normalizes node labels, assigns a deterministic branch order, and
//! precomputes the bitmask artifacts (`ancestors`, `descendants`, `tips`,
//! `clade_size`, `bin`) every downstream component relies on.
//!
//! Grounded on the teacher's `snapshot.rs` (bottom-up DFS over a
//! `phylotree::tree::Tree`, leaf-name-keyed rather than node-id-keyed) and
//! `io.rs` (reading the first tree out of a BEAST/NEXUS block). Where the
//! teacher collects *partitions* for RF distance, this module collects
//! *branches* addressable by a stable index for ancestor/descendant algebra.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;

use phylotree::tree::Tree as PhyloTree;

use crate::bitset::Bitset;
use crate::error::{io_err, CafeError, Result};

/// Whether branch lengths must be strictly positive (rate mode) or merely
/// finite and non-negative (binary mode).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LengthPolicy {
    NonNegative,
    StrictlyPositive,
}

/// A rooted tree canonicalized into a branch-indexed, bitmask-addressable
/// structure. Branch `b` is the edge leading from `parent_branch[b]` (or the
/// root, if `None`) down to the node carrying `branch_keys[b]`.
#[derive(Debug, Clone)]
pub struct CanonicalTree {
    pub branch_keys: Vec<String>,
    pub parent_branch: Vec<Option<usize>>,
    pub child_branches: Vec<Vec<usize>>,
    pub length: Vec<f64>,
    pub is_tip: Vec<bool>,
    pub tip_species: Vec<Option<String>>,

    pub ancestors: Vec<Bitset>,
    pub descendants: Vec<Bitset>,
    pub tips: Vec<Bitset>,
    pub clade_size: Vec<usize>,
    pub bin: Vec<usize>,

    pub branch_index: HashMap<String, usize>,
    pub tip_index: HashMap<String, usize>,

    pub n_branches: usize,
    pub n_tips: usize,
    pub words: usize,
    pub tip_words: usize,

    pub fingerprint: u64,

    /// Canonical label of the root node, if it carries one. Change-table
    /// columns naming this key are ignored rather than treated as unknown
    /// (the root has no branch to index into; spec §4.C "the root is
    /// omitted").
    pub root_label: Option<String>,
}

/// Strips a trailing `_0` or `_1` state suffix from a raw node label to form
/// its canonical branch key, per spec §3 "Branch-key normalization".
pub fn canonical_label(raw: &str) -> &str {
    if let Some(stripped) = raw.strip_suffix("_0").or_else(|| raw.strip_suffix("_1")) {
        stripped
    } else {
        raw
    }
}

impl CanonicalTree {
    /// Reads the first NEXUS `TREE name = newick;` entry in `path` and
    /// canonicalizes it.
    pub fn from_nexus_file<P: AsRef<Path>>(path: P, length_policy: LengthPolicy) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| io_err(path.as_ref(), e))?;
        let newick = first_tree_newick(&content)
            .ok_or_else(|| CafeError::NoTreeFound { path: path.as_ref().to_path_buf() })?;
        let phylo = PhyloTree::from_newick(&newick)
            .map_err(|e| CafeError::TreeParse(e.to_string()))?;
        Self::from_phylotree(&phylo, length_policy)
    }

    /// Canonicalizes an already-parsed `phylotree::tree::Tree`.
    pub fn from_phylotree(tree: &PhyloTree, length_policy: LengthPolicy) -> Result<Self> {
        let root_id = tree
            .get_root()
            .map_err(|e| CafeError::TreeParse(e.to_string()))?;

        // Post-order traversal; children visited in lexicographic order of
        // canonical label so the branch order is deterministic regardless of
        // parse-time child ordering.
        let mut post_order: Vec<usize> = Vec::new();
        let mut stack: Vec<(usize, bool)> = vec![(root_id, false)];
        while let Some((node_id, expanded)) = stack.pop() {
            if expanded {
                post_order.push(node_id);
                continue;
            }
            let node = tree.get(&node_id).map_err(|e| CafeError::TreeParse(e.to_string()))?;
            let mut children = node.children.clone();
            children.sort_by_key(|&cid| sort_key_for(tree, cid));
            stack.push((node_id, true));
            // Push in reverse so the lexicographically-first child is
            // popped (and thus visited) first.
            for &cid in children.iter().rev() {
                stack.push((cid, false));
            }
        }

        let mut branch_keys = Vec::new();
        let mut parent_branch_of_node: HashMap<usize, Option<usize>> = HashMap::new();
        let mut node_to_branch: HashMap<usize, usize> = HashMap::new();
        let mut length = Vec::new();
        let mut is_tip = Vec::new();
        let mut tip_species = Vec::new();
        let mut child_branches: Vec<Vec<usize>> = Vec::new();
        let mut branch_index: HashMap<String, usize> = HashMap::new();

        for &node_id in &post_order {
            if node_id == root_id {
                continue;
            }
            let node = tree.get(&node_id).map_err(|e| CafeError::TreeParse(e.to_string()))?;
            let raw_name = node.name.clone().ok_or(CafeError::UnlabeledBranch)?;
            let key = canonical_label(&raw_name).to_string();
            if branch_index.contains_key(&key) {
                return Err(CafeError::DuplicateBranchLabel(key));
            }

            let len = node.parent_edge.unwrap_or(f64::NAN);
            let valid = match length_policy {
                LengthPolicy::NonNegative => len.is_finite() && len >= 0.0,
                LengthPolicy::StrictlyPositive => len.is_finite() && len > 0.0,
            };
            if !valid {
                if len.is_finite() && len == 0.0 {
                    return Err(CafeError::ZeroLengthInRateMode(key));
                }
                return Err(CafeError::InvalidBranchLength(key));
            }

            let leaf = node.children.is_empty();
            let b = branch_keys.len();
            branch_index.insert(key.clone(), b);
            branch_keys.push(key.clone());
            length.push(len);
            is_tip.push(leaf);
            tip_species.push(if leaf { Some(key.clone()) } else { None });
            node_to_branch.insert(node_id, b);
            child_branches.push(Vec::new());

            let parent_id = node.parent;
            parent_branch_of_node.insert(node_id, parent_id);
        }

        let n_branches = branch_keys.len();
        let mut parent_branch = vec![None; n_branches];
        for (node_id, &b) in &node_to_branch {
            if let Some(Some(parent_id)) = parent_branch_of_node.get(node_id) {
                if *parent_id != root_id {
                    let pb = *node_to_branch
                        .get(parent_id)
                        .ok_or_else(|| CafeError::Invariant("parent branch missing".into()))?;
                    parent_branch[b] = Some(pb);
                    child_branches[pb].push(b);
                }
            }
        }
        for children in &mut child_branches {
            children.sort_unstable();
        }

        // Tip indexing, alphabetical by canonical key for reproducibility
        // independent of parse-time leaf order (mirrors the teacher's
        // leaf-name sort in `snapshot.rs`).
        let mut tip_keys: Vec<String> = (0..n_branches)
            .filter(|&b| is_tip[b])
            .map(|b| branch_keys[b].clone())
            .collect();
        tip_keys.sort();
        let tip_index: HashMap<String, usize> = tip_keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();
        let n_tips = tip_keys.len();
        let words = n_branches.div_ceil(64).max(1);
        let tip_words = n_tips.div_ceil(64).max(1);

        let mut tips = vec![Bitset::zeros(tip_words); n_branches];
        for b in 0..n_branches {
            if is_tip[b] {
                let ti = tip_index[&branch_keys[b]];
                tips[b].set(ti);
            }
        }
        // Ascending index order == post-order == children-before-parents.
        for b in 0..n_branches {
            let mut acc = tips[b].clone();
            for &c in &child_branches[b] {
                acc.or_assign(&tips[c]);
            }
            tips[b] = acc;
        }

        let mut descendants = vec![Bitset::zeros(words); n_branches];
        for b in 0..n_branches {
            let mut acc = Bitset::zeros(words);
            for &c in &child_branches[b] {
                acc.set(c);
                acc.or_assign(&descendants[c]);
            }
            descendants[b] = acc;
        }

        // Descending index order: parents (larger index) before children.
        let mut ancestors = vec![Bitset::zeros(words); n_branches];
        for b in (0..n_branches).rev() {
            ancestors[b] = match parent_branch[b] {
                None => Bitset::zeros(words),
                Some(p) => {
                    let mut a = ancestors[p].clone();
                    a.set(p);
                    a
                }
            };
        }

        let clade_size: Vec<usize> = tips.iter().map(|t| t.count_ones()).collect();
        let bin: Vec<usize> = clade_size
            .iter()
            .map(|&c| (c.max(1) as f64).log2().floor() as usize)
            .collect();

        let fingerprint = compute_fingerprint(&branch_keys, &parent_branch);
        let root_label = tree
            .get(&root_id)
            .ok()
            .and_then(|n| n.name.clone())
            .map(|n| canonical_label(&n).to_string());

        Ok(CanonicalTree {
            branch_keys,
            parent_branch,
            child_branches,
            length,
            is_tip,
            tip_species,
            ancestors,
            descendants,
            tips,
            clade_size,
            bin,
            branch_index,
            tip_index,
            n_branches,
            n_tips,
            words,
            tip_words,
            fingerprint,
            root_label,
        })
    }

    /// Looks up the branch index for a canonical key, erroring with the
    /// caller-supplied table name on miss (spec §4.A "unknown branch keys").
    pub fn require_branch(&self, key: &str, table: &'static str) -> Result<usize> {
        self.branch_index
            .get(key)
            .copied()
            .ok_or_else(|| CafeError::UnknownBranchKey(key.to_string(), table))
    }

    /// Species set implied by tip keys, for the exact-match check against
    /// the trait table (spec §3 "Species trait").
    pub fn tip_species_set(&self) -> std::collections::HashSet<String> {
        self.tip_index.keys().cloned().collect()
    }

    /// True when `key` names the root node rather than an unknown label.
    pub fn is_root_label(&self, key: &str) -> bool {
        self.root_label.as_deref() == Some(key)
    }
}

fn sort_key_for(tree: &PhyloTree, node_id: usize) -> String {
    if let Ok(node) = tree.get(&node_id) {
        if let Some(name) = &node.name {
            return canonical_label(name).to_string();
        }
    }
    // Nodes without a label (should not occur for valid CAFE-style inputs)
    // fall back to a stable-but-arbitrary key so traversal order is at least
    // deterministic; `from_phylotree` rejects unlabeled non-root nodes before
    // this matters for branch assignment.
    format!("\u{10FFFF}{node_id}")
}

fn compute_fingerprint(branch_keys: &[String], parent_branch: &[Option<usize>]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (key, parent) in branch_keys.iter().zip(parent_branch) {
        key.hash(&mut hasher);
        parent.hash(&mut hasher);
    }
    hasher.finish()
}

/// Extracts the first `TREE name = newick;` entry's newick string from NEXUS
/// text, discarding the trailing semicolon. Mirrors the teacher's
/// `collect_tree_blocks` in spirit but stops at the first match, per spec
/// §6.1 ("the first is read").
fn first_tree_newick(content: &str) -> Option<String> {
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.to_ascii_uppercase().starts_with("TREE ") {
            let mut parts = trimmed.splitn(2, '=');
            let _header = parts.next()?;
            let body = parts.next()?.trim();
            return Some(body.trim_end_matches(';').to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_tree() -> CanonicalTree {
        // ((A,B)AB,C)root;
        let newick = "((A:1,B:1)AB:1,C:1)root:0;";
        let phylo = PhyloTree::from_newick(newick).unwrap();
        CanonicalTree::from_phylotree(&phylo, LengthPolicy::NonNegative).unwrap()
    }

    #[test]
    fn canonical_label_strips_state_suffix() {
        assert_eq!(canonical_label("Name<123>_1"), "Name<123>");
        assert_eq!(canonical_label("Name<123>_0"), "Name<123>");
        assert_eq!(canonical_label("Plain"), "Plain");
    }

    #[test]
    fn branch_count_excludes_root() {
        let t = toy_tree();
        // Non-root branches: A, B, AB, C = 4
        assert_eq!(t.n_branches, 4);
        assert_eq!(t.n_tips, 3);
    }

    #[test]
    fn ancestors_of_root_children_are_empty() {
        let t = toy_tree();
        let ab = t.branch_index["AB"];
        let c = t.branch_index["C"];
        assert!(t.ancestors[ab].is_empty());
        assert!(t.ancestors[c].is_empty());
    }

    #[test]
    fn ancestor_descendant_consistency() {
        let t = toy_tree();
        let a = t.branch_index["A"];
        let ab = t.branch_index["AB"];
        assert!(t.ancestors[a].get(ab));
        assert!(t.descendants[ab].get(a));
        assert!(!t.ancestors[a].get(a));
    }

    #[test]
    fn clade_sizes_and_bins() {
        let t = toy_tree();
        let a = t.branch_index["A"];
        let ab = t.branch_index["AB"];
        assert_eq!(t.clade_size[a], 1);
        assert_eq!(t.bin[a], 0);
        assert_eq!(t.clade_size[ab], 2);
        assert_eq!(t.bin[ab], 1);
    }

    #[test]
    fn tips_disjoint_or_nested_invariant() {
        let t = toy_tree();
        for b1 in 0..t.n_branches {
            for b2 in 0..t.n_branches {
                if b1 == b2 {
                    continue;
                }
                let ancestor = t.ancestors[b1].get(b2) || t.ancestors[b2].get(b1);
                let disjoint_tips = t.tips[b1].is_disjoint(&t.tips[b2]);
                assert!(ancestor || disjoint_tips);
            }
        }
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let newick = "((A:1,A:1)AB:1,C:1)root:0;";
        let phylo = PhyloTree::from_newick(newick).unwrap();
        let err = CanonicalTree::from_phylotree(&phylo, LengthPolicy::NonNegative).unwrap_err();
        assert!(matches!(err, CafeError::DuplicateBranchLabel(_)));
    }

    #[test]
    fn zero_length_rejected_in_rate_mode() {
        let newick = "((A:0,B:1)AB:1,C:1)root:0;";
        let phylo = PhyloTree::from_newick(newick).unwrap();
        let err =
            CanonicalTree::from_phylotree(&phylo, LengthPolicy::StrictlyPositive).unwrap_err();
        assert!(matches!(err, CafeError::ZeroLengthInRateMode(_)));
    }

    #[test]
    fn fingerprint_is_stable_across_calls() {
        let t1 = toy_tree();
        let t2 = toy_tree();
        assert_eq!(t1.fingerprint, t2.fingerprint);
    }
}
