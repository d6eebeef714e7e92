//! Compact bitset representation, extended from a leaf-partition bitset into
//! a general-purpose indexed bitmask used for branch sets, tip sets, and
//! permutation samples alike.
//!
//! # Overview
//! A bitset is an efficient way to represent which indices (leaves, branches,
//! or sample members) belong to a set. Each bit position corresponds to one
//! index.
//!
//! # Example
//! For branches [b0, b1, b2, b3]:
//! - Foreground {b0, b2} → bitset `0b0101` (bits 0 and 2 set)
//! - Sample {b1, b2, b3} → bitset `0b1110` (bits 1, 2, 3 set)

use std::hash::{Hash, Hasher};

/// A compact, index-addressable bitset.
///
/// Internally stores bits in `Vec<u64>` words so arbitrarily large branch or
/// tip counts are supported.
///
/// # Memory efficiency
/// - Traditional HashSet<usize>: ~24 bytes per element + overhead
/// - Bitset: 1 bit per possible element (8 bytes per 64 members)
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bitset(pub Vec<u64>);

impl Bitset {
    /// Creates a new bitset with all bits set to 0.
    ///
    /// # Parameters
    /// - `words`: Number of u64 words needed. Calculate as `(n + 63) / 64`
    pub fn zeros(words: usize) -> Self {
        Bitset(vec![0u64; words])
    }

    /// Number of words backing this bitset.
    #[inline]
    pub fn words(&self) -> usize {
        self.0.len()
    }

    /// Sets the bit at the given index to 1.
    #[inline]
    pub fn set(&mut self, idx: usize) {
        let word = idx >> 6;
        let bit = idx & 63;
        self.0[word] |= 1u64 << bit;
    }

    /// Clears the bit at the given index.
    #[inline]
    pub fn clear(&mut self, idx: usize) {
        let word = idx >> 6;
        let bit = idx & 63;
        self.0[word] &= !(1u64 << bit);
    }

    /// Returns whether the bit at `idx` is set.
    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        let word = idx >> 6;
        let bit = idx & 63;
        (self.0[word] >> bit) & 1 == 1
    }

    /// Builds a bitset with the given indices set.
    pub fn from_indices(words: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut bs = Self::zeros(words);
        for i in indices {
            bs.set(i);
        }
        bs
    }

    /// Performs bitwise OR with another bitset (union), in place.
    #[inline]
    pub fn or_assign(&mut self, other: &Bitset) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a |= *b;
        }
    }

    /// Returns the union of two bitsets.
    pub fn union(&self, other: &Bitset) -> Bitset {
        let mut out = self.clone();
        out.or_assign(other);
        out
    }

    /// Returns the intersection of two bitsets.
    pub fn intersection(&self, other: &Bitset) -> Bitset {
        let words = self.0.iter().zip(&other.0).map(|(a, b)| a & b).collect();
        Bitset(words)
    }

    /// In-place intersection.
    pub fn and_assign(&mut self, other: &Bitset) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a &= *b;
        }
    }

    /// Returns true if `self` and `other` share no set bits.
    pub fn is_disjoint(&self, other: &Bitset) -> bool {
        self.0.iter().zip(&other.0).all(|(a, b)| a & b == 0)
    }

    /// Returns true if every bit set in `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &Bitset) -> bool {
        self.0.iter().zip(&other.0).all(|(a, b)| a & !b == 0)
    }

    /// Bitwise complement, restricted to the first `n` bits (higher bits in
    /// the final word beyond `n` stay clear).
    pub fn complement(&self, n: usize) -> Bitset {
        let mut out = Bitset::zeros(self.0.len());
        for i in 0..n {
            if !self.get(i) {
                out.set(i);
            }
        }
        out
    }

    /// Counts the number of set bits (population count).
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns true if no bits are set.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Iterates the indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(wi, &w)| {
            (0..64).filter_map(move |bi| {
                if (w >> bi) & 1 == 1 {
                    Some(wi * 64 + bi)
                } else {
                    None
                }
            })
        })
    }

    /// Feeds a stable byte representation of the bitset into a hasher. Used
    /// for fingerprinting; independent of the vector's `Hash` impl so callers
    /// can compose it deterministically with other fields.
    pub fn hash_stable<H: Hasher>(&self, state: &mut H) {
        for w in &self.0 {
            w.hash(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_basic() {
        let mut bs = Bitset::zeros(1);
        bs.set(0);
        bs.set(2);
        assert_eq!(bs.0[0], 0b0101);
    }

    #[test]
    fn test_bitset_or() {
        let mut bs1 = Bitset::zeros(1);
        bs1.set(0);
        bs1.set(1);

        let mut bs2 = Bitset::zeros(1);
        bs2.set(2);
        bs2.set(3);

        bs1.or_assign(&bs2);
        assert_eq!(bs1.0[0], 0b1111);
    }

    #[test]
    fn test_count_ones() {
        let mut bs = Bitset::zeros(1);
        bs.set(0);
        bs.set(2);
        bs.set(5);
        assert_eq!(bs.count_ones(), 3);
    }

    #[test]
    fn test_large_bitset_words() {
        let mut bs = Bitset::zeros(2);
        bs.set(0);
        bs.set(63);
        bs.set(64);
        bs.set(127);

        assert_eq!(bs.count_ones(), 4);
        assert_eq!(bs.0[0], 1u64 | (1u64 << 63));
        assert_eq!(bs.0[1], 1u64 | (1u64 << 63));
    }

    #[test]
    fn test_complement_restricted_to_n() {
        let mut bs = Bitset::zeros(1);
        bs.set(0);
        bs.set(2);
        let comp = bs.complement(4);
        assert!(comp.get(1));
        assert!(comp.get(3));
        assert!(!comp.get(0));
        assert!(!comp.get(2));
    }

    #[test]
    fn test_disjoint_and_subset() {
        let a = Bitset::from_indices(1, [0, 1]);
        let b = Bitset::from_indices(1, [2, 3]);
        assert!(a.is_disjoint(&b));
        let c = Bitset::from_indices(1, [0]);
        assert!(c.is_subset_of(&a));
        assert!(!a.is_subset_of(&c));
    }

    #[test]
    fn test_iter_ones() {
        let bs = Bitset::from_indices(2, [0, 5, 64, 100]);
        let got: Vec<usize> = bs.iter_ones().collect();
        assert_eq!(got, vec![0, 5, 64, 100]);
    }
}
