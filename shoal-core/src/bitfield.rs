//! Fixed-length bitset of piece indices (peer views and the local "have" set).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitfield {
    len: u32,
    words: Vec<u64>,
}

impl Bitfield {
    /// All bits clear.
    pub fn new(len: u32) -> Self {
        Self {
            len,
            words: vec![0; (len as usize).div_ceil(64)],
        }
    }

    /// All bits set.
    pub fn full(len: u32) -> Self {
        let mut b = Self::new(len);
        for w in &mut b.words {
            *w = u64::MAX;
        }
        b.mask_tail();
        b
    }

    /// Bitfield with exactly the given indices set. Out-of-range indices are ignored.
    pub fn from_indices(len: u32, indices: impl IntoIterator<Item = u32>) -> Self {
        let mut b = Self::new(len);
        for i in indices {
            b.set(i);
        }
        b
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.words
            .get((index / 64) as usize)
            .is_some_and(|w| w & (1u64 << (index % 64)) != 0)
    }

    pub fn set(&mut self, index: u32) {
        if index < self.len {
            if let Some(w) = self.words.get_mut((index / 64) as usize) {
                *w |= 1u64 << (index % 64);
            }
        }
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.len
    }

    /// OR-merge `other` into self. Idempotent. Lengths must match.
    pub fn union_with(&mut self, other: &Bitfield) -> bool {
        if other.len != self.len || other.words.len() != self.words.len() {
            return false;
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= *theirs;
        }
        self.mask_tail();
        true
    }

    /// Set indices in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    /// Clear indices in ascending order.
    pub fn iter_zeros(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| !self.get(i))
    }

    /// Stable byte form, used for announce signatures.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.words.len() * 8);
        out.extend_from_slice(&self.len.to_le_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    // Bits past `len` must stay clear; peers may send garbage there.
    fn mask_tail(&mut self) {
        let rem = self.len % 64;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut b = Bitfield::new(70);
        b.set(0);
        b.set(69);
        b.set(70); // out of range, ignored
        assert!(b.get(0));
        assert!(b.get(69));
        assert!(!b.get(70));
        assert_eq!(b.count_ones(), 2);
    }

    #[test]
    fn full_has_no_tail_bits() {
        let b = Bitfield::full(65);
        assert_eq!(b.count_ones(), 65);
        assert!(b.is_full());
    }

    #[test]
    fn union_is_idempotent() {
        let mut a = Bitfield::from_indices(10, [1, 3]);
        let b = Bitfield::from_indices(10, [3, 7]);
        assert!(a.union_with(&b));
        let once = a.clone();
        assert!(a.union_with(&b));
        assert_eq!(a, once);
        assert_eq!(a.iter_ones().collect::<Vec<_>>(), vec![1, 3, 7]);
    }

    #[test]
    fn union_rejects_length_mismatch() {
        let mut a = Bitfield::new(10);
        assert!(!a.union_with(&Bitfield::full(11)));
        assert_eq!(a.count_ones(), 0);
    }

    #[test]
    fn union_masks_garbage_tail() {
        let mut a = Bitfield::new(3);
        let forged = Bitfield {
            len: 3,
            words: vec![u64::MAX],
        };
        a.union_with(&forged);
        assert_eq!(a.count_ones(), 3);
    }

    #[test]
    fn zeros_ascending() {
        let b = Bitfield::from_indices(5, [0, 2]);
        assert_eq!(b.iter_zeros().collect::<Vec<_>>(), vec![1, 3, 4]);
    }
}
