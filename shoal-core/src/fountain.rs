//! Best-effort fountain fallback: XOR combinations of pieces and a peeling decoder.
//!
//! Units are padded to the full piece size; the short last piece is zero-extended for the
//! XOR and truncated again when solved.

use std::collections::{BTreeSet, VecDeque};

use rand::seq::index;
use rand::Rng;

/// Default upper bound for the degree of an encoded unit.
pub const DEFAULT_MAX_DEGREE: usize = 3;

/// Unpeeled units kept per piece; beyond that the oldest are dropped.
const PENDING_PER_PIECE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub indices: Vec<u32>,
    pub xor_bytes: Vec<u8>,
}

impl EncodedUnit {
    pub fn degree(&self) -> usize {
        self.indices.len()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FountainError {
    #[error("unit has no indices")]
    Empty,
    #[error("unit index {index} out of range for {piece_count} pieces")]
    IndexOutOfRange { index: u32, piece_count: u32 },
    #[error("unit is {got} bytes, expected {expected}")]
    WrongLength { expected: usize, got: usize },
}

/// Sample a degree in `1..=max_degree` and that many distinct indices from `available`.
pub fn pick_indices<R: Rng + ?Sized>(available: &[u32], max_degree: usize, rng: &mut R) -> Vec<u32> {
    let cap = max_degree.min(available.len());
    if cap == 0 {
        return Vec::new();
    }
    let degree = rng.gen_range(1..=cap);
    let mut picked: Vec<u32> = index::sample(rng, available.len(), degree)
        .into_iter()
        .map(|i| available[i])
        .collect();
    picked.sort_unstable();
    picked
}

/// XOR `pieces` (zero-padded to `piece_size`) into one unit.
pub fn combine(indices: Vec<u32>, pieces: &[&[u8]], piece_size: usize) -> EncodedUnit {
    let mut xor_bytes = vec![0u8; piece_size];
    for piece in pieces {
        xor_into(&mut xor_bytes, piece);
    }
    EncodedUnit { indices, xor_bytes }
}

fn xor_into(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= *b;
    }
}

struct PendingUnit {
    unknown: BTreeSet<u32>,
    bytes: Vec<u8>,
}

/// Accumulates units and known pieces, peeling degree-one units until nothing changes.
pub struct FountainDecoder {
    piece_size: usize,
    piece_lens: Vec<usize>,
    solved: Vec<Option<Vec<u8>>>,
    pending: VecDeque<PendingUnit>,
    max_pending: usize,
}

impl FountainDecoder {
    /// `piece_lens[i]` is the true length of piece `i`.
    pub fn new(piece_size: usize, piece_lens: Vec<usize>) -> Self {
        let n = piece_lens.len();
        Self {
            piece_size,
            piece_lens,
            solved: vec![None; n],
            pending: VecDeque::new(),
            max_pending: n.max(1) * PENDING_PER_PIECE,
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_lens.len() as u32
    }

    pub fn is_solved(&self, index: u32) -> bool {
        self.solved.get(index as usize).is_some_and(Option::is_some)
    }

    pub fn solved_count(&self) -> usize {
        self.solved.iter().filter(|s| s.is_some()).count()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True once every index is solved.
    pub fn can_reconstruct(&self) -> bool {
        self.solved.iter().all(Option::is_some)
    }

    /// Solved piece bytes at their true length.
    pub fn piece(&self, index: u32) -> Option<&[u8]> {
        let bytes = self.solved.get(index as usize)?.as_ref()?;
        Some(&bytes[..self.piece_lens[index as usize]])
    }

    /// Feed a piece obtained directly.
    pub fn add_known(&mut self, index: u32, bytes: &[u8]) {
        let Some(slot) = self.solved.get_mut(index as usize) else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let mut padded = vec![0u8; self.piece_size];
        let n = bytes.len().min(self.piece_size);
        padded[..n].copy_from_slice(&bytes[..n]);
        *slot = Some(padded);
        self.substitute(index);
        self.peel();
    }

    /// Feed an encoded unit. Repeated indices cancel out.
    pub fn add_unit(&mut self, unit: EncodedUnit) -> Result<(), FountainError> {
        if unit.indices.is_empty() {
            return Err(FountainError::Empty);
        }
        if unit.xor_bytes.len() != self.piece_size {
            return Err(FountainError::WrongLength {
                expected: self.piece_size,
                got: unit.xor_bytes.len(),
            });
        }
        let mut unknown = BTreeSet::new();
        for &i in &unit.indices {
            if i >= self.piece_count() {
                return Err(FountainError::IndexOutOfRange {
                    index: i,
                    piece_count: self.piece_count(),
                });
            }
            if !unknown.insert(i) {
                unknown.remove(&i);
            }
        }
        let mut bytes = unit.xor_bytes;
        let known: Vec<u32> = unknown.iter().copied().filter(|&i| self.is_solved(i)).collect();
        for i in known {
            if let Some(Some(piece)) = self.solved.get(i as usize) {
                xor_into(&mut bytes, piece);
            }
            unknown.remove(&i);
        }
        if !unknown.is_empty() {
            if self.pending.len() >= self.max_pending {
                self.pending.pop_front();
            }
            self.pending.push_back(PendingUnit { unknown, bytes });
            self.peel();
        }
        Ok(())
    }

    /// Drop everything learned from units, keeping only pieces added with `add_known`.
    pub fn reset_units(&mut self, known: &BTreeSet<u32>) {
        self.pending.clear();
        for (i, slot) in self.solved.iter_mut().enumerate() {
            if !known.contains(&(i as u32)) {
                *slot = None;
            }
        }
    }

    fn substitute(&mut self, index: u32) {
        let Some(Some(piece)) = self.solved.get(index as usize) else {
            return;
        };
        for unit in &mut self.pending {
            if unit.unknown.remove(&index) {
                xor_into(&mut unit.bytes, piece);
            }
        }
        self.pending.retain(|u| !u.unknown.is_empty());
    }

    fn peel(&mut self) {
        loop {
            let Some(pos) = self.pending.iter().position(|u| u.unknown.len() == 1) else {
                break;
            };
            let Some(unit) = self.pending.remove(pos) else {
                break;
            };
            let Some(&index) = unit.unknown.iter().next() else {
                continue;
            };
            if self.is_solved(index) {
                continue;
            }
            self.solved[index as usize] = Some(unit.bytes);
            self.substitute(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const PIECE: usize = 16;

    fn pieces(n: usize, last_len: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| {
                let len = if i == n - 1 { last_len } else { PIECE };
                (0..len).map(|j| (i * 31 + j * 7) as u8).collect()
            })
            .collect()
    }

    fn lens(p: &[Vec<u8>]) -> Vec<usize> {
        p.iter().map(Vec::len).collect()
    }

    fn unit(p: &[Vec<u8>], indices: &[u32]) -> EncodedUnit {
        let refs: Vec<&[u8]> = indices.iter().map(|&i| p[i as usize].as_slice()).collect();
        combine(indices.to_vec(), &refs, PIECE)
    }

    #[test]
    fn two_missing_of_ten_recovered_from_units() {
        let p = pieces(10, 9);
        let mut dec = FountainDecoder::new(PIECE, lens(&p));
        for i in (0..10u32).filter(|i| *i != 3 && *i != 9) {
            dec.add_known(i, &p[i as usize]);
        }
        assert!(!dec.can_reconstruct());

        // Ten units, several redundant, none a bare copy of a missing piece.
        let units: [&[u32]; 10] = [
            &[0, 1],
            &[2, 4, 5],
            &[3, 9],
            &[6, 7],
            &[1, 2, 8],
            &[4],
            &[3, 5, 8],
            &[0, 7, 9],
            &[5, 6],
            &[2, 8],
        ];
        for indices in units {
            dec.add_unit(unit(&p, indices)).unwrap();
        }
        assert!(dec.can_reconstruct());
        assert_eq!(dec.piece(3).unwrap(), p[3].as_slice());
        assert_eq!(dec.piece(9).unwrap(), p[9].as_slice());
        let rebuilt: Vec<u8> = (0..10).flat_map(|i| dec.piece(i).unwrap().to_vec()).collect();
        let original: Vec<u8> = p.concat();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn peeling_cascades_without_known_pieces() {
        let p = pieces(4, PIECE);
        let mut dec = FountainDecoder::new(PIECE, lens(&p));
        dec.add_unit(unit(&p, &[2, 3])).unwrap();
        dec.add_unit(unit(&p, &[1, 2])).unwrap();
        dec.add_unit(unit(&p, &[0, 1])).unwrap();
        assert_eq!(dec.solved_count(), 0);
        dec.add_unit(unit(&p, &[3])).unwrap();
        assert!(dec.can_reconstruct());
        for i in 0..4 {
            assert_eq!(dec.piece(i).unwrap(), p[i as usize].as_slice());
        }
    }

    #[test]
    fn stalls_when_no_unit_peels() {
        let p = pieces(3, PIECE);
        let mut dec = FountainDecoder::new(PIECE, lens(&p));
        dec.add_unit(unit(&p, &[0, 1])).unwrap();
        dec.add_unit(unit(&p, &[1, 2])).unwrap();
        assert!(!dec.can_reconstruct());
        assert_eq!(dec.pending_len(), 2);
    }

    #[test]
    fn unpeeled_units_are_bounded() {
        let p = pieces(2, PIECE);
        let mut dec = FountainDecoder::new(PIECE, lens(&p));
        for _ in 0..50 {
            dec.add_unit(unit(&p, &[0, 1])).unwrap();
        }
        assert_eq!(dec.pending_len(), 2 * PENDING_PER_PIECE);
        dec.add_unit(unit(&p, &[1])).unwrap();
        assert!(dec.can_reconstruct());
        assert_eq!(dec.piece(0).unwrap(), p[0].as_slice());
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn repeated_index_cancels() {
        let p = pieces(2, PIECE);
        let mut dec = FountainDecoder::new(PIECE, lens(&p));
        // [0, 1, 1] is equivalent to [0].
        let refs: Vec<&[u8]> = vec![&p[0], &p[1], &p[1]];
        dec.add_unit(combine(vec![0, 1, 1], &refs, PIECE)).unwrap();
        assert_eq!(dec.piece(0).unwrap(), p[0].as_slice());
        assert!(!dec.is_solved(1));
    }

    #[test]
    fn rejects_malformed_units() {
        let mut dec = FountainDecoder::new(PIECE, vec![PIECE; 2]);
        assert_eq!(
            dec.add_unit(EncodedUnit {
                indices: vec![],
                xor_bytes: vec![0; PIECE]
            }),
            Err(FountainError::Empty)
        );
        assert!(matches!(
            dec.add_unit(EncodedUnit {
                indices: vec![5],
                xor_bytes: vec![0; PIECE]
            }),
            Err(FountainError::IndexOutOfRange { index: 5, .. })
        ));
        assert!(matches!(
            dec.add_unit(EncodedUnit {
                indices: vec![0],
                xor_bytes: vec![0; 3]
            }),
            Err(FountainError::WrongLength { .. })
        ));
    }

    #[test]
    fn pick_indices_respects_degree_bounds() {
        let available = [0u32, 2, 4, 6, 8];
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let picked = pick_indices(&available, DEFAULT_MAX_DEGREE, &mut rng);
            assert!((1..=3).contains(&picked.len()));
            assert!(picked.iter().all(|i| available.contains(i)));
            assert!(picked.windows(2).all(|w| w[0] < w[1]));
        }
        assert!(pick_indices(&[], 3, &mut rng).is_empty());
        assert_eq!(pick_indices(&[7], 3, &mut rng), vec![7]);
    }
}
