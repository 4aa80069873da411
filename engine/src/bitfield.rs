//! Packed bit sequence over piece indices, wrapping `bitvec` the way the
//! teacher's `picker` module does, with the counting helpers the picker and
//! wire codec need.

use bitvec::prelude::*;

pub type Bitfield = BitVec<u8, Msb0>;

/// A fixed-length `have` bitfield over `[0, num_pieces)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBitfield {
    bits: Bitfield,
}

impl PieceBitfield {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: Bitfield::repeat(false, num_pieces),
        }
    }

    /// Builds a bitfield from a raw packed byte slice sent over the wire.
    /// `num_pieces` must be `<= bytes.len() * 8`; trailing spare bits in the
    /// last byte are retained but ignored by callers.
    pub fn from_wire_bytes(bytes: &[u8], num_pieces: usize) -> Option<Self> {
        if bytes.len() != (num_pieces + 7) / 8 {
            return None;
        }
        let bits = Bitfield::from_slice(bytes);
        Some(Self { bits })
    }

    pub fn to_wire_bytes(&self) -> Vec<u8> {
        self.bits.clone().into_vec()
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, idx: usize) -> bool {
        self.bits[idx]
    }

    pub fn set(&mut self, idx: usize, val: bool) {
        self.bits.set(idx, val);
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn count_zeros(&self) -> usize {
        self.bits.count_zeros()
    }

    pub fn all(&self) -> bool {
        self.bits.all()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_bytes() {
        let mut bf = PieceBitfield::new(20);
        bf.set(0, true);
        bf.set(19, true);
        bf.set(8, true);
        let bytes = bf.to_wire_bytes();
        assert_eq!(bytes.len(), 3);
        let back = PieceBitfield::from_wire_bytes(&bytes, 20).unwrap();
        assert_eq!(back, bf);
        assert_eq!(back.count_ones(), 3);
    }

    #[test]
    fn rejects_mismatched_wire_length() {
        assert!(PieceBitfield::from_wire_bytes(&[0u8; 2], 20).is_none());
    }

    #[test]
    fn all_is_true_only_when_every_bit_set() {
        let mut bf = PieceBitfield::new(3);
        assert!(!bf.all());
        bf.set(0, true);
        bf.set(1, true);
        bf.set(2, true);
        assert!(bf.all());
    }
}
