use std::io::{Error, ErrorKind};

/// A bit-packed vector of piece possession, one bit per piece, padded with
/// zero bits up to a byte boundary. Bit `i` set means piece `i` is held.
#[derive(Debug, Clone, PartialEq)]
pub struct BitField {
    bytes: Vec<u8>,
    num_pieces: usize,
}

impl BitField {
    /// A cleared bitfield for `num_pieces` pieces, padded to a byte boundary.
    pub fn new(num_pieces: usize) -> BitField {
        let byte_len = (num_pieces + 7) / 8;
        BitField {
            bytes: vec![0; byte_len],
            num_pieces,
        }
    }

    /// Number of pieces this bitfield tracks (the unpadded bit count).
    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    /// Padded byte length, i.e. the length of a `bitfield` message payload.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Replaces the bytes of this bitfield from a received `bitfield`
    /// message payload. Fails if the payload's padded length doesn't match
    /// ours — the caller must drop the peer on failure.
    pub fn replace_from_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() != self.bytes.len() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "bitfield padded length mismatch",
            ));
        }
        self.bytes = payload.to_vec();
        Ok(())
    }

    /// Returns true if the bit at the given index is set.
    pub fn is_set(&self, index: usize) -> bool {
        let byte = index / 8;
        let bit = index % 8;
        self.bytes[byte] & (1 << (7 - bit)) != 0
    }

    pub fn set(&mut self, index: usize) {
        let byte = index / 8;
        let bit = index % 8;
        self.bytes[byte] |= 1 << (7 - bit);
    }

    pub fn unset(&mut self, index: usize) {
        let byte = index / 8;
        let bit = index % 8;
        self.bytes[byte] &= !(1 << (7 - bit));
    }

    pub fn iter(&self) -> BitfieldIter {
        BitfieldIter {
            bitfield: self,
            index: 0,
        }
    }

    pub fn is_subset(&self, other: &BitField) -> bool {
        self.iter().zip(other.iter()).all(|(a, b)| !a || b)
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.is_set(index)
    }

    pub fn pieces(&self) -> Vec<usize> {
        self.iter()
            .enumerate()
            .filter(|&(_, b)| b)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.iter().all(|b| b)
    }
}

pub struct BitfieldIter<'a> {
    bitfield: &'a BitField,
    index: usize,
}

impl<'a> Iterator for BitfieldIter<'a> {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        if self.index >= self.bitfield.num_pieces {
            return None;
        }
        let bit = self.bitfield.is_set(self.index);
        self.index += 1;
        Some(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_cleared_and_padded() {
        let bf = BitField::new(7);
        assert_eq!(bf.num_pieces(), 7);
        assert_eq!(bf.byte_len(), 1);
        assert!(!bf.is_complete());
        assert_eq!(bf.pieces(), Vec::<usize>::new());
    }

    #[test]
    fn set_unset_roundtrip() {
        let mut bf = BitField::new(16);
        bf.set(0);
        bf.set(15);
        assert!(bf.has_piece(0));
        assert!(!bf.has_piece(1));
        assert!(!bf.has_piece(7));
        assert!(!bf.has_piece(8));
        assert!(bf.has_piece(15));
        bf.unset(0);
        assert!(!bf.has_piece(0));
    }

    #[test]
    fn bitfield_round_trip() {
        let mut bf = BitField::new(20);
        for i in [0, 3, 4, 19] {
            bf.set(i);
        }
        let bytes = bf.as_bytes().to_vec();
        let mut other = BitField::new(20);
        other.replace_from_payload(&bytes).unwrap();
        assert_eq!(other.as_bytes(), bytes.as_slice());
        assert_eq!(other.pieces(), vec![0, 3, 4, 19]);
    }

    #[test]
    fn wrong_padded_length_is_rejected() {
        // N=7 pads to 1 byte; a peer claiming N=16 worth of bytes (2) must
        // be rejected rather than silently truncated or zero-extended.
        let mut ours = BitField::new(7);
        let err = ours.replace_from_payload(&[0u8; 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn is_complete_requires_every_bit() {
        let mut bf = BitField::new(9);
        for i in 0..8 {
            bf.set(i);
        }
        assert!(!bf.is_complete());
        bf.set(8);
        assert!(bf.is_complete());
    }
}
