use bytes::Bytes;

use super::error::PeerError;

/// A bitfield recording which pieces a peer has.
///
/// Bits are numbered from the high bit of the first byte. The length is a
/// piece count, not a byte count; spare bits in the final byte are always
/// zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a full bitfield.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Builds a bitfield from wire bytes, validating that the byte length is
    /// exactly right for `piece_count` and that spare bits are zero.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        if bytes.len() != piece_count.div_ceil(8) {
            return Err(PeerError::Protocol("bitfield length mismatch".into()));
        }

        let bf = Self {
            bits: bytes.to_vec(),
            piece_count,
        };

        let spare = bf.bits.len() * 8 - piece_count;
        if spare > 0 {
            let last = bf.bits[bf.bits.len() - 1];
            if last & !(0xFFu8 << spare) != 0 {
                return Err(PeerError::Protocol("bitfield has spare bits set".into()));
            }
        }

        Ok(bf)
    }

    /// Whether the piece at `index` is present.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    /// Marks the piece at `index` present.
    pub fn set(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        self.bits[index / 8] |= 1 << (7 - (index % 8));
    }

    /// Flips every bit.
    pub fn invert(&mut self) {
        for byte in &mut self.bits {
            *byte = !*byte;
        }
        self.clear_spare_bits();
    }

    /// Grows the bitfield to `piece_count` pieces, preserving existing bits.
    /// Shrinking is not supported and is ignored.
    pub fn extend(&mut self, piece_count: usize) {
        if piece_count <= self.piece_count {
            return;
        }
        self.piece_count = piece_count;
        self.bits.resize(piece_count.div_ceil(8), 0);
    }

    /// Number of present pieces.
    pub fn cardinality(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Number of pieces the bitfield covers.
    pub fn len(&self) -> usize {
        self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            let last = self.bits.len() - 1;
            self.bits[last] &= 0xFFu8 << spare;
        }
    }
}
