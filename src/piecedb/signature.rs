use bytes::Bytes;

/// A signed attestation that the torrent is valid up to `view_length` bytes
/// under the given tree root (Elastic mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSignature {
    /// Length in bytes of the signed prefix.
    pub view_length: u64,
    /// Root hash of the tree over the signed prefix.
    pub root_hash: [u8; 20],
    /// The signature bytes over (view length, root hash).
    pub signature: Bytes,
}

impl ViewSignature {
    pub fn new(view_length: u64, root_hash: [u8; 20], signature: Bytes) -> Self {
        Self {
            view_length,
            root_hash,
            signature,
        }
    }
}

/// The sibling hashes proving one block against a view root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashChain {
    /// The view the chain is rooted in.
    pub view_length: u64,
    /// Concatenated 20-byte sibling hashes, leaf to root.
    pub hashes: Bytes,
}

impl HashChain {
    pub fn new(view_length: u64, hashes: Bytes) -> Self {
        Self {
            view_length,
            hashes,
        }
    }
}
