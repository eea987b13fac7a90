use std::io;

use bytes::Bytes;

use super::{BlockDescriptor, HashChain, InfoHash, StorageDescriptor, ViewSignature};
use crate::peer::Bitfield;

/// How piece integrity is expressed for a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    /// Flat SHA-1 piece hash list.
    Classic,
    /// Tree-hashed pieces; blocks carry hash chains to a fixed root.
    Merkle,
    /// Signed, growing views; blocks carry hash chains to a signed root.
    Elastic,
}

impl ContentMode {
    pub fn is_merkle(&self) -> bool {
        matches!(self, ContentMode::Merkle)
    }

    pub fn is_elastic(&self) -> bool {
        matches!(self, ContentMode::Elastic)
    }
}

/// The piece store a peer engine reads through.
///
/// Hashing, verification, and persistence live behind this trait; the engine
/// only ever asks what is present, reads block payloads to serve requests,
/// and (in Elastic mode) fetches the signature covering the current view.
pub trait PieceDatabase: Send + Sync {
    /// The torrent's content mode.
    fn content_mode(&self) -> ContentMode;

    /// The torrent's identity.
    fn info_hash(&self) -> InfoHash;

    /// The geometry fixed at torrent creation. For Elastic torrents this is
    /// the static prefix; for the others it never changes.
    fn initial_descriptor(&self) -> StorageDescriptor;

    /// The current view geometry. Grows past `initial_descriptor` only in
    /// Elastic mode.
    fn current_descriptor(&self) -> StorageDescriptor;

    /// Bitfield of locally verified pieces, sized to the current view.
    fn present_pieces(&self) -> Bitfield;

    /// Whether the piece at `index` is present and verified.
    fn have_piece(&self, index: u32) -> bool;

    /// The signature covering a view of exactly `view_length` bytes, if one
    /// is held (Elastic mode).
    fn view_signature(&self, view_length: u64) -> Option<ViewSignature>;

    /// The hash chain proving a piece under the current root or view
    /// (Merkle and Elastic modes; `None` in Classic mode).
    fn piece_hash_chain(&self, piece: u32) -> Option<HashChain>;

    /// Reads a block payload for sending to a peer.
    fn read_block(&self, descriptor: &BlockDescriptor) -> io::Result<Bytes>;
}
