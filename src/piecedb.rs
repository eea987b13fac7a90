//! Torrent content identities, block geometry, and the piece database
//! surface the peer engine reads through.

mod database;
mod descriptor;
mod info_hash;
mod signature;

pub use database::{ContentMode, PieceDatabase};
pub use descriptor::{BlockDescriptor, StorageDescriptor};
pub use info_hash::InfoHash;
pub use signature::{HashChain, ViewSignature};
