//! ebit - a per-peer BitTorrent protocol engine
//!
//! This library implements the component of a BitTorrent-compatible peer
//! that owns a single connection to one remote peer: the wire codec, an
//! incremental parser, the two-sided choke/interest state machine, and a
//! prioritised outbound queue with cancel/reject arbitration. Three content
//! modes are supported — classic (BEP-3), Merkle (BEP-30), and Elastic
//! (signed growing views) — together with the fast extension (BEP-6) and
//! the extension protocol (BEP-10).
//!
//! Piece picking, swarm-wide choking, hashing, and socket readiness belong
//! to external collaborators reached through the traits in
//! [`peer::PeerCoordinator`], [`piecedb::PieceDatabase`], and
//! [`connection::Connection`].
//!
//! # Modules
//!
//! - [`peer`] - The per-peer engine, parser, outbound queue, and codec
//! - [`piecedb`] - Content identities, block geometry, piece store surface
//! - [`bencode`] - BEP-3 bencode for extension-protocol dictionaries
//! - [`connection`] - The duplex byte-stream abstraction the engine drives
//! - [`counter`] - Cumulative and windowed statistics counters
//! - [`constants`] - Protocol constants and tuning parameters

pub mod bencode;
pub mod connection;
pub mod constants;
pub mod counter;
pub mod peer;
pub mod piecedb;

pub use bencode::{decode, encode, BencodeError, Value};
pub use connection::{Connection, TcpConnection};
pub use counter::{Period, StatisticCounter};
pub use peer::{
    Bitfield, ExtensionUpdate, Handshake, ManageablePeer, Message, MessageId, PeerCoordinator,
    PeerCoordinatorLookup, PeerError, PeerHandler, PeerId, PeerOutboundQueue, PeerProtocolParser,
    ProtocolEvent,
};
pub use piecedb::{
    BlockDescriptor, ContentMode, HashChain, InfoHash, PieceDatabase, StorageDescriptor,
    ViewSignature,
};
