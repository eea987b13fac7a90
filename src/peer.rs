//! The per-peer protocol engine.
//!
//! One [`PeerHandler`] mediates a single duplex byte stream with one remote
//! peer: it parses and emits protocol messages, maintains the two-sided
//! choke/interest state machine, and arbitrates block requests between the
//! torrent-wide coordinator and the remote peer. The base protocol (BEP 3),
//! the fast extension (BEP 6), the extension protocol (BEP 10), and the
//! Merkle and Elastic content modes are supported.

mod bitfield;
mod coordinator;
mod error;
mod extension;
mod fast;
mod handler;
mod message;
mod outbound;
mod parser;
mod peer_id;

pub use bitfield::Bitfield;
pub use coordinator::{ManageablePeer, PeerCoordinator, PeerCoordinatorLookup};
pub use error::PeerError;
pub use extension::ExtensionUpdate;
pub use fast::generate_allowed_fast_set;
pub use handler::PeerHandler;
pub use message::{Handshake, Message, MessageId};
pub use outbound::PeerOutboundQueue;
pub use parser::{PeerProtocolParser, ProtocolEvent};
pub use peer_id::PeerId;

#[cfg(test)]
mod tests;
