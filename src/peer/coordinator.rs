//! The contract between a peer engine and the torrent-wide coordinator.
//!
//! The coordinator owns piece picking, swarm-wide choking, and extension
//! dispatch; the engine owns one wire connection. Calls in both directions
//! are synchronous and run under the coordinator's serialisation token:
//! the engine acquires it at the top of `connection_ready`, and every
//! coordinator call back into a peer passes through the
//! `&mut dyn ManageablePeer` argument it was handed, so an engine never
//! observes concurrent mutation of its own state.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use super::bitfield::Bitfield;
use super::peer_id::PeerId;
use crate::bencode::Value;
use crate::counter::StatisticCounter;
use crate::piecedb::{BlockDescriptor, HashChain, InfoHash, PieceDatabase, ViewSignature};

/// The per-torrent services a peer engine consumes.
pub trait PeerCoordinator {
    /// Acquires the torrent's serialisation token. Reentrant per torrent.
    fn lock(&self);

    /// Releases the serialisation token.
    fn unlock(&self);

    /// The local peer's ID.
    fn local_peer_id(&self) -> PeerId;

    /// The torrent's piece database.
    fn piece_database(&self) -> Arc<dyn PieceDatabase>;

    /// Registers a peer that has completed its handshake. Returning `false`
    /// rejects the peer and tears the connection down.
    fn peer_connected(&self, peer: &mut dyn ManageablePeer) -> bool;

    /// Reports that a peer's connection has been destroyed. Called exactly
    /// once per registered peer.
    fn peer_disconnected(&self, peer: &mut dyn ManageablePeer);

    /// Allocates up to `count` block requests for the peer to send. When
    /// `remote_is_choking` is true only allowed-fast requests may be
    /// returned.
    fn get_requests(
        &self,
        peer: &mut dyn ManageablePeer,
        count: usize,
        remote_is_choking: bool,
    ) -> Vec<BlockDescriptor>;

    /// Records one newly-available piece at the peer. Returns whether the
    /// piece is wanted locally.
    fn add_available_piece(&self, peer: &mut dyn ManageablePeer, piece: u32) -> bool;

    /// Records the peer's whole bitfield as available. Returns whether any
    /// of it is wanted locally.
    fn add_available_pieces(&self, peer: &mut dyn ManageablePeer) -> bool;

    /// Records a piece the remote suggested we fetch from it.
    fn set_piece_suggested(&self, peer: &mut dyn ManageablePeer, piece: u32);

    /// Records a piece the remote marked allowed-fast for us.
    fn set_piece_allowed_fast(&self, peer: &mut dyn ManageablePeer, piece: u32);

    /// Delivers a received block, with its view signature and hash chain
    /// where the content mode carries them.
    fn handle_block(
        &self,
        peer: &mut dyn ManageablePeer,
        descriptor: &BlockDescriptor,
        signature: Option<&ViewSignature>,
        hash_chain: Option<&HashChain>,
        data: Bytes,
    );

    /// Cryptographically verifies a view signature. Returning `false` is
    /// fatal for the connection that received it.
    fn handle_view_signature(&self, signature: &ViewSignature) -> bool;

    /// Asks the choking algorithm to revisit its decision for this peer.
    fn adjust_choking(&self, peer: &mut dyn ManageablePeer, we_are_choking: bool);

    /// Invites the coordinator to advertise extensions to a freshly
    /// handshaken peer.
    fn offer_extensions_to_peer(&self, peer: &mut dyn ManageablePeer);

    /// Reports extensions the remote enabled or withdrew, with the rest of
    /// its handshake dictionary.
    fn enable_disable_peer_extensions(
        &self,
        peer: &mut dyn ManageablePeer,
        added: Vec<String>,
        removed: Vec<String>,
        extra: Option<Value>,
    );

    /// Delivers an extension-protocol message by the sub-id we advertised.
    fn process_extension_message(&self, peer: &mut dyn ManageablePeer, id: u8, data: Bytes);

    /// Torrent-wide aggregate the peer's protocol-bytes-sent counter feeds.
    fn protocol_bytes_sent_counter(&self) -> StatisticCounter;

    /// Torrent-wide aggregate the peer's protocol-bytes-received counter
    /// feeds.
    fn protocol_bytes_received_counter(&self) -> StatisticCounter;

    /// Torrent-wide aggregate the peer's block-bytes-sent counter feeds.
    fn block_bytes_sent_counter(&self) -> StatisticCounter;

    /// Torrent-wide aggregate the peer's block-bytes-received counter feeds.
    fn block_bytes_received_counter(&self) -> StatisticCounter;
}

/// Resolves the coordinator for an inbound connection once its handshake
/// reveals an info hash.
pub trait PeerCoordinatorLookup {
    /// The coordinator serving `info_hash`, if this node has the torrent.
    fn coordinator_for(&self, info_hash: &InfoHash) -> Option<Arc<dyn PeerCoordinator>>;
}

/// The surface a coordinator uses to command one peer engine.
///
/// All calls must be made under the coordinator's serialisation token.
pub trait ManageablePeer {
    /// The remote peer's ID, once its handshake completed.
    fn remote_peer_id(&self) -> Option<PeerId>;

    /// The remote peer's socket address.
    fn remote_socket_address(&self) -> SocketAddr;

    /// The remote peer's piece bitfield, once the engine is set up.
    fn remote_bitfield(&self) -> Option<&Bitfield>;

    /// The remote peer's signed view length in bytes (Elastic).
    fn remote_view_length(&self) -> Option<u64>;

    fn we_are_choking(&self) -> bool;
    fn we_are_interested(&self) -> bool;
    fn they_are_choking(&self) -> bool;
    fn they_are_interested(&self) -> bool;

    /// Whether the fast extension was negotiated.
    fn fast_extension_enabled(&self) -> bool;

    /// Whether the extension protocol was negotiated.
    fn extension_protocol_enabled(&self) -> bool;

    /// Whether the remote has requested blocks we have not yet sent.
    fn they_have_outstanding_requests(&self) -> bool;

    fn protocol_bytes_sent(&self) -> u64;
    fn protocol_bytes_received(&self) -> u64;
    fn block_bytes_sent(&self) -> u64;
    fn block_bytes_received(&self) -> u64;

    /// Protocol receive rate over the short statistics window.
    fn protocol_bytes_received_per_second(&self) -> u64;

    /// Protocol send rate over the short statistics window.
    fn protocol_bytes_sent_per_second(&self) -> u64;

    /// The counter fed by received block payload bytes, for the coordinator
    /// to sample when rotating chokes.
    fn block_bytes_received_counter(&self) -> StatisticCounter;

    /// The counter fed by sent block payload bytes.
    fn block_bytes_sent_counter(&self) -> StatisticCounter;

    /// Chokes or unchokes the remote peer. Returns whether the state
    /// changed (and a message was queued).
    fn set_we_are_choking(&mut self, choking: bool) -> bool;

    /// Declares or withdraws our interest in the remote peer.
    fn set_we_are_interested(&mut self, interested: bool);

    /// Cancels outbound block requests (endgame, piece completed
    /// elsewhere).
    fn cancel_requests(&mut self, requests: &[BlockDescriptor]);

    /// Withdraws any queued piece sends for one piece, rejecting them
    /// explicitly when the fast extension is on.
    fn reject_piece(&mut self, piece: u32);

    /// Announces a newly-verified local piece.
    fn send_have_piece(&mut self, piece: u32);

    /// Periodic tick: closes an idle connection, otherwise queues a
    /// keepalive.
    fn send_keepalive_or_close(&mut self);

    /// Sends a view signature announcing local view growth (Elastic).
    fn send_view_signature(&mut self, signature: ViewSignature);

    /// Sends an extension-protocol handshake.
    fn send_extension_handshake(
        &mut self,
        added: Vec<String>,
        removed: Vec<String>,
        extra: Option<Value>,
    );

    /// Sends an extension-protocol message addressed by the extension name
    /// the remote advertised. Unknown names are dropped.
    fn send_extension_message(&mut self, name: &str, data: Bytes);

    /// Closes the connection and notifies the coordinator. Idempotent.
    fn close(&mut self);
}
