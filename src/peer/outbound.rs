use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::extension::ExtensionUpdate;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use crate::bencode::Value;
use crate::connection::Connection;
use crate::constants::REQUEST_PIPELINE_DEPTH;
use crate::counter::StatisticCounter;
use crate::piecedb::{BlockDescriptor, ContentMode, InfoHash, PieceDatabase, ViewSignature};

/// The buffered, prioritised outbound side of one peer connection.
///
/// Messages are queued by class and encoded lazily when the connection can
/// accept bytes; piece payloads are read from the piece database at drain
/// time. Some operations cancel queued work instead of adding to it: an
/// interested message annihilates a queued not-interested, a cancel
/// annihilates a queued request, and a choke drops every unsent piece.
///
/// The queue also carries the request bookkeeping for both directions: which
/// of our requests are on the wire awaiting a piece or reject, and which
/// pieces each side may touch while choked (the allowed-fast sets).
pub struct PeerOutboundQueue {
    piece_database: Arc<dyn PieceDatabase>,
    block_bytes_sent: StatisticCounter,
    fast_extension_enabled: bool,

    // Queued unsent messages, one field per priority class.
    handshake: Option<Handshake>,
    chokes: VecDeque<bool>,
    interested: Option<bool>,
    haves: VecDeque<u32>,
    initial: VecDeque<Message>,
    signatures: VecDeque<ViewSignature>,
    allowed_fast: VecDeque<u32>,
    rejects: VecDeque<BlockDescriptor>,
    cancels: VecDeque<BlockDescriptor>,
    requests: VecDeque<BlockDescriptor>,
    pieces: VecDeque<BlockDescriptor>,
    extensions: VecDeque<Message>,
    keepalive: bool,

    // Requests serialised to the wire and not yet answered.
    outstanding: VecDeque<BlockDescriptor>,
    requests_plugged: bool,

    // Pieces the remote allowed us to request while it chokes us, and
    // pieces we granted the remote symmetrically.
    remote_allowed_fast: HashSet<u32>,
    local_allowed_fast: HashSet<u32>,

    local_extension_ids: HashMap<String, u8>,
    next_extension_id: u8,

    // Partially-written bytes of the message currently draining.
    send_buffer: BytesMut,
}

impl PeerOutboundQueue {
    pub fn new(
        piece_database: Arc<dyn PieceDatabase>,
        fast_extension_enabled: bool,
        block_bytes_sent: StatisticCounter,
    ) -> Self {
        Self {
            piece_database,
            block_bytes_sent,
            fast_extension_enabled,
            handshake: None,
            chokes: VecDeque::new(),
            interested: None,
            haves: VecDeque::new(),
            initial: VecDeque::new(),
            signatures: VecDeque::new(),
            allowed_fast: VecDeque::new(),
            rejects: VecDeque::new(),
            cancels: VecDeque::new(),
            requests: VecDeque::new(),
            pieces: VecDeque::new(),
            extensions: VecDeque::new(),
            keepalive: false,
            outstanding: VecDeque::new(),
            requests_plugged: false,
            remote_allowed_fast: HashSet::new(),
            local_allowed_fast: HashSet::new(),
            local_extension_ids: HashMap::new(),
            next_extension_id: 1,
            send_buffer: BytesMut::new(),
        }
    }

    /// Fixes the negotiated fast-extension flag once the remote's reserved
    /// bits are known.
    pub fn set_fast_extension(&mut self, enabled: bool) {
        self.fast_extension_enabled = enabled;
    }

    // ------------------------------------------------------------------
    // Enqueue operations
    // ------------------------------------------------------------------

    pub fn send_handshake(
        &mut self,
        fast: bool,
        extension: bool,
        info_hash: InfoHash,
        peer_id: PeerId,
    ) {
        self.handshake = Some(Handshake::new(
            *info_hash.as_bytes(),
            *peer_id.as_bytes(),
            fast,
            extension,
        ));
    }

    /// Queues a choke or unchoke and drops every unsent piece send.
    /// Returns the dropped block descriptors so the caller can reject them
    /// explicitly under the fast extension.
    pub fn send_choke_message(&mut self, choking: bool) -> Vec<BlockDescriptor> {
        self.chokes.push_back(choking);
        self.pieces.drain(..).collect()
    }

    /// Queues an interest change. A queued unsent message of the opposite
    /// polarity is removed instead, leaving a net change of zero.
    pub fn send_interested_message(&mut self, interested: bool) {
        if self.interested == Some(!interested) {
            self.interested = None;
        } else {
            self.interested = Some(interested);
        }
    }

    pub fn send_have_message(&mut self, piece: u32) {
        self.haves.push_back(piece);
    }

    pub fn send_bitfield_message(&mut self, bitfield: &Bitfield) {
        self.initial.push_back(Message::Bitfield(bitfield.to_bytes()));
    }

    pub fn send_have_all_message(&mut self) {
        self.initial.push_back(Message::HaveAll);
    }

    pub fn send_have_none_message(&mut self) {
        self.initial.push_back(Message::HaveNone);
    }

    pub fn send_elastic_bitfield_message(&mut self, bitfield: &Bitfield) {
        self.initial
            .push_back(Message::ElasticBitfield(bitfield.to_bytes()));
    }

    pub fn send_elastic_signature_message(&mut self, signature: ViewSignature) {
        self.signatures.push_back(signature);
    }

    /// Grants the given pieces allowed-fast to the remote and announces
    /// them. Already-granted pieces are not re-announced.
    pub fn send_allowed_fast_messages(&mut self, pieces: impl IntoIterator<Item = u32>) {
        for piece in pieces {
            if self.local_allowed_fast.insert(piece) {
                self.allowed_fast.push_back(piece);
            }
        }
    }

    /// Withdraws the remote's allowed-fast grant.
    pub fn clear_allowed_fast_pieces(&mut self) {
        self.local_allowed_fast.clear();
        self.allowed_fast.clear();
    }

    /// Records a piece the remote granted us allowed-fast.
    pub fn set_request_allowed_fast(&mut self, piece: u32) {
        self.remote_allowed_fast.insert(piece);
    }

    /// Whether we granted the remote allowed-fast on `piece`.
    pub fn is_piece_allowed_fast(&self, piece: u32) -> bool {
        self.local_allowed_fast.contains(&piece)
    }

    /// Queues outbound block requests and tracks them toward the pipeline
    /// target.
    pub fn send_request_messages(&mut self, requests: Vec<BlockDescriptor>) {
        self.requests.extend(requests);
    }

    /// Cancels one of our requests. A queued unsent request is removed
    /// outright and nothing is emitted. A request already on the wire gets
    /// an explicit cancel; with `keep_tracking` (fast extension) it stays
    /// in the outstanding set awaiting the remote's piece or reject,
    /// without it the request is forgotten immediately.
    pub fn send_cancel_message(&mut self, descriptor: BlockDescriptor, keep_tracking: bool) {
        if let Some(pos) = self.requests.iter().position(|d| *d == descriptor) {
            let _ = self.requests.remove(pos);
            return;
        }

        self.cancels.push_back(descriptor);
        if !keep_tracking {
            self.outstanding.retain(|d| *d != descriptor);
        }
    }

    /// Queues a piece send; the payload is read and encoded at drain time
    /// according to the content mode.
    pub fn send_piece_message(&mut self, descriptor: BlockDescriptor) {
        self.pieces.push_back(descriptor);
    }

    /// Removes a not-yet-sent piece send. Returns whether one was removed.
    pub fn discard_piece_message(&mut self, descriptor: &BlockDescriptor) -> bool {
        match self.pieces.iter().position(|d| d == descriptor) {
            Some(pos) => self.pieces.remove(pos).is_some(),
            None => false,
        }
    }

    /// Removes every queued piece send for one piece; under the fast
    /// extension each removed send is rejected explicitly.
    pub fn reject_piece_messages(&mut self, piece: u32) {
        let mut kept = VecDeque::with_capacity(self.pieces.len());
        for descriptor in self.pieces.drain(..) {
            if descriptor.piece_index == piece {
                if self.fast_extension_enabled {
                    self.rejects.push_back(descriptor);
                }
            } else {
                kept.push_back(descriptor);
            }
        }
        self.pieces = kept;
    }

    pub fn send_reject_request_message(&mut self, descriptor: BlockDescriptor) {
        self.rejects.push_back(descriptor);
    }

    pub fn send_reject_request_messages(&mut self, descriptors: Vec<BlockDescriptor>) {
        self.rejects.extend(descriptors);
    }

    /// While plugged, queued requests are not serialised to the wire unless
    /// their piece is allowed-fast for us.
    pub fn set_requests_plugged(&mut self, plugged: bool) {
        self.requests_plugged = plugged;
    }

    /// Moves every outstanding on-wire request back to the front of the
    /// queue, preserving order. Used when the remote chokes us without the
    /// fast extension, which implicitly discards them.
    pub fn requeue_all_request_messages(&mut self) {
        while let Some(descriptor) = self.outstanding.pop_back() {
            self.requests.push_front(descriptor);
        }
    }

    /// Marks an outstanding request satisfied by a piece. Returns whether
    /// such a request was outstanding.
    pub fn request_received(&mut self, descriptor: &BlockDescriptor) -> bool {
        self.remove_outstanding(descriptor)
    }

    /// Removes an outstanding request answered by a reject. Returns `false`
    /// if none matched.
    pub fn reject_received(&mut self, descriptor: &BlockDescriptor) -> bool {
        self.remove_outstanding(descriptor)
    }

    /// How many new requests the queue can accept toward its pipeline
    /// target.
    pub fn get_requests_needed(&self) -> usize {
        REQUEST_PIPELINE_DEPTH.saturating_sub(self.requests.len() + self.outstanding.len())
    }

    pub fn has_outstanding_requests(&self) -> bool {
        !self.outstanding.is_empty()
    }

    pub fn get_unsent_piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Queues an extension-protocol handshake, assigning local sub-ids to
    /// newly added extensions.
    pub fn send_extension_handshake(
        &mut self,
        added: Vec<String>,
        removed: Vec<String>,
        extra: Option<Value>,
    ) -> Result<(), PeerError> {
        let mut pairs = Vec::with_capacity(added.len());
        for name in added {
            let id = match self.local_extension_ids.get(&name) {
                Some(id) => *id,
                None => {
                    let id = self.next_extension_id;
                    self.next_extension_id = self.next_extension_id.wrapping_add(1).max(1);
                    self.local_extension_ids.insert(name.clone(), id);
                    id
                }
            };
            pairs.push((name, id));
        }
        for name in &removed {
            self.local_extension_ids.remove(name);
        }

        let payload = ExtensionUpdate::encode(&pairs, &removed, extra.as_ref())?;
        self.extensions.push_back(Message::Extended { id: 0, payload });
        Ok(())
    }

    /// Queues an extension-protocol message under the remote's sub-id.
    pub fn send_extension_message(&mut self, id: u8, data: Bytes) {
        self.extensions.push_back(Message::Extended { id, payload: data });
    }

    /// The sub-id this queue advertised for a local extension.
    pub fn local_extension_id(&self, name: &str) -> Option<u8> {
        self.local_extension_ids.get(name).copied()
    }

    pub fn send_keepalive_message(&mut self) {
        self.keepalive = true;
    }

    // ------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------

    /// Drains as many serialised bytes as the connection accepts. Returns
    /// the number of bytes written.
    pub fn send_data(&mut self, connection: &mut dyn Connection) -> io::Result<usize> {
        let mut written = 0;
        loop {
            if self.send_buffer.is_empty() {
                match self.pull_next()? {
                    Some(bytes) => self.send_buffer.extend_from_slice(&bytes),
                    None => break,
                }
            }
            match connection.write(&self.send_buffer) {
                Ok(0) => break,
                Ok(n) => {
                    self.send_buffer.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    // Encodes the next queued message in priority order, or None when the
    // queue has nothing sendable.
    fn pull_next(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(handshake) = self.handshake.take() {
            return Ok(Some(handshake.encode()));
        }
        if let Some(choking) = self.chokes.pop_front() {
            let message = if choking {
                Message::Choke
            } else {
                Message::Unchoke
            };
            return Ok(Some(message.encode()));
        }
        if let Some(interested) = self.interested.take() {
            let message = if interested {
                Message::Interested
            } else {
                Message::NotInterested
            };
            return Ok(Some(message.encode()));
        }
        if let Some(piece) = self.haves.pop_front() {
            return Ok(Some(Message::Have { piece }.encode()));
        }
        if let Some(message) = self.initial.pop_front() {
            return Ok(Some(message.encode()));
        }
        if let Some(signature) = self.signatures.pop_front() {
            return Ok(Some(Message::ElasticSignature(signature).encode()));
        }
        if let Some(piece) = self.allowed_fast.pop_front() {
            return Ok(Some(Message::AllowedFast { piece }.encode()));
        }
        if let Some(descriptor) = self.rejects.pop_front() {
            return Ok(Some(Message::Reject(descriptor).encode()));
        }
        if let Some(descriptor) = self.cancels.pop_front() {
            return Ok(Some(Message::Cancel(descriptor).encode()));
        }
        if let Some(descriptor) = self.pop_next_request() {
            self.outstanding.push_back(descriptor);
            return Ok(Some(Message::Request(descriptor).encode()));
        }
        if let Some(descriptor) = self.pieces.pop_front() {
            return self.encode_piece(&descriptor).map(Some);
        }
        if let Some(message) = self.extensions.pop_front() {
            return Ok(Some(message.encode()));
        }
        if self.keepalive {
            self.keepalive = false;
            return Ok(Some(Message::KeepAlive.encode()));
        }
        Ok(None)
    }

    // The next request eligible for the wire: front of the queue, or the
    // first allowed-fast request while plugged.
    fn pop_next_request(&mut self) -> Option<BlockDescriptor> {
        if !self.requests_plugged {
            return self.requests.pop_front();
        }
        let pos = self
            .requests
            .iter()
            .position(|d| self.remote_allowed_fast.contains(&d.piece_index))?;
        self.requests.remove(pos)
    }

    fn encode_piece(&mut self, descriptor: &BlockDescriptor) -> io::Result<Bytes> {
        let data = self.piece_database.read_block(descriptor)?;
        self.block_bytes_sent.add(descriptor.length as u64);

        let message = match self.piece_database.content_mode() {
            ContentMode::Classic => Message::Piece {
                index: descriptor.piece_index,
                begin: descriptor.offset,
                data,
            },
            ContentMode::Merkle => {
                let hash_chain = self
                    .piece_database
                    .piece_hash_chain(descriptor.piece_index)
                    .map(|chain| chain.hashes)
                    .unwrap_or_default();
                Message::MerklePiece {
                    index: descriptor.piece_index,
                    begin: descriptor.offset,
                    hash_chain,
                    data,
                }
            }
            ContentMode::Elastic => {
                let chain = self.piece_database.piece_hash_chain(descriptor.piece_index);
                let view_length = chain
                    .as_ref()
                    .map(|c| c.view_length)
                    .unwrap_or_else(|| self.piece_database.current_descriptor().total_length());
                Message::ElasticPiece {
                    index: descriptor.piece_index,
                    begin: descriptor.offset,
                    view_length,
                    hash_chain: chain.map(|c| c.hashes),
                    data,
                }
            }
        };

        Ok(message.encode())
    }

    fn remove_outstanding(&mut self, descriptor: &BlockDescriptor) -> bool {
        match self.outstanding.iter().position(|d| d == descriptor) {
            Some(pos) => self.outstanding.remove(pos).is_some(),
            None => false,
        }
    }
}
