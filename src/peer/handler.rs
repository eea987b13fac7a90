use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::bitfield::Bitfield;
use super::coordinator::{ManageablePeer, PeerCoordinator, PeerCoordinatorLookup};
use super::error::PeerError;
use super::extension::ExtensionUpdate;
use super::fast::generate_allowed_fast_set;
use super::message::Message;
use super::outbound::PeerOutboundQueue;
use super::parser::{PeerProtocolParser, ProtocolEvent};
use super::peer_id::PeerId;
use crate::bencode::Value;
use crate::connection::Connection;
use crate::constants::{
    ALLOWED_FAST_THRESHOLD, EXTENSION_ELASTIC, EXTENSION_MERKLE, IDLE_INTERVAL, MAX_BLOCK_LENGTH,
    SHORT_PERIOD,
};
use crate::counter::StatisticCounter;
use crate::piecedb::{
    BlockDescriptor, ContentMode, HashChain, InfoHash, PieceDatabase, StorageDescriptor,
    ViewSignature,
};

/// The engine mediating one connection to one remote peer.
///
/// A `PeerHandler` sits between the connection manager, which signals byte
/// stream readiness into [`connection_ready`](Self::connection_ready), and
/// the torrent's [`PeerCoordinator`], which owns request allocation and the
/// choking algorithm. Inbound bytes run through a [`PeerProtocolParser`];
/// each decoded event updates the handler's view of the remote peer,
/// possibly delegates to the coordinator, and possibly queues messages on
/// the [`PeerOutboundQueue`], which drains to the wire as the connection
/// accepts bytes.
///
/// An outbound handler knows its torrent at construction and queues its
/// handshake immediately. An inbound handler defers setup until the remote
/// handshake names an info hash the [`PeerCoordinatorLookup`] recognises.
/// Any protocol or I/O failure closes the connection and notifies the
/// coordinator exactly once.
pub struct PeerHandler<C: Connection> {
    connection: C,
    parser: PeerProtocolParser,
    lookup: Option<Arc<dyn PeerCoordinatorLookup>>,
    coordinator: Option<Arc<dyn PeerCoordinator>>,
    piece_database: Option<Arc<dyn PieceDatabase>>,
    queue: Option<PeerOutboundQueue>,

    fast_extension_enabled: bool,
    extension_protocol_enabled: bool,
    remote_extensions: HashMap<String, u8>,
    registered: bool,

    remote_peer_id: Option<PeerId>,
    remote_bitfield: Option<Bitfield>,
    remote_view: Option<StorageDescriptor>,
    remote_signatures: BTreeMap<u64, ViewSignature>,
    info_hash: Option<InfoHash>,

    we_are_choking: bool,
    we_are_interested: bool,
    they_are_choking: bool,
    they_are_interested: bool,

    last_data_received: Instant,
    #[cfg(test)]
    idle_elapsed_override: Option<Duration>,
    closed: bool,

    protocol_bytes_sent: StatisticCounter,
    protocol_bytes_received: StatisticCounter,
    block_bytes_sent: StatisticCounter,
    block_bytes_received: StatisticCounter,
}

impl<C: Connection> PeerHandler<C> {
    /// Creates the engine for a connection we initiated. The handshake is
    /// queued immediately.
    pub fn outbound(
        coordinator: Arc<dyn PeerCoordinator>,
        connection: C,
        fast_preference: bool,
        extension_preference: bool,
    ) -> Self {
        let mut handler = Self::new(connection, fast_preference, extension_preference);
        handler.coordinator = Some(coordinator);
        handler.complete_setup_and_handshake();
        handler
    }

    /// Creates the engine for an accepted connection. Setup completes when
    /// the remote handshake reveals an info hash the lookup recognises.
    pub fn inbound(
        lookup: Arc<dyn PeerCoordinatorLookup>,
        connection: C,
        fast_preference: bool,
        extension_preference: bool,
    ) -> Self {
        let mut handler = Self::new(connection, fast_preference, extension_preference);
        handler.lookup = Some(lookup);
        handler
    }

    fn new(connection: C, fast_preference: bool, extension_preference: bool) -> Self {
        let protocol_bytes_sent = StatisticCounter::new();
        let protocol_bytes_received = StatisticCounter::new();
        protocol_bytes_sent.add_counted_period(SHORT_PERIOD);
        protocol_bytes_received.add_counted_period(SHORT_PERIOD);

        Self {
            parser: PeerProtocolParser::new(fast_preference, extension_preference),
            connection,
            lookup: None,
            coordinator: None,
            piece_database: None,
            queue: None,
            fast_extension_enabled: fast_preference,
            extension_protocol_enabled: extension_preference,
            remote_extensions: HashMap::new(),
            registered: false,
            remote_peer_id: None,
            remote_bitfield: None,
            remote_view: None,
            remote_signatures: BTreeMap::new(),
            info_hash: None,
            we_are_choking: true,
            we_are_interested: false,
            they_are_choking: true,
            they_are_interested: false,
            last_data_received: Instant::now(),
            #[cfg(test)]
            idle_elapsed_override: None,
            closed: false,
            protocol_bytes_sent,
            protocol_bytes_received,
            block_bytes_sent: StatisticCounter::new(),
            block_bytes_received: StatisticCounter::new(),
        }
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // Time since the last byte arrived, as seen by the idle-close policy.
    fn idle_elapsed(&self) -> Duration {
        #[cfg(test)]
        if let Some(elapsed) = self.idle_elapsed_override {
            return elapsed;
        }
        self.last_data_received.elapsed()
    }

    #[cfg(test)]
    pub(crate) fn set_idle_elapsed(&mut self, elapsed: Duration) {
        self.idle_elapsed_override = Some(elapsed);
    }

    /// The torrent this peer is attached to, once known.
    pub fn info_hash(&self) -> Option<InfoHash> {
        self.info_hash
    }

    /// The hot path: called by the connection manager whenever the stream
    /// can be read or written. Runs under the coordinator's serialisation
    /// token; any error tears the connection down.
    pub fn connection_ready(&mut self, readable: bool, writable: bool) {
        if let Some(coordinator) = self.coordinator.clone() {
            coordinator.lock();
        }

        if let Err(error) = self.process_ready(readable, writable) {
            debug!(
                peer = %self.connection.remote_socket_address(),
                %error,
                "closing peer connection"
            );
            self.close();
        }

        // An inbound handler may have bound (and locked) its coordinator
        // while parsing the handshake above.
        if let Some(coordinator) = self.coordinator.clone() {
            coordinator.unlock();
        }
    }

    fn process_ready(&mut self, readable: bool, writable: bool) -> Result<(), PeerError> {
        if readable {
            self.read_and_parse()?;
        }

        if self.registered && self.we_are_interested {
            self.fill_request_queue();
        }

        if writable {
            if let Some(queue) = self.queue.as_mut() {
                let written = queue.send_data(&mut self.connection)?;
                self.protocol_bytes_sent.add(written as u64);
            }
        }

        Ok(())
    }

    fn read_and_parse(&mut self) -> Result<(), PeerError> {
        let mut buf = [0u8; 16384];
        loop {
            match self.connection.read(&mut buf) {
                Ok(0) => return Err(PeerError::ConnectionClosed),
                Ok(n) => {
                    self.protocol_bytes_received.add(n as u64);
                    self.last_data_received = Instant::now();
                    // Messages decoded ahead of a framing error are still
                    // applied in wire order before the error surfaces.
                    let parsed = self.parser.push(&buf[..n]);
                    while let Some(event) = self.parser.next_event() {
                        self.handle_event(event)?;
                    }
                    parsed?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle_event(&mut self, event: ProtocolEvent) -> Result<(), PeerError> {
        match event {
            ProtocolEvent::BasicExtensions { fast, extension } => {
                self.handshake_basic_extensions(fast, extension);
                Ok(())
            }
            ProtocolEvent::InfoHash(info_hash) => self.handshake_info_hash(info_hash),
            ProtocolEvent::PeerId(peer_id) => self.handshake_peer_id(peer_id),
            ProtocolEvent::ExtensionHandshake(update) => self.extension_handshake_message(update),
            ProtocolEvent::Message(message) => self.handle_message(message),
        }
    }

    fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            // The read loop already refreshed the idle clock.
            Message::KeepAlive => Ok(()),
            Message::Choke => self.choke_message(true),
            Message::Unchoke => self.choke_message(false),
            Message::Interested => self.interested_message(true),
            Message::NotInterested => self.interested_message(false),
            Message::Have { piece } => self.have_message(piece),
            Message::Bitfield(bytes) => self.bitfield_message(&bytes),
            Message::Request(descriptor) => self.request_message(descriptor),
            Message::Piece { index, begin, data } => self.piece_message(index, begin, data),
            Message::Cancel(descriptor) => self.cancel_message(descriptor),
            Message::Suggest { piece } => self.suggest_piece_message(piece),
            Message::HaveAll => self.have_all_message(),
            Message::HaveNone => self.have_none_message(),
            Message::Reject(descriptor) => self.reject_request_message(descriptor),
            Message::AllowedFast { piece } => self.allowed_fast_message(piece),
            Message::Extended { id, payload } => self.extension_message(id, payload),
            Message::MerklePiece {
                index,
                begin,
                hash_chain,
                data,
            } => self.merkle_piece_message(index, begin, hash_chain, data),
            Message::ElasticSignature(signature) => self.elastic_signature_message(signature),
            Message::ElasticPiece {
                index,
                begin,
                view_length,
                hash_chain,
                data,
            } => self.elastic_piece_message(index, begin, view_length, hash_chain, data),
            Message::ElasticBitfield(bytes) => self.elastic_bitfield_message(&bytes),
            Message::Unknown { id, .. } => {
                trace!(id, "ignoring unknown message");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Handshake events
    // ------------------------------------------------------------------

    fn handshake_basic_extensions(&mut self, fast: bool, extension: bool) {
        self.fast_extension_enabled &= fast;
        self.extension_protocol_enabled &= extension;
        if let Some(queue) = self.queue.as_mut() {
            queue.set_fast_extension(self.fast_extension_enabled);
        }
    }

    fn handshake_info_hash(&mut self, info_hash: InfoHash) -> Result<(), PeerError> {
        if let Some(expected) = self.info_hash {
            if expected != info_hash {
                return Err(PeerError::InfoHashMismatch);
            }
        }

        // An inbound connection does not know its torrent until now. Bind
        // the coordinator, take its token (connection_ready could not), and
        // complete setup.
        if self.coordinator.is_none() {
            self.info_hash = Some(info_hash);

            let coordinator = self
                .lookup
                .as_ref()
                .and_then(|lookup| lookup.coordinator_for(&info_hash))
                .ok_or(PeerError::InfoHashMismatch)?;

            coordinator.lock();
            self.coordinator = Some(coordinator);
            self.complete_setup_and_handshake();
        }

        let database = self.database()?;
        match database.content_mode() {
            ContentMode::Elastic => {
                if !(self.fast_extension_enabled && self.extension_protocol_enabled) {
                    return Err(PeerError::Protocol(
                        "elastic torrent requires the fast extension and extension protocol"
                            .into(),
                    ));
                }
                self.queue_mut()?.send_extension_handshake(
                    vec![EXTENSION_ELASTIC.to_string()],
                    Vec::new(),
                    None,
                )?;
                let current = database.current_descriptor();
                if current.total_length() > database.initial_descriptor().total_length() {
                    if let Some(signature) = database.view_signature(current.total_length()) {
                        self.queue_mut()?.send_elastic_signature_message(signature);
                    }
                    let present = database.present_pieces();
                    self.queue_mut()?.send_elastic_bitfield_message(&present);
                }
            }
            ContentMode::Merkle => {
                self.queue_mut()?.send_extension_handshake(
                    vec![EXTENSION_MERKLE.to_string()],
                    Vec::new(),
                    None,
                )?;
            }
            ContentMode::Classic => {}
        }

        if self.extension_protocol_enabled {
            let coordinator = self.coordinator()?;
            coordinator.offer_extensions_to_peer(self);
        }

        Ok(())
    }

    fn handshake_peer_id(&mut self, peer_id: PeerId) -> Result<(), PeerError> {
        self.remote_peer_id = Some(peer_id);

        let coordinator = self.coordinator()?;
        if !coordinator.peer_connected(self) {
            return Err(PeerError::RegistrationRejected);
        }
        self.registered = true;

        // Initial availability announcement.
        let database = self.database()?;
        let bitfield = database.present_pieces();
        let cardinality = bitfield.cardinality();
        let num_pieces = database.current_descriptor().num_pieces() as usize;
        let elastic = database.content_mode().is_elastic();
        let fast = self.fast_extension_enabled;

        let queue = self.queue_mut()?;
        if elastic {
            queue.send_have_none_message();
        } else if fast {
            if cardinality == 0 {
                queue.send_have_none_message();
            } else if cardinality == num_pieces {
                queue.send_have_all_message();
            } else {
                queue.send_bitfield_message(&bitfield);
            }
        } else if cardinality > 0 {
            queue.send_bitfield_message(&bitfield);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Protocol messages
    // ------------------------------------------------------------------

    fn choke_message(&mut self, choked: bool) -> Result<(), PeerError> {
        self.they_are_choking = choked;

        let fast = self.fast_extension_enabled;
        let queue = self.queue_mut()?;
        queue.set_requests_plugged(choked);
        if choked && !fast {
            // The base protocol implicitly cancels everything in flight.
            queue.requeue_all_request_messages();
        }

        // New requests, if any, are queued from connection_ready once all
        // read processing has finished.
        Ok(())
    }

    fn interested_message(&mut self, interested: bool) -> Result<(), PeerError> {
        self.they_are_interested = interested;
        let coordinator = self.coordinator()?;
        let we_are_choking = self.we_are_choking;
        coordinator.adjust_choking(self, we_are_choking);
        Ok(())
    }

    fn have_message(&mut self, piece: u32) -> Result<(), PeerError> {
        let database = self.database()?;
        if piece >= database.current_descriptor().num_pieces() {
            return Err(PeerError::Protocol(format!(
                "have for piece {} out of range",
                piece
            )));
        }

        let newly_available = {
            let bitfield = self.bitfield_mut()?;
            if bitfield.has(piece as usize) {
                false
            } else {
                bitfield.set(piece as usize);
                true
            }
        };

        if newly_available {
            let coordinator = self.coordinator()?;
            if coordinator.add_available_piece(self, piece) && !self.we_are_interested {
                self.we_are_interested = true;
                self.queue_mut()?.send_interested_message(true);
            }
        }

        // A peer that has grown past the threshold no longer needs its
        // allowed-fast grant.
        if self.bitfield()?.cardinality() == ALLOWED_FAST_THRESHOLD {
            self.queue_mut()?.clear_allowed_fast_pieces();
        }

        Ok(())
    }

    fn bitfield_message(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        let num_pieces = self.view()?.num_pieces() as usize;
        self.remote_bitfield = Some(Bitfield::from_bytes(bytes, num_pieces)?);

        let coordinator = self.coordinator()?;
        if coordinator.add_available_pieces(self) {
            self.we_are_interested = true;
            self.queue_mut()?.send_interested_message(true);
        }

        let database = self.database()?;
        if self.fast_extension_enabled
            && !database.content_mode().is_elastic()
            && self.bitfield()?.cardinality() < ALLOWED_FAST_THRESHOLD
        {
            self.generate_and_send_allowed_fast_set()?;
        }

        Ok(())
    }

    fn request_message(&mut self, descriptor: BlockDescriptor) -> Result<(), PeerError> {
        self.validate_block_descriptor(&descriptor)?;

        let database = self.database()?;
        if database.have_piece(descriptor.piece_index) {
            // Serve the request if unchoked. While choking: the base
            // protocol stays silent, the fast extension serves allowed-fast
            // pieces and rejects the rest.
            if !self.we_are_choking {
                self.queue_mut()?.send_piece_message(descriptor);
            } else if self.fast_extension_enabled {
                let queue = self.queue_mut()?;
                if queue.is_piece_allowed_fast(descriptor.piece_index) {
                    queue.send_piece_message(descriptor);
                } else {
                    queue.send_reject_request_message(descriptor);
                }
            }
        } else if self.fast_extension_enabled {
            self.queue_mut()?.send_reject_request_message(descriptor);
        } else {
            return Err(PeerError::Protocol(format!(
                "request for absent piece {}",
                descriptor.piece_index
            )));
        }

        Ok(())
    }

    fn piece_message(&mut self, index: u32, begin: u32, data: Bytes) -> Result<(), PeerError> {
        let database = self.database()?;
        match database.content_mode() {
            ContentMode::Merkle => {
                return Err(PeerError::Protocol(
                    "plain piece on a merkle torrent".into(),
                ))
            }
            ContentMode::Elastic => {
                return Err(PeerError::Protocol(
                    "plain piece on an elastic torrent".into(),
                ))
            }
            ContentMode::Classic => {}
        }

        let descriptor = BlockDescriptor::new(index, begin, data.len() as u32);
        self.validate_block_descriptor(&descriptor)?;
        self.deliver_block(descriptor, None, None, data)
    }

    fn merkle_piece_message(
        &mut self,
        index: u32,
        begin: u32,
        hash_chain: Bytes,
        data: Bytes,
    ) -> Result<(), PeerError> {
        let database = self.database()?;
        if !database.content_mode().is_merkle() {
            return Err(PeerError::Protocol(
                "merkle piece on a non-merkle torrent".into(),
            ));
        }

        let descriptor = BlockDescriptor::new(index, begin, data.len() as u32);
        self.validate_block_descriptor(&descriptor)?;

        let chain = HashChain::new(database.current_descriptor().total_length(), hash_chain);
        self.deliver_block(descriptor, None, Some(chain), data)
    }

    fn elastic_piece_message(
        &mut self,
        index: u32,
        begin: u32,
        view_length: u64,
        hash_chain: Option<Bytes>,
        data: Bytes,
    ) -> Result<(), PeerError> {
        let database = self.database()?;
        if !database.content_mode().is_elastic() {
            return Err(PeerError::Protocol(
                "elastic piece on a non-elastic torrent".into(),
            ));
        }

        let descriptor = BlockDescriptor::new(index, begin, data.len() as u32);
        self.validate_block_descriptor(&descriptor)?;

        if !self.queue_mut()?.request_received(&descriptor) {
            return self.unrequested_piece();
        }

        // A chain is only usable under a view we hold a signature for.
        let signature = match &hash_chain {
            Some(_) => Some(
                self.remote_signatures
                    .get(&view_length)
                    .cloned()
                    .ok_or_else(|| {
                        PeerError::Protocol("elastic piece under unknown view".into())
                    })?,
            ),
            None => None,
        };
        let chain = hash_chain.map(|hashes| HashChain::new(view_length, hashes));

        self.block_bytes_received.add(descriptor.length as u64);
        let coordinator = self.coordinator()?;
        coordinator.handle_block(
            self,
            &descriptor,
            signature.as_ref(),
            chain.as_ref(),
            data,
        );
        Ok(())
    }

    fn cancel_message(&mut self, descriptor: BlockDescriptor) -> Result<(), PeerError> {
        self.validate_block_descriptor(&descriptor)?;

        let fast = self.fast_extension_enabled;
        let queue = self.queue_mut()?;
        let removed = queue.discard_piece_message(&descriptor);
        if fast && removed {
            queue.send_reject_request_message(descriptor);
        }

        Ok(())
    }

    fn suggest_piece_message(&mut self, piece: u32) -> Result<(), PeerError> {
        let database = self.database()?;
        if piece >= database.current_descriptor().num_pieces() {
            return Err(PeerError::Protocol(format!(
                "suggest for piece {} out of range",
                piece
            )));
        }

        // Suggestions for pieces the remote does not hold are dropped.
        if self.bitfield()?.has(piece as usize) {
            let coordinator = self.coordinator()?;
            coordinator.set_piece_suggested(self, piece);
        }

        Ok(())
    }

    fn have_all_message(&mut self) -> Result<(), PeerError> {
        // The bitfield is still all zero (the parser guarantees this is the
        // first message), so inverting sets every bit.
        self.bitfield_mut()?.invert();

        let coordinator = self.coordinator()?;
        if coordinator.add_available_pieces(self) {
            self.we_are_interested = true;
            self.queue_mut()?.send_interested_message(true);
        }

        Ok(())
    }

    fn have_none_message(&mut self) -> Result<(), PeerError> {
        // The bitfield is already all zero.
        let database = self.database()?;
        if !database.content_mode().is_elastic() {
            self.generate_and_send_allowed_fast_set()?;
        }
        Ok(())
    }

    fn reject_request_message(&mut self, descriptor: BlockDescriptor) -> Result<(), PeerError> {
        if !self.queue_mut()?.reject_received(&descriptor) {
            return Err(PeerError::Protocol(
                "reject for a request that is not outstanding".into(),
            ));
        }
        Ok(())
    }

    fn allowed_fast_message(&mut self, piece: u32) -> Result<(), PeerError> {
        if piece as usize >= self.bitfield()?.len() {
            return Err(PeerError::Protocol(format!(
                "allowed fast for piece {} out of range",
                piece
            )));
        }

        // Peers may mark pieces they do not hold allowed-fast; such grants
        // are useless and dropped.
        if self.bitfield()?.has(piece as usize) {
            let coordinator = self.coordinator()?;
            coordinator.set_piece_allowed_fast(self, piece);
            self.queue_mut()?.set_request_allowed_fast(piece);
        }

        Ok(())
    }

    fn extension_handshake_message(&mut self, update: ExtensionUpdate) -> Result<(), PeerError> {
        for (name, id) in &update.added {
            self.remote_extensions.insert(name.clone(), *id);
        }
        for name in &update.removed {
            self.remote_extensions.remove(name);
        }

        let coordinator = self.coordinator()?;
        let added = update.added.into_iter().map(|(name, _)| name).collect();
        coordinator.enable_disable_peer_extensions(self, added, update.removed, update.extra);
        Ok(())
    }

    fn extension_message(&mut self, id: u8, payload: Bytes) -> Result<(), PeerError> {
        let coordinator = self.coordinator()?;
        coordinator.process_extension_message(self, id, payload);
        Ok(())
    }

    fn elastic_signature_message(&mut self, signature: ViewSignature) -> Result<(), PeerError> {
        let piece_size = self.database()?.current_descriptor().piece_size();

        {
            let view = self.view_mut()?;
            if signature.view_length > view.total_length() {
                *view = StorageDescriptor::new(view.piece_size(), signature.view_length);
            }
        }

        let view_num_pieces = signature.view_length.div_ceil(piece_size as u64) as usize;
        let bitfield = self.bitfield_mut()?;
        if view_num_pieces > bitfield.len() {
            bitfield.extend(view_num_pieces);
        }

        let coordinator = self.coordinator()?;
        if !coordinator.handle_view_signature(&signature) {
            return Err(PeerError::Protocol(
                "view signature failed verification".into(),
            ));
        }

        if self.remote_signatures.len() > 1 {
            let _ = self.remote_signatures.pop_first();
        }
        self.remote_signatures
            .insert(signature.view_length, signature);

        Ok(())
    }

    fn elastic_bitfield_message(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        // TODO replace the delegation when a distinct growable encoding for
        // elastic bitfields is settled.
        self.bitfield_message(bytes)
    }

    // ------------------------------------------------------------------
    // Shared paths
    // ------------------------------------------------------------------

    // Outstanding-request check and delivery shared by the classic and
    // merkle piece paths.
    fn deliver_block(
        &mut self,
        descriptor: BlockDescriptor,
        signature: Option<ViewSignature>,
        chain: Option<HashChain>,
        data: Bytes,
    ) -> Result<(), PeerError> {
        if !self.queue_mut()?.request_received(&descriptor) {
            return self.unrequested_piece();
        }

        self.block_bytes_received.add(descriptor.length as u64);
        let coordinator = self.coordinator()?;
        coordinator.handle_block(
            self,
            &descriptor,
            signature.as_ref(),
            chain.as_ref(),
            data,
        );
        Ok(())
    }

    // A piece we did not ask for: fatal under the fast extension, silently
    // dropped otherwise (the base protocol cannot distinguish spam from a
    // cancelled request's late arrival).
    fn unrequested_piece(&mut self) -> Result<(), PeerError> {
        if self.fast_extension_enabled {
            return Err(PeerError::Protocol("unrequested piece".into()));
        }
        Ok(())
    }

    fn validate_block_descriptor(&self, descriptor: &BlockDescriptor) -> Result<(), PeerError> {
        let database = self.database()?;
        let storage = database.current_descriptor();

        let valid = descriptor.piece_index < storage.num_pieces()
            && descriptor.length > 0
            && descriptor.length <= MAX_BLOCK_LENGTH
            && descriptor.offset as u64 + descriptor.length as u64
                <= storage.piece_length(descriptor.piece_index) as u64;

        if valid {
            Ok(())
        } else {
            Err(PeerError::Protocol(format!(
                "invalid block descriptor ({}, {}, {})",
                descriptor.piece_index, descriptor.offset, descriptor.length
            )))
        }
    }

    fn generate_and_send_allowed_fast_set(&mut self) -> Result<(), PeerError> {
        // Only IPv4 peers get an allowed-fast set.
        let SocketAddr::V4(addr) = self.connection.remote_socket_address() else {
            return Ok(());
        };

        let database = self.database()?;
        let num_pieces = database.current_descriptor().num_pieces();
        let count = ALLOWED_FAST_THRESHOLD.min(num_pieces as usize);
        let set =
            generate_allowed_fast_set(database.info_hash().as_bytes(), *addr.ip(), num_pieces, count);
        self.queue_mut()?.send_allowed_fast_messages(set);
        Ok(())
    }

    // Tops the request pipeline up from the coordinator. When it has
    // nothing for us and nothing is in flight, our interest lapses.
    fn fill_request_queue(&mut self) {
        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };
        let Some(queue) = self.queue.as_ref() else {
            return;
        };

        let needed = queue.get_requests_needed();
        if needed == 0 {
            return;
        }

        let they_are_choking = self.they_are_choking;
        let requests = coordinator.get_requests(self, needed, they_are_choking);
        if !requests.is_empty() {
            if let Some(queue) = self.queue.as_mut() {
                queue.send_request_messages(requests);
            }
        } else if !they_are_choking
            && !self.queue.as_ref().is_some_and(|q| q.has_outstanding_requests())
        {
            self.we_are_interested = false;
            if let Some(queue) = self.queue.as_mut() {
                queue.send_interested_message(false);
            }
        }
    }

    // Binds the piece database and outbound queue and queues our handshake.
    // Runs at construction for outbound connections, and on receipt of a
    // recognised info hash for inbound ones.
    fn complete_setup_and_handshake(&mut self) {
        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };

        let database = coordinator.piece_database();
        let initial = database.initial_descriptor();
        self.remote_bitfield = Some(Bitfield::new(initial.num_pieces() as usize));
        self.remote_view = Some(initial);
        self.info_hash = Some(database.info_hash());

        let mut queue = PeerOutboundQueue::new(
            database.clone(),
            self.fast_extension_enabled,
            self.block_bytes_sent.clone(),
        );
        queue.send_handshake(
            self.fast_extension_enabled,
            self.extension_protocol_enabled,
            database.info_hash(),
            coordinator.local_peer_id(),
        );
        self.queue = Some(queue);
        self.piece_database = Some(database);

        self.protocol_bytes_sent
            .set_parent(&coordinator.protocol_bytes_sent_counter());
        self.protocol_bytes_received
            .set_parent(&coordinator.protocol_bytes_received_counter());
        self.block_bytes_sent
            .set_parent(&coordinator.block_bytes_sent_counter());
        self.block_bytes_received
            .set_parent(&coordinator.block_bytes_received_counter());
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    fn coordinator(&self) -> Result<Arc<dyn PeerCoordinator>, PeerError> {
        self.coordinator
            .clone()
            .ok_or_else(|| PeerError::Protocol("no coordinator bound".into()))
    }

    fn database(&self) -> Result<Arc<dyn PieceDatabase>, PeerError> {
        self.piece_database
            .clone()
            .ok_or_else(|| PeerError::Protocol("message before handshake".into()))
    }

    fn queue_mut(&mut self) -> Result<&mut PeerOutboundQueue, PeerError> {
        self.queue
            .as_mut()
            .ok_or_else(|| PeerError::Protocol("message before handshake".into()))
    }

    fn bitfield(&self) -> Result<&Bitfield, PeerError> {
        self.remote_bitfield
            .as_ref()
            .ok_or_else(|| PeerError::Protocol("message before handshake".into()))
    }

    fn bitfield_mut(&mut self) -> Result<&mut Bitfield, PeerError> {
        self.remote_bitfield
            .as_mut()
            .ok_or_else(|| PeerError::Protocol("message before handshake".into()))
    }

    fn view(&self) -> Result<StorageDescriptor, PeerError> {
        self.remote_view
            .ok_or_else(|| PeerError::Protocol("message before handshake".into()))
    }

    fn view_mut(&mut self) -> Result<&mut StorageDescriptor, PeerError> {
        self.remote_view
            .as_mut()
            .ok_or_else(|| PeerError::Protocol("message before handshake".into()))
    }
}

impl<C: Connection> ManageablePeer for PeerHandler<C> {
    fn remote_peer_id(&self) -> Option<PeerId> {
        self.remote_peer_id
    }

    fn remote_socket_address(&self) -> SocketAddr {
        self.connection.remote_socket_address()
    }

    fn remote_bitfield(&self) -> Option<&Bitfield> {
        self.remote_bitfield.as_ref()
    }

    fn remote_view_length(&self) -> Option<u64> {
        self.remote_view.map(|view| view.total_length())
    }

    fn we_are_choking(&self) -> bool {
        self.we_are_choking
    }

    fn we_are_interested(&self) -> bool {
        self.we_are_interested
    }

    fn they_are_choking(&self) -> bool {
        self.they_are_choking
    }

    fn they_are_interested(&self) -> bool {
        self.they_are_interested
    }

    fn fast_extension_enabled(&self) -> bool {
        self.fast_extension_enabled
    }

    fn extension_protocol_enabled(&self) -> bool {
        self.extension_protocol_enabled
    }

    fn they_have_outstanding_requests(&self) -> bool {
        self.queue
            .as_ref()
            .is_some_and(|queue| queue.get_unsent_piece_count() > 0)
    }

    fn protocol_bytes_sent(&self) -> u64 {
        self.protocol_bytes_sent.total()
    }

    fn protocol_bytes_received(&self) -> u64 {
        self.protocol_bytes_received.total()
    }

    fn block_bytes_sent(&self) -> u64 {
        self.block_bytes_sent.total()
    }

    fn block_bytes_received(&self) -> u64 {
        self.block_bytes_received.total()
    }

    fn protocol_bytes_received_per_second(&self) -> u64 {
        self.protocol_bytes_received.period_total(SHORT_PERIOD) / 2
    }

    fn protocol_bytes_sent_per_second(&self) -> u64 {
        self.protocol_bytes_sent.period_total(SHORT_PERIOD) / 2
    }

    fn block_bytes_received_counter(&self) -> StatisticCounter {
        self.block_bytes_received.clone()
    }

    fn block_bytes_sent_counter(&self) -> StatisticCounter {
        self.block_bytes_sent.clone()
    }

    fn set_we_are_choking(&mut self, choking: bool) -> bool {
        if choking == self.we_are_choking {
            return false;
        }
        self.we_are_choking = choking;

        let fast = self.fast_extension_enabled;
        if let Some(queue) = self.queue.as_mut() {
            // Unsent piece sends, other than allowed-fast ones already
            // granted, do not survive a choke.
            let dropped = queue.send_choke_message(choking);
            if fast {
                queue.send_reject_request_messages(dropped);
            }
        }
        true
    }

    fn set_we_are_interested(&mut self, interested: bool) {
        if interested == self.we_are_interested {
            return;
        }
        self.we_are_interested = interested;
        if let Some(queue) = self.queue.as_mut() {
            queue.send_interested_message(interested);
        }
    }

    fn cancel_requests(&mut self, requests: &[BlockDescriptor]) {
        // Under the fast extension a cancelled request stays tracked until
        // the remote answers with the piece or an explicit reject.
        let fast = self.fast_extension_enabled;
        if let Some(queue) = self.queue.as_mut() {
            for descriptor in requests {
                queue.send_cancel_message(*descriptor, fast);
            }
        }
    }

    fn reject_piece(&mut self, piece: u32) {
        if let Some(queue) = self.queue.as_mut() {
            queue.reject_piece_messages(piece);
        }
    }

    fn send_have_piece(&mut self, piece: u32) {
        if let Some(queue) = self.queue.as_mut() {
            queue.send_have_message(piece);
        }
    }

    fn send_keepalive_or_close(&mut self) {
        if self.idle_elapsed() > IDLE_INTERVAL {
            debug!(
                peer = %self.connection.remote_socket_address(),
                "closing idle peer connection"
            );
            self.close();
        } else if let Some(queue) = self.queue.as_mut() {
            queue.send_keepalive_message();
        }
    }

    fn send_view_signature(&mut self, signature: ViewSignature) {
        if let Some(queue) = self.queue.as_mut() {
            queue.send_elastic_signature_message(signature);
        }
    }

    fn send_extension_handshake(
        &mut self,
        added: Vec<String>,
        removed: Vec<String>,
        extra: Option<Value>,
    ) {
        if let Some(queue) = self.queue.as_mut() {
            if let Err(error) = queue.send_extension_handshake(added, removed, extra) {
                warn!(%error, "failed to encode extension handshake");
            }
        }
    }

    fn send_extension_message(&mut self, name: &str, data: Bytes) {
        let Some(id) = self.remote_extensions.get(name).copied() else {
            warn!(name, "dropping message for extension the peer does not support");
            return;
        };
        if let Some(queue) = self.queue.as_mut() {
            queue.send_extension_message(id, data);
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(error) = self.connection.close() {
            trace!(%error, "error closing connection");
        }

        if let Some(coordinator) = self.coordinator.clone() {
            coordinator.peer_disconnected(self);
        }
    }
}
