use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::*;
use crate::connection::Connection;
use crate::constants::{EXTENSION_ELASTIC, IDLE_INTERVAL, MAX_MESSAGE_LENGTH};
use crate::counter::StatisticCounter;
use crate::Value;
use crate::piecedb::{
    BlockDescriptor, ContentMode, HashChain, InfoHash, PieceDatabase, StorageDescriptor,
    ViewSignature,
};

const BLOCK: u32 = 16384;
const TEST_INFO_HASH: [u8; 20] = [0xAA; 20];

fn desc(piece: u32, offset: u32, length: u32) -> BlockDescriptor {
    BlockDescriptor::new(piece, offset, length)
}

// =========================================================================
// Test doubles
// =========================================================================

#[derive(Clone, Default)]
struct WireHandles {
    incoming: Arc<Mutex<VecDeque<Vec<u8>>>>,
    written: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
}

impl WireHandles {
    fn feed(&self, bytes: impl AsRef<[u8]>) {
        self.incoming.lock().push_back(bytes.as_ref().to_vec());
    }

    fn written_messages(&self) -> (Option<Handshake>, Vec<Message>) {
        decode_wire(&self.written.lock())
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

struct MockConnection {
    handles: WireHandles,
    remote: SocketAddr,
    max_per_write: Option<usize>,
}

impl MockConnection {
    fn new(remote: &str) -> (Self, WireHandles) {
        let handles = WireHandles::default();
        let conn = Self {
            handles: handles.clone(),
            remote: remote.parse().unwrap(),
            max_per_write: None,
        };
        (conn, handles)
    }
}

impl Connection for MockConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut incoming = self.handles.incoming.lock();
        let Some(mut chunk) = incoming.pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        let rest = chunk.split_off(n);
        if !rest.is_empty() {
            incoming.push_front(rest);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.max_per_write.map_or(buf.len(), |max| max.min(buf.len()));
        self.handles.written.lock().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn remote_socket_address(&self) -> SocketAddr {
        self.remote
    }

    fn close(&mut self) -> io::Result<()> {
        *self.handles.closed.lock() = true;
        Ok(())
    }
}

// Splits captured wire bytes back into a handshake and framed messages.
fn decode_wire(bytes: &[u8]) -> (Option<Handshake>, Vec<Message>) {
    let mut rest = bytes;

    let handshake = if rest.len() >= 68 && rest[0] == 19 && &rest[1..20] == b"BitTorrent protocol"
    {
        let handshake = Handshake::decode(&rest[..68]).unwrap();
        rest = &rest[68..];
        Some(handshake)
    } else {
        None
    };

    let mut messages = Vec::new();
    while !rest.is_empty() {
        assert!(rest.len() >= 4, "truncated frame on the wire");
        let length = u32::from_be_bytes(rest[..4].try_into().unwrap()) as usize;
        rest = &rest[4..];
        if length == 0 {
            messages.push(Message::KeepAlive);
            continue;
        }
        assert!(rest.len() >= length, "truncated frame on the wire");
        messages.push(Message::decode(Bytes::copy_from_slice(&rest[..length])).unwrap());
        rest = &rest[length..];
    }

    (handshake, messages)
}

struct MockDatabase {
    mode: ContentMode,
    initial: StorageDescriptor,
    current: Mutex<StorageDescriptor>,
    present: Mutex<Bitfield>,
    view_signatures: Mutex<HashMap<u64, ViewSignature>>,
}

impl MockDatabase {
    fn new(mode: ContentMode, piece_size: u32, num_pieces: u32, present: &[u32]) -> Arc<Self> {
        let total = piece_size as u64 * num_pieces as u64;
        let descriptor = StorageDescriptor::new(piece_size, total);
        let mut bitfield = Bitfield::new(num_pieces as usize);
        for &piece in present {
            bitfield.set(piece as usize);
        }
        Arc::new(Self {
            mode,
            initial: descriptor,
            current: Mutex::new(descriptor),
            present: Mutex::new(bitfield),
            view_signatures: Mutex::new(HashMap::new()),
        })
    }
}

impl PieceDatabase for MockDatabase {
    fn content_mode(&self) -> ContentMode {
        self.mode
    }

    fn info_hash(&self) -> InfoHash {
        InfoHash(TEST_INFO_HASH)
    }

    fn initial_descriptor(&self) -> StorageDescriptor {
        self.initial
    }

    fn current_descriptor(&self) -> StorageDescriptor {
        *self.current.lock()
    }

    fn present_pieces(&self) -> Bitfield {
        self.present.lock().clone()
    }

    fn have_piece(&self, index: u32) -> bool {
        self.present.lock().has(index as usize)
    }

    fn view_signature(&self, view_length: u64) -> Option<ViewSignature> {
        self.view_signatures.lock().get(&view_length).cloned()
    }

    fn piece_hash_chain(&self, _piece: u32) -> Option<HashChain> {
        None
    }

    fn read_block(&self, descriptor: &BlockDescriptor) -> io::Result<Bytes> {
        Ok(Bytes::from(vec![0u8; descriptor.length as usize]))
    }
}

#[derive(Default)]
struct CoordinatorState {
    wanted: bool,
    accept_peer: bool,
    verify_signatures: bool,
    scripted_requests: VecDeque<BlockDescriptor>,
    connected: usize,
    disconnected: usize,
    lock_depth: i64,
    blocks: Vec<(BlockDescriptor, bool, bool, usize)>,
    verified_signatures: Vec<u64>,
    suggested: Vec<u32>,
    allowed_fast: Vec<u32>,
    extensions_added: Vec<String>,
    extension_messages: Vec<(u8, usize)>,
}

struct MockCoordinator {
    database: Arc<MockDatabase>,
    state: Mutex<CoordinatorState>,
    parents: [StatisticCounter; 4],
}

impl MockCoordinator {
    fn new(database: Arc<MockDatabase>) -> Arc<Self> {
        Arc::new(Self {
            database,
            state: Mutex::new(CoordinatorState {
                wanted: true,
                accept_peer: true,
                verify_signatures: true,
                ..CoordinatorState::default()
            }),
            parents: Default::default(),
        })
    }

    fn script_requests(&self, requests: &[BlockDescriptor]) {
        self.state.lock().scripted_requests.extend(requests);
    }
}

impl PeerCoordinator for MockCoordinator {
    fn lock(&self) {
        self.state.lock().lock_depth += 1;
    }

    fn unlock(&self) {
        self.state.lock().lock_depth -= 1;
    }

    fn local_peer_id(&self) -> PeerId {
        PeerId([0x11; 20])
    }

    fn piece_database(&self) -> Arc<dyn PieceDatabase> {
        self.database.clone()
    }

    fn peer_connected(&self, _peer: &mut dyn ManageablePeer) -> bool {
        let mut state = self.state.lock();
        state.connected += 1;
        state.accept_peer
    }

    fn peer_disconnected(&self, _peer: &mut dyn ManageablePeer) {
        self.state.lock().disconnected += 1;
    }

    fn get_requests(
        &self,
        _peer: &mut dyn ManageablePeer,
        count: usize,
        remote_is_choking: bool,
    ) -> Vec<BlockDescriptor> {
        let mut state = self.state.lock();
        if remote_is_choking {
            return Vec::new();
        }
        let n = count.min(state.scripted_requests.len());
        state.scripted_requests.drain(..n).collect()
    }

    fn add_available_piece(&self, _peer: &mut dyn ManageablePeer, _piece: u32) -> bool {
        self.state.lock().wanted
    }

    fn add_available_pieces(&self, _peer: &mut dyn ManageablePeer) -> bool {
        self.state.lock().wanted
    }

    fn set_piece_suggested(&self, _peer: &mut dyn ManageablePeer, piece: u32) {
        self.state.lock().suggested.push(piece);
    }

    fn set_piece_allowed_fast(&self, _peer: &mut dyn ManageablePeer, piece: u32) {
        self.state.lock().allowed_fast.push(piece);
    }

    fn handle_block(
        &self,
        _peer: &mut dyn ManageablePeer,
        descriptor: &BlockDescriptor,
        signature: Option<&ViewSignature>,
        hash_chain: Option<&HashChain>,
        data: Bytes,
    ) {
        self.state.lock().blocks.push((
            *descriptor,
            signature.is_some(),
            hash_chain.is_some(),
            data.len(),
        ));
    }

    fn handle_view_signature(&self, signature: &ViewSignature) -> bool {
        let mut state = self.state.lock();
        state.verified_signatures.push(signature.view_length);
        state.verify_signatures
    }

    fn adjust_choking(&self, _peer: &mut dyn ManageablePeer, _we_are_choking: bool) {}

    fn offer_extensions_to_peer(&self, _peer: &mut dyn ManageablePeer) {}

    fn enable_disable_peer_extensions(
        &self,
        _peer: &mut dyn ManageablePeer,
        added: Vec<String>,
        _removed: Vec<String>,
        _extra: Option<Value>,
    ) {
        self.state.lock().extensions_added.extend(added);
    }

    fn process_extension_message(&self, _peer: &mut dyn ManageablePeer, id: u8, data: Bytes) {
        self.state.lock().extension_messages.push((id, data.len()));
    }

    fn protocol_bytes_sent_counter(&self) -> StatisticCounter {
        self.parents[0].clone()
    }

    fn protocol_bytes_received_counter(&self) -> StatisticCounter {
        self.parents[1].clone()
    }

    fn block_bytes_sent_counter(&self) -> StatisticCounter {
        self.parents[2].clone()
    }

    fn block_bytes_received_counter(&self) -> StatisticCounter {
        self.parents[3].clone()
    }
}

struct MockLookup {
    coordinator: Option<Arc<MockCoordinator>>,
}

impl PeerCoordinatorLookup for MockLookup {
    fn coordinator_for(&self, info_hash: &InfoHash) -> Option<Arc<dyn PeerCoordinator>> {
        let coordinator = self.coordinator.as_ref()?;
        if coordinator.database.info_hash() == *info_hash {
            Some(coordinator.clone())
        } else {
            None
        }
    }
}

fn remote_handshake(fast: bool, extension: bool) -> Vec<u8> {
    remote_handshake_for(TEST_INFO_HASH, fast, extension)
}

fn remote_handshake_for(info_hash: [u8; 20], fast: bool, extension: bool) -> Vec<u8> {
    Handshake::new(info_hash, [0x22; 20], fast, extension)
        .encode()
        .to_vec()
}

// An outbound handler attached to a mock coordinator, with the remote
// handshake already exchanged.
fn connected_handler(
    database: Arc<MockDatabase>,
    remote: &str,
    remote_fast: bool,
    remote_extension: bool,
) -> (PeerHandler<MockConnection>, Arc<MockCoordinator>, WireHandles) {
    let coordinator = MockCoordinator::new(database);
    let (conn, wire) = MockConnection::new(remote);
    let mut handler = PeerHandler::outbound(coordinator.clone(), conn, true, true);
    wire.feed(remote_handshake(remote_fast, remote_extension));
    handler.connection_ready(true, true);
    assert!(!handler.is_closed(), "setup handshake failed");
    (handler, coordinator, wire)
}

// =========================================================================
// Codec
// =========================================================================

#[test]
fn handshake_round_trip_and_capability_bits() {
    let handshake = Handshake::new([1; 20], [2; 20], true, true);
    let decoded = Handshake::decode(&handshake.encode()).unwrap();
    assert_eq!(decoded.info_hash, [1; 20]);
    assert_eq!(decoded.peer_id, [2; 20]);
    assert!(decoded.supports_fast_extension());
    assert!(decoded.supports_extension_protocol());

    let plain = Handshake::new([1; 20], [2; 20], false, false);
    let decoded = Handshake::decode(&plain.encode()).unwrap();
    assert!(!decoded.supports_fast_extension());
    assert!(!decoded.supports_extension_protocol());
}

fn round_trip(message: Message) -> Message {
    let encoded = message.encode();
    let length = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
    assert_eq!(length + 4, encoded.len());
    Message::decode(encoded.slice(4..)).unwrap()
}

#[test]
fn merkle_piece_round_trip() {
    let decoded = round_trip(Message::MerklePiece {
        index: 3,
        begin: 16384,
        hash_chain: Bytes::from(vec![0xAB; 60]),
        data: Bytes::from(vec![0xCD; 100]),
    });
    let Message::MerklePiece {
        index,
        begin,
        hash_chain,
        data,
    } = decoded
    else {
        panic!("expected merkle piece");
    };
    assert_eq!((index, begin), (3, 16384));
    assert_eq!(hash_chain.len(), 60);
    assert_eq!(data.len(), 100);
}

#[test]
fn elastic_signature_round_trip() {
    let signature = ViewSignature::new(1 << 30, [7; 20], Bytes::from(vec![9; 40]));
    let decoded = round_trip(Message::ElasticSignature(signature.clone()));
    let Message::ElasticSignature(decoded) = decoded else {
        panic!("expected elastic signature");
    };
    assert_eq!(decoded, signature);
}

#[test]
fn elastic_piece_round_trip_with_and_without_chain() {
    let with_chain = round_trip(Message::ElasticPiece {
        index: 1,
        begin: 0,
        view_length: 163840,
        hash_chain: Some(Bytes::from(vec![4; 80])),
        data: Bytes::from(vec![5; 64]),
    });
    let Message::ElasticPiece {
        view_length,
        hash_chain,
        data,
        ..
    } = with_chain
    else {
        panic!("expected elastic piece");
    };
    assert_eq!(view_length, 163840);
    assert_eq!(hash_chain.map(|c| c.len()), Some(80));
    assert_eq!(data.len(), 64);

    let without_chain = round_trip(Message::ElasticPiece {
        index: 1,
        begin: 0,
        view_length: 163840,
        hash_chain: None,
        data: Bytes::from(vec![5; 64]),
    });
    let Message::ElasticPiece { hash_chain, .. } = without_chain else {
        panic!("expected elastic piece");
    };
    assert!(hash_chain.is_none());
}

#[test]
fn unknown_id_decodes_to_unknown() {
    let decoded = Message::decode(Bytes::from_static(&[42, 1, 2, 3])).unwrap();
    let Message::Unknown { id, payload } = decoded else {
        panic!("expected unknown message");
    };
    assert_eq!(id, 42);
    assert_eq!(payload.len(), 3);
}

#[test]
fn fixed_size_payloads_are_enforced() {
    // A have message with a trailing byte.
    assert!(Message::decode(Bytes::from_static(&[4, 0, 0, 0, 1, 9])).is_err());
    // A choke with a payload.
    assert!(Message::decode(Bytes::from_static(&[0, 0])).is_err());
    // A truncated request.
    assert!(Message::decode(Bytes::from_static(&[6, 0, 0, 0, 1])).is_err());
}

// =========================================================================
// Parser
// =========================================================================

#[test]
fn parser_handles_arbitrary_chunking() {
    let mut parser = PeerProtocolParser::new(true, true);
    let mut stream = remote_handshake(true, true);
    stream.extend_from_slice(&Message::Have { piece: 3 }.encode());

    for byte in stream {
        parser.push(&[byte]).unwrap();
    }

    assert!(matches!(
        parser.next_event(),
        Some(ProtocolEvent::BasicExtensions {
            fast: true,
            extension: true
        })
    ));
    assert!(matches!(
        parser.next_event(),
        Some(ProtocolEvent::InfoHash(hash)) if hash.0 == TEST_INFO_HASH
    ));
    assert!(matches!(parser.next_event(), Some(ProtocolEvent::PeerId(_))));
    assert!(matches!(
        parser.next_event(),
        Some(ProtocolEvent::Message(Message::Have { piece: 3 }))
    ));
    assert!(parser.next_event().is_none());
}

#[test]
fn parser_ands_capabilities_with_local_preference() {
    let mut parser = PeerProtocolParser::new(false, true);
    parser.push(&remote_handshake(true, true)).unwrap();
    assert!(matches!(
        parser.next_event(),
        Some(ProtocolEvent::BasicExtensions {
            fast: false,
            extension: true
        })
    ));
}

#[test]
fn parser_rejects_fast_message_when_fast_disabled() {
    let mut parser = PeerProtocolParser::new(true, true);
    parser.push(&remote_handshake(false, true)).unwrap();
    let err = parser.push(&Message::HaveAll.encode()).unwrap_err();
    assert!(matches!(err, PeerError::Protocol(_)));
    // The failure is terminal.
    assert!(parser.push(&[0, 0, 0, 0]).is_err());
}

#[test]
fn parser_rejects_extended_message_when_extension_disabled() {
    let mut parser = PeerProtocolParser::new(true, true);
    parser.push(&remote_handshake(true, false)).unwrap();
    let message = Message::Extended {
        id: 1,
        payload: Bytes::from_static(b"x"),
    };
    assert!(parser.push(&message.encode()).is_err());
}

#[test]
fn parser_rejects_late_availability_messages() {
    let mut parser = PeerProtocolParser::new(true, true);
    parser.push(&remote_handshake(true, true)).unwrap();
    // Keepalives do not count as the first message.
    parser.push(&Message::KeepAlive.encode()).unwrap();
    parser.push(&Message::Have { piece: 0 }.encode()).unwrap();
    let err = parser
        .push(&Message::Bitfield(Bytes::from_static(&[0])).encode())
        .unwrap_err();
    assert!(matches!(err, PeerError::Protocol(_)));
}

#[test]
fn parser_rejects_oversize_frames() {
    let mut parser = PeerProtocolParser::new(true, true);
    parser.push(&remote_handshake(true, true)).unwrap();
    let length = (MAX_MESSAGE_LENGTH + 1).to_be_bytes();
    assert!(matches!(
        parser.push(&length),
        Err(PeerError::InvalidMessage(_))
    ));
}

#[test]
fn parser_rejects_bad_protocol_string() {
    let mut parser = PeerProtocolParser::new(true, true);
    let mut bytes = remote_handshake(true, true);
    bytes[5] ^= 0xFF;
    assert!(matches!(
        parser.push(&bytes),
        Err(PeerError::InvalidHandshake)
    ));
}

#[test]
fn parser_decodes_extension_handshake() {
    let mut parser = PeerProtocolParser::new(true, true);
    parser.push(&remote_handshake(true, true)).unwrap();

    let payload = ExtensionUpdate::encode(
        &[("elastic".to_string(), 2)],
        &["gone".to_string()],
        None,
    )
    .unwrap();
    parser
        .push(&Message::Extended { id: 0, payload }.encode())
        .unwrap();

    let Some(ProtocolEvent::ExtensionHandshake(update)) = parser.next_event() else {
        panic!("expected extension handshake event");
    };
    assert_eq!(update.added, vec![("elastic".to_string(), 2)]);
    assert_eq!(update.removed, vec!["gone".to_string()]);

    // Malformed bencode in a handshake is a framing error.
    let bad = Message::Extended {
        id: 0,
        payload: Bytes::from_static(b"not bencode"),
    };
    assert!(parser.push(&bad.encode()).is_err());
}

// =========================================================================
// Bitfield
// =========================================================================

#[test]
fn bitfield_from_bytes_validates_length_and_spare_bits() {
    assert!(Bitfield::from_bytes(&[0xC0], 4).is_ok());
    // Wrong byte count.
    assert!(Bitfield::from_bytes(&[0xC0, 0x00], 4).is_err());
    // Spare bit set beyond piece 3.
    assert!(Bitfield::from_bytes(&[0xC8], 4).is_err());
}

#[test]
fn bitfield_invert_and_extend() {
    let mut bitfield = Bitfield::new(10);
    bitfield.set(2);
    bitfield.invert();
    assert!(!bitfield.has(2));
    assert_eq!(bitfield.cardinality(), 9);

    bitfield.extend(20);
    assert_eq!(bitfield.len(), 20);
    assert_eq!(bitfield.cardinality(), 9, "extension must not invent bits");
    assert!(!bitfield.has(15));

    // Shrinking is ignored.
    bitfield.extend(5);
    assert_eq!(bitfield.len(), 20);
}

// =========================================================================
// Allowed-fast generation
// =========================================================================

#[test]
fn allowed_fast_set_matches_reference_vectors() {
    // Reference example from BEP-6: ip 80.4.4.200, info hash of 20 x 0xAA,
    // 1313 pieces.
    let set = generate_allowed_fast_set(&TEST_INFO_HASH, "80.4.4.200".parse().unwrap(), 1313, 7);
    assert_eq!(set, vec![1059, 431, 808, 1217, 287, 376, 1188]);

    let nine = generate_allowed_fast_set(&TEST_INFO_HASH, "80.4.4.200".parse().unwrap(), 1313, 9);
    assert_eq!(nine[..7], [1059, 431, 808, 1217, 287, 376, 1188]);
    assert_eq!(nine.len(), 9);
}

#[test]
fn allowed_fast_set_is_deterministic_and_bounded() {
    let a = generate_allowed_fast_set(&[1; 20], "10.0.0.1".parse().unwrap(), 100, 10);
    let b = generate_allowed_fast_set(&[1; 20], "10.0.0.1".parse().unwrap(), 100, 10);
    assert_eq!(a, b);

    // The low octet is masked off, so neighbouring addresses agree.
    let c = generate_allowed_fast_set(&[1; 20], "10.0.0.77".parse().unwrap(), 100, 10);
    assert_eq!(a, c);

    let small = generate_allowed_fast_set(&[1; 20], "10.0.0.1".parse().unwrap(), 4, 4);
    assert_eq!(small.len(), 4);
    assert!(small.iter().all(|&piece| piece < 4));
}

// =========================================================================
// Outbound queue
// =========================================================================

fn test_queue(fast: bool) -> PeerOutboundQueue {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 8, &[0, 1, 2, 3, 4, 5, 6, 7]);
    PeerOutboundQueue::new(database, fast, StatisticCounter::new())
}

fn drain(queue: &mut PeerOutboundQueue) -> Vec<Message> {
    let (mut conn, wire) = MockConnection::new("10.0.0.9:6881");
    queue.send_data(&mut conn).unwrap();
    let (handshake, messages) = wire.written_messages();
    assert!(handshake.is_none());
    messages
}

#[test]
fn cancel_of_unsent_request_collapses_to_nothing() {
    let mut queue = test_queue(true);
    let request = desc(5, 0, BLOCK);

    queue.send_request_messages(vec![request]);
    queue.send_cancel_message(request, true);

    assert!(drain(&mut queue).is_empty());
    assert!(!queue.has_outstanding_requests());
}

#[test]
fn cancel_of_sent_request_emits_cancel_and_honours_tracking() {
    let mut queue = test_queue(true);
    let request = desc(5, 0, BLOCK);

    queue.send_request_messages(vec![request]);
    let sent = drain(&mut queue);
    assert!(matches!(sent[..], [Message::Request(_)]));
    assert!(queue.has_outstanding_requests());

    // Fast extension: the cancel goes out but the request stays tracked
    // until the remote answers.
    queue.send_cancel_message(request, true);
    assert!(matches!(drain(&mut queue)[..], [Message::Cancel(_)]));
    assert!(queue.has_outstanding_requests());
    assert!(queue.request_received(&request));
    assert!(!queue.has_outstanding_requests());
}

#[test]
fn cancel_without_tracking_forgets_the_request() {
    let mut queue = test_queue(false);
    let request = desc(2, 0, BLOCK);

    queue.send_request_messages(vec![request]);
    drain(&mut queue);
    queue.send_cancel_message(request, false);
    assert!(!queue.has_outstanding_requests());
    assert!(!queue.request_received(&request));
}

#[test]
fn interested_collapses_with_queued_opposite() {
    let mut queue = test_queue(false);
    queue.send_interested_message(true);
    queue.send_interested_message(false);
    assert!(drain(&mut queue).is_empty());

    queue.send_interested_message(true);
    assert!(matches!(drain(&mut queue)[..], [Message::Interested]));
}

#[test]
fn choke_drops_unsent_pieces_and_returns_their_descriptors() {
    let mut queue = test_queue(true);
    queue.send_piece_message(desc(1, 0, BLOCK));
    queue.send_piece_message(desc(2, 0, BLOCK));

    let dropped = queue.send_choke_message(true);
    assert_eq!(dropped, vec![desc(1, 0, BLOCK), desc(2, 0, BLOCK)]);
    assert_eq!(queue.get_unsent_piece_count(), 0);

    assert!(matches!(drain(&mut queue)[..], [Message::Choke]));
}

#[test]
fn plugged_requests_stay_queued_except_allowed_fast() {
    let mut queue = test_queue(true);
    queue.set_requests_plugged(true);
    queue.set_request_allowed_fast(6);

    queue.send_request_messages(vec![desc(5, 0, BLOCK), desc(6, 0, BLOCK)]);
    let sent = drain(&mut queue);
    assert!(
        matches!(sent[..], [Message::Request(d)] if d == desc(6, 0, BLOCK)),
        "only the allowed-fast request may pass while plugged"
    );

    queue.set_requests_plugged(false);
    let sent = drain(&mut queue);
    assert!(matches!(sent[..], [Message::Request(d)] if d == desc(5, 0, BLOCK)));
}

#[test]
fn requeued_requests_return_to_the_front() {
    let mut queue = test_queue(false);
    let first = desc(1, 0, BLOCK);
    let second = desc(2, 0, BLOCK);

    queue.send_request_messages(vec![first, second]);
    drain(&mut queue);
    assert!(queue.has_outstanding_requests());

    queue.requeue_all_request_messages();
    assert!(!queue.has_outstanding_requests());
    assert_eq!(queue.get_requests_needed(), crate::constants::REQUEST_PIPELINE_DEPTH - 2);

    let resent = drain(&mut queue);
    assert!(
        matches!(resent[..], [Message::Request(a), Message::Request(b)] if a == first && b == second),
        "requeue must preserve request order"
    );
}

#[test]
fn reject_piece_messages_rejects_only_under_fast() {
    for fast in [true, false] {
        let mut queue = test_queue(fast);
        queue.send_piece_message(desc(3, 0, BLOCK));
        queue.send_piece_message(desc(4, 0, BLOCK));
        queue.reject_piece_messages(3);
        assert_eq!(queue.get_unsent_piece_count(), 1);

        let sent = drain(&mut queue);
        if fast {
            assert!(matches!(
                sent[..],
                [Message::Reject(d), Message::Piece { index: 4, .. }] if d == desc(3, 0, BLOCK)
            ));
        } else {
            assert!(matches!(sent[..], [Message::Piece { index: 4, .. }]));
        }
    }
}

#[test]
fn drain_respects_priority_order() {
    let mut queue = test_queue(true);

    // Enqueue in roughly reverse emission order. The unchoke goes first
    // because queueing a choke message drops unsent piece sends.
    queue.send_choke_message(false);
    queue.send_keepalive_message();
    queue
        .send_extension_handshake(vec!["x".to_string()], Vec::new(), None)
        .unwrap();
    queue.send_piece_message(desc(1, 0, BLOCK));
    queue.send_request_messages(vec![desc(2, 0, BLOCK)]);
    queue.send_cancel_message(desc(3, 0, BLOCK), true);
    queue.send_reject_request_message(desc(4, 0, BLOCK));
    queue.send_allowed_fast_messages([7]);
    queue.send_have_none_message();
    queue.send_have_message(5);
    queue.send_interested_message(true);

    let sent = drain(&mut queue);
    assert!(matches!(
        sent[..],
        [
            Message::Unchoke,
            Message::Interested,
            Message::Have { piece: 5 },
            Message::HaveNone,
            Message::AllowedFast { piece: 7 },
            Message::Reject(_),
            Message::Cancel(_),
            Message::Request(_),
            Message::Piece { index: 1, .. },
            Message::Extended { .. },
            Message::KeepAlive,
        ]
    ));
}

#[test]
fn partial_writes_resume_mid_message() {
    let mut queue = test_queue(false);
    queue.send_piece_message(desc(1, 0, BLOCK));

    let (mut conn, wire) = MockConnection::new("10.0.0.9:6881");
    conn.max_per_write = Some(1000);
    let written = queue.send_data(&mut conn).unwrap();
    assert_eq!(written, 4 + 9 + BLOCK as usize);

    let (_, messages) = wire.written_messages();
    assert!(matches!(
        messages[..],
        [Message::Piece { index: 1, begin: 0, ref data }] if data.len() == BLOCK as usize
    ));
}

#[test]
fn choke_unchoke_choke_emits_three_messages_without_duplicating_pieces() {
    let mut queue = test_queue(false);
    queue.send_piece_message(desc(1, 0, BLOCK));

    queue.send_choke_message(true);
    queue.send_choke_message(false);
    queue.send_choke_message(true);

    let sent = drain(&mut queue);
    assert!(matches!(
        sent[..],
        [Message::Choke, Message::Unchoke, Message::Choke]
    ));
}

// =========================================================================
// Engine scenarios
// =========================================================================

// Classic download with a choke cycle (fast extension off).
#[test]
fn classic_download_choke_cycle() {
    let database = MockDatabase::new(ContentMode::Classic, 2 * BLOCK, 4, &[]);
    let (mut handler, coordinator, wire) =
        connected_handler(database, "10.1.2.3:6881", false, false);

    let r1 = desc(0, 0, BLOCK);
    let r2 = desc(0, BLOCK, BLOCK);
    let r3 = desc(1, 0, BLOCK);
    coordinator.script_requests(&[r1, r2, r3]);

    // Remote owns pieces 0 and 1.
    wire.feed(Message::Bitfield(Bytes::from_static(&[0xC0])).encode());
    handler.connection_ready(true, true);
    assert!(handler.we_are_interested());

    wire.feed(Message::Unchoke.encode());
    handler.connection_ready(true, true);
    assert!(!handler.they_are_choking());

    wire.feed(
        Message::Piece {
            index: 0,
            begin: 0,
            data: Bytes::from(vec![0u8; BLOCK as usize]),
        }
        .encode(),
    );
    handler.connection_ready(true, true);

    wire.feed(Message::Choke.encode());
    handler.connection_ready(true, true);

    let (handshake, messages) = wire.written_messages();
    assert!(handshake.is_some(), "handshake first on the wire");

    let interested = messages
        .iter()
        .filter(|m| matches!(m, Message::Interested))
        .count();
    let requests: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Request(d) => Some(*d),
            _ => None,
        })
        .collect();
    assert_eq!(interested, 1);
    assert_eq!(requests, vec![r1, r2, r3]);
    assert!(!messages
        .iter()
        .any(|m| matches!(m, Message::Cancel(_) | Message::Reject(_))));

    let state = coordinator.state.lock();
    assert_eq!(state.blocks.len(), 1);
    assert_eq!(state.blocks[0].0, r1);
    assert_eq!(state.lock_depth, 0, "token acquire/release must balance");
    drop(state);
    assert_eq!(handler.block_bytes_received(), BLOCK as u64);
}

// Fast extension: a request while choking for a piece outside the
// allowed-fast set gets an explicit reject and no piece.
#[test]
fn choked_request_outside_allowed_fast_is_rejected() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 8, &[5]);
    // An IPv6 peer receives no allowed-fast set at all.
    let (mut handler, _coordinator, wire) =
        connected_handler(database, "[2001:db8::2]:6881", true, true);

    wire.feed(Message::HaveNone.encode());
    wire.feed(Message::Request(desc(5, 0, BLOCK)).encode());
    handler.connection_ready(true, true);

    assert!(!handler.is_closed());
    assert!(handler.we_are_choking());

    let (_, messages) = wire.written_messages();
    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::Reject(d) if *d == desc(5, 0, BLOCK))));
    assert!(!messages
        .iter()
        .any(|m| matches!(m, Message::Piece { .. } | Message::MerklePiece { .. })));
}

// An IPv4 peer announcing few pieces is granted a deterministic
// allowed-fast set, and requests inside it are served while choked.
#[test]
fn have_none_grants_allowed_fast_set_to_ipv4_peer() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 8, &[0, 1, 2, 3, 4, 5, 6, 7]);
    let (mut handler, _coordinator, wire) =
        connected_handler(database, "80.4.4.200:6881", true, true);

    wire.feed(Message::HaveNone.encode());
    handler.connection_ready(true, true);

    let (_, messages) = wire.written_messages();
    let granted: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            Message::AllowedFast { piece } => Some(*piece),
            _ => None,
        })
        .collect();
    let expected =
        generate_allowed_fast_set(&TEST_INFO_HASH, "80.4.4.200".parse().unwrap(), 8, 8);
    assert_eq!(granted, expected);

    // A choked request inside the grant is served.
    let piece = granted[0];
    wire.feed(Message::Request(desc(piece, 0, BLOCK)).encode());
    handler.connection_ready(true, true);
    let (_, messages) = wire.written_messages();
    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::Piece { index, .. } if *index == piece)));
}

// Elastic view growth: signatures extend the remote view and bitfield, and
// at most two live at a time.
#[test]
fn elastic_view_growth_and_signature_eviction() {
    let piece_size = BLOCK;
    let database = MockDatabase::new(ContentMode::Elastic, piece_size, 10, &[]);
    let (mut handler, coordinator, wire) =
        connected_handler(database, "10.1.2.3:6881", true, true);

    let signature = |n: u64| {
        ViewSignature::new(n * piece_size as u64, [3; 20], Bytes::from(vec![4; 40]))
    };

    wire.feed(Message::ElasticSignature(signature(14)).encode());
    handler.connection_ready(true, true);
    assert!(!handler.is_closed());

    assert_eq!(handler.remote_view_length(), Some(14 * piece_size as u64));
    let bitfield = ManageablePeer::remote_bitfield(&handler).unwrap();
    assert!(bitfield.len() >= 14);

    wire.feed(Message::ElasticSignature(signature(15)).encode());
    wire.feed(Message::ElasticSignature(signature(16)).encode());
    handler.connection_ready(true, true);
    assert_eq!(
        coordinator.state.lock().verified_signatures,
        vec![14 * piece_size as u64, 15 * piece_size as u64, 16 * piece_size as u64]
    );

    // Give the engine an outstanding request so a piece can be delivered.
    coordinator.script_requests(&[desc(0, 0, BLOCK)]);
    wire.feed(Message::Have { piece: 0 }.encode());
    wire.feed(Message::Unchoke.encode());
    handler.connection_ready(true, true);

    // A chain under the evicted view 14 is fatal; views 15 and 16 survive.
    wire.feed(
        Message::ElasticPiece {
            index: 0,
            begin: 0,
            view_length: 14 * piece_size as u64,
            hash_chain: Some(Bytes::from(vec![0; 20])),
            data: Bytes::from(vec![0u8; BLOCK as usize]),
        }
        .encode(),
    );
    handler.connection_ready(true, true);
    assert!(handler.is_closed());
}

#[test]
fn elastic_piece_with_known_view_is_delivered_with_signature() {
    let piece_size = BLOCK;
    let database = MockDatabase::new(ContentMode::Elastic, piece_size, 10, &[]);
    let (mut handler, coordinator, wire) =
        connected_handler(database, "10.1.2.3:6881", true, true);

    let view_length = 14 * piece_size as u64;
    let signature = ViewSignature::new(view_length, [3; 20], Bytes::from(vec![4; 40]));
    wire.feed(Message::ElasticSignature(signature).encode());

    coordinator.script_requests(&[desc(0, 0, BLOCK)]);
    wire.feed(Message::Have { piece: 0 }.encode());
    wire.feed(Message::Unchoke.encode());
    handler.connection_ready(true, true);

    wire.feed(
        Message::ElasticPiece {
            index: 0,
            begin: 0,
            view_length,
            hash_chain: Some(Bytes::from(vec![0; 40])),
            data: Bytes::from(vec![0u8; BLOCK as usize]),
        }
        .encode(),
    );
    handler.connection_ready(true, true);
    assert!(!handler.is_closed());

    let state = coordinator.state.lock();
    assert_eq!(state.blocks.len(), 1);
    let (delivered, with_signature, with_chain, data_len) = state.blocks[0];
    assert_eq!(delivered, desc(0, 0, BLOCK));
    assert!(with_signature);
    assert!(with_chain);
    assert_eq!(data_len, BLOCK as usize);
}

// An inbound handshake naming an unknown torrent is fatal before any
// registration happens.
#[test]
fn inbound_unknown_info_hash_is_fatal() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let coordinator = MockCoordinator::new(database);
    let lookup = Arc::new(MockLookup {
        coordinator: Some(coordinator.clone()),
    });

    let (conn, wire) = MockConnection::new("10.9.9.9:50000");
    let mut handler = PeerHandler::inbound(lookup, conn, true, true);

    wire.feed(remote_handshake_for([0xBB; 20], true, true));
    handler.connection_ready(true, true);

    assert!(handler.is_closed());
    assert!(wire.is_closed());
    let state = coordinator.state.lock();
    assert_eq!(state.connected, 0);
    assert_eq!(state.disconnected, 0);
    // Nothing was ever sent, not even our handshake.
    assert!(wire.written.lock().is_empty());
}

#[test]
fn inbound_known_info_hash_completes_setup() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[0, 1, 2, 3]);
    let coordinator = MockCoordinator::new(database);
    let lookup = Arc::new(MockLookup {
        coordinator: Some(coordinator.clone()),
    });

    let (conn, wire) = MockConnection::new("10.9.9.9:50000");
    let mut handler = PeerHandler::inbound(lookup, conn, true, true);

    wire.feed(remote_handshake(true, true));
    handler.connection_ready(true, true);

    assert!(!handler.is_closed());
    let (handshake, messages) = wire.written_messages();
    assert!(handshake.is_some());
    // Seeding with the fast extension announces have-all.
    assert!(matches!(messages[..], [Message::HaveAll]));

    let state = coordinator.state.lock();
    assert_eq!(state.connected, 1);
    assert_eq!(state.lock_depth, 0);
}

#[test]
fn registration_rejection_tears_the_connection_down() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let coordinator = MockCoordinator::new(database);
    coordinator.state.lock().accept_peer = false;

    let (conn, wire) = MockConnection::new("10.1.2.3:6881");
    let mut handler = PeerHandler::outbound(coordinator.clone(), conn, true, true);
    wire.feed(remote_handshake(true, true));
    handler.connection_ready(true, true);

    assert!(handler.is_closed());
    let state = coordinator.state.lock();
    assert_eq!(state.connected, 1);
    assert_eq!(state.disconnected, 1);
}

#[test]
fn initial_availability_announcement_variants() {
    // Empty with fast: have-none.
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let (_, _, wire) = connected_handler(database, "10.1.2.3:6881", true, true);
    let (_, messages) = wire.written_messages();
    assert!(matches!(messages[..], [Message::HaveNone]));

    // Partial with fast: plain bitfield.
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[0, 2]);
    let (_, _, wire) = connected_handler(database, "10.1.2.3:6881", true, true);
    let (_, messages) = wire.written_messages();
    assert!(matches!(messages[..], [Message::Bitfield(ref b)] if b[0] == 0xA0));

    // Empty without fast: silence.
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let (_, _, wire) = connected_handler(database, "10.1.2.3:6881", false, false);
    let (_, messages) = wire.written_messages();
    assert!(messages.is_empty());

    // Elastic always announces have-none.
    let database = MockDatabase::new(ContentMode::Elastic, BLOCK, 4, &[0, 1, 2, 3]);
    let (_, _, wire) = connected_handler(database, "10.1.2.3:6881", true, true);
    let (_, messages) = wire.written_messages();
    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::HaveNone)));
}

#[test]
fn elastic_torrent_requires_fast_and_extension() {
    let database = MockDatabase::new(ContentMode::Elastic, BLOCK, 4, &[]);
    let coordinator = MockCoordinator::new(database);
    let (conn, wire) = MockConnection::new("10.1.2.3:6881");
    let mut handler = PeerHandler::outbound(coordinator, conn, true, true);

    wire.feed(remote_handshake(false, true));
    handler.connection_ready(true, true);
    assert!(handler.is_closed());
}

#[test]
fn elastic_handshake_advertises_extension() {
    let database = MockDatabase::new(ContentMode::Elastic, BLOCK, 4, &[]);
    let (_, _, wire) = connected_handler(database, "10.1.2.3:6881", true, true);

    let (_, messages) = wire.written_messages();
    let advertised = messages.iter().any(|m| {
        matches!(m, Message::Extended { id: 0, payload }
            if ExtensionUpdate::decode(payload)
                .map(|u| u.added.iter().any(|(name, _)| name == EXTENSION_ELASTIC))
                .unwrap_or(false))
    });
    assert!(advertised);
}

#[test]
fn unrequested_piece_is_fatal_only_under_fast() {
    for (fast, expect_closed) in [(true, true), (false, false)] {
        let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
        let (mut handler, coordinator, wire) =
            connected_handler(database, "10.1.2.3:6881", fast, fast);

        wire.feed(
            Message::Piece {
                index: 0,
                begin: 0,
                data: Bytes::from(vec![0u8; BLOCK as usize]),
            }
            .encode(),
        );
        handler.connection_ready(true, true);

        assert_eq!(handler.is_closed(), expect_closed);
        assert!(coordinator.state.lock().blocks.is_empty());
    }
}

#[test]
fn reject_of_non_outstanding_request_is_fatal() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let (mut handler, coordinator, wire) = connected_handler(database, "10.1.2.3:6881", true, true);

    wire.feed(Message::Reject(desc(0, 0, BLOCK)).encode());
    handler.connection_ready(true, true);

    assert!(handler.is_closed());
    assert_eq!(coordinator.state.lock().disconnected, 1);

    // close() stays idempotent afterwards.
    handler.close();
    assert_eq!(coordinator.state.lock().disconnected, 1);
}

#[test]
fn invalid_have_and_oversize_request_are_fatal() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[0, 1, 2, 3]);
    let (mut handler, _, wire) = connected_handler(database, "10.1.2.3:6881", true, true);
    wire.feed(Message::Have { piece: 4 }.encode());
    handler.connection_ready(true, true);
    assert!(handler.is_closed());

    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[0, 1, 2, 3]);
    let (mut handler, _, wire) = connected_handler(database, "10.1.2.3:6881", true, true);
    // Block length above the per-request maximum.
    wire.feed(Message::Request(desc(0, 0, BLOCK + 1)).encode());
    handler.connection_ready(true, true);
    assert!(handler.is_closed());
}

#[test]
fn have_updates_interest_once() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let (mut handler, _, wire) = connected_handler(database, "10.1.2.3:6881", false, false);

    wire.feed(Message::Have { piece: 1 }.encode());
    wire.feed(Message::Have { piece: 2 }.encode());
    handler.connection_ready(true, true);

    assert!(handler.we_are_interested());
    let (_, messages) = wire.written_messages();
    let interested = messages
        .iter()
        .filter(|m| matches!(m, Message::Interested))
        .count();
    assert_eq!(interested, 1);
}

#[test]
fn suggest_for_absent_piece_is_dropped() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let (mut handler, coordinator, wire) = connected_handler(database, "10.1.2.3:6881", true, true);

    wire.feed(Message::Have { piece: 1 }.encode());
    wire.feed(Message::Suggest { piece: 1 }.encode());
    wire.feed(Message::Suggest { piece: 2 }.encode());
    handler.connection_ready(true, true);

    assert!(!handler.is_closed());
    assert_eq!(coordinator.state.lock().suggested, vec![1]);
}

#[test]
fn allowed_fast_for_held_piece_is_recorded() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let (mut handler, coordinator, wire) = connected_handler(database, "10.1.2.3:6881", true, true);

    wire.feed(Message::Have { piece: 1 }.encode());
    wire.feed(Message::AllowedFast { piece: 1 }.encode());
    wire.feed(Message::AllowedFast { piece: 3 }.encode());
    handler.connection_ready(true, true);

    assert!(!handler.is_closed());
    assert_eq!(coordinator.state.lock().allowed_fast, vec![1]);
}

#[test]
fn remote_cancel_of_unsent_piece_rejects_under_fast() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 8, &[2]);
    let (mut handler, _, wire) = connected_handler(database, "10.1.2.3:6881", true, true);

    // Unchoke the remote so the request is queued, then cancel it before
    // the next drain.
    handler.set_we_are_choking(false);
    wire.feed(Message::Request(desc(2, 0, BLOCK)).encode());
    wire.feed(Message::Cancel(desc(2, 0, BLOCK)).encode());
    handler.connection_ready(true, true);

    let (_, messages) = wire.written_messages();
    assert!(!messages.iter().any(|m| matches!(m, Message::Piece { .. })));
    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::Reject(d) if *d == desc(2, 0, BLOCK))));
}

#[test]
fn extension_handshake_flows_to_coordinator_and_back() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let (mut handler, coordinator, wire) = connected_handler(database, "10.1.2.3:6881", true, true);

    let payload = ExtensionUpdate::encode(&[("foo".to_string(), 3)], &[], None).unwrap();
    wire.feed(Message::Extended { id: 0, payload }.encode());
    handler.connection_ready(true, true);
    assert_eq!(coordinator.state.lock().extensions_added, vec!["foo"]);

    // Outgoing messages use the sub-id the remote advertised.
    handler.send_extension_message("foo", Bytes::from_static(b"hello"));
    handler.send_extension_message("unknown", Bytes::from_static(b"dropped"));
    handler.connection_ready(false, true);

    let (_, messages) = wire.written_messages();
    let extended: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Extended { id, payload } => Some((*id, payload.len())),
            _ => None,
        })
        .collect();
    assert_eq!(extended, vec![(3, 5)]);

    // Inbound extension messages reach the coordinator by sub-id.
    wire.feed(
        Message::Extended {
            id: 9,
            payload: Bytes::from_static(b"abc"),
        }
        .encode(),
    );
    handler.connection_ready(true, false);
    assert_eq!(coordinator.state.lock().extension_messages, vec![(9, 3)]);
}

#[test]
fn keepalive_tick_queues_frame_when_not_idle() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let (mut handler, _, wire) = connected_handler(database, "10.1.2.3:6881", true, true);

    handler.send_keepalive_or_close();
    handler.connection_ready(false, true);

    assert!(!handler.is_closed());
    let (_, messages) = wire.written_messages();
    assert!(messages.iter().any(|m| matches!(m, Message::KeepAlive)));
}

#[test]
fn keepalive_tick_closes_idle_connection_and_notifies_once() {
    let database = MockDatabase::new(ContentMode::Classic, BLOCK, 4, &[]);
    let (mut handler, coordinator, wire) = connected_handler(database, "10.1.2.3:6881", true, true);

    handler.set_idle_elapsed(IDLE_INTERVAL + Duration::from_secs(1));
    handler.send_keepalive_or_close();

    assert!(handler.is_closed());
    assert!(wire.is_closed());
    assert_eq!(coordinator.state.lock().disconnected, 1);

    // Later ticks on a closed connection must not notify again.
    handler.send_keepalive_or_close();
    assert_eq!(coordinator.state.lock().disconnected, 1);
}
