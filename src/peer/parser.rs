use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use super::error::PeerError;
use super::extension::{ExtensionUpdate, EXTENSION_HANDSHAKE_ID};
use super::message::{Message, MessageId, HANDSHAKE_LEN, PROTOCOL};
use super::peer_id::PeerId;
use crate::constants::MAX_MESSAGE_LENGTH;
use crate::piecedb::InfoHash;

/// A typed event decoded from the inbound byte stream, in arrival order.
#[derive(Debug)]
pub enum ProtocolEvent {
    /// The remote's handshake capabilities, already ANDed with the local
    /// preference.
    BasicExtensions { fast: bool, extension: bool },
    /// The info hash named in the remote handshake.
    InfoHash(InfoHash),
    /// The remote peer ID completing the handshake.
    PeerId(PeerId),
    /// A decoded extension-protocol handshake.
    ExtensionHandshake(ExtensionUpdate),
    /// Any other complete message.
    Message(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    AwaitingHandshake,
    AwaitingPeerId,
    Framing,
}

/// Incremental parser for one peer's inbound stream.
///
/// Bytes go in through [`push`](Self::push); completed messages come out of
/// [`next_event`](Self::next_event) in wire order. The first error is
/// terminal: no further events are produced and later pushes keep failing.
#[derive(Debug)]
pub struct PeerProtocolParser {
    state: ParserState,
    buffer: BytesMut,
    fast_enabled: bool,
    extension_enabled: bool,
    first_message_seen: bool,
    failed: bool,
    events: VecDeque<ProtocolEvent>,
}

impl PeerProtocolParser {
    /// Creates a parser with the local capability preferences. The effective
    /// capabilities are fixed once the remote's reserved bytes arrive.
    pub fn new(fast_preference: bool, extension_preference: bool) -> Self {
        Self {
            state: ParserState::AwaitingHandshake,
            buffer: BytesMut::new(),
            fast_enabled: fast_preference,
            extension_enabled: extension_preference,
            first_message_seen: false,
            failed: false,
            events: VecDeque::new(),
        }
    }

    /// Appends a chunk of stream bytes and parses as far as possible.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), PeerError> {
        if self.failed {
            return Err(PeerError::Protocol("parser already failed".into()));
        }
        self.buffer.extend_from_slice(chunk);
        match self.parse() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    /// Pops the next decoded event, if any.
    pub fn next_event(&mut self) -> Option<ProtocolEvent> {
        self.events.pop_front()
    }

    fn parse(&mut self) -> Result<(), PeerError> {
        loop {
            match self.state {
                ParserState::AwaitingHandshake => {
                    if self.buffer.len() < HANDSHAKE_LEN - 20 {
                        return Ok(());
                    }
                    if self.buffer[0] != 19 || &self.buffer[1..20] != PROTOCOL {
                        return Err(PeerError::InvalidHandshake);
                    }

                    let reserved = &self.buffer[20..28];
                    self.fast_enabled &= (reserved[7] & 0x04) != 0;
                    self.extension_enabled &= (reserved[5] & 0x10) != 0;
                    self.events.push_back(ProtocolEvent::BasicExtensions {
                        fast: self.fast_enabled,
                        extension: self.extension_enabled,
                    });

                    let info_hash = InfoHash::from_bytes(&self.buffer[28..48])
                        .ok_or(PeerError::InvalidHandshake)?;
                    self.events.push_back(ProtocolEvent::InfoHash(info_hash));

                    self.buffer.advance(HANDSHAKE_LEN - 20);
                    self.state = ParserState::AwaitingPeerId;
                }
                ParserState::AwaitingPeerId => {
                    if self.buffer.len() < 20 {
                        return Ok(());
                    }
                    let peer_id =
                        PeerId::from_bytes(&self.buffer[..20]).ok_or(PeerError::InvalidHandshake)?;
                    self.events.push_back(ProtocolEvent::PeerId(peer_id));
                    self.buffer.advance(20);
                    self.state = ParserState::Framing;
                }
                ParserState::Framing => {
                    if self.buffer.len() < 4 {
                        return Ok(());
                    }
                    let length =
                        u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]);
                    if length > MAX_MESSAGE_LENGTH {
                        return Err(PeerError::InvalidMessage(format!(
                            "frame length {} exceeds limit",
                            length
                        )));
                    }
                    if self.buffer.len() < 4 + length as usize {
                        return Ok(());
                    }
                    self.buffer.advance(4);

                    if length == 0 {
                        self.events.push_back(ProtocolEvent::Message(Message::KeepAlive));
                        continue;
                    }

                    let payload = self.buffer.split_to(length as usize).freeze();
                    self.dispatch(payload)?;
                }
            }
        }
    }

    fn dispatch(&mut self, payload: Bytes) -> Result<(), PeerError> {
        let raw_id = payload[0];

        // Ids belonging to an extension the peer did not negotiate are a
        // framing error, not an unknown message.
        if (MessageId::Suggest as u8..=MessageId::AllowedFast as u8).contains(&raw_id)
            && !self.fast_enabled
        {
            return Err(PeerError::Protocol(format!(
                "fast extension message {} without fast extension",
                raw_id
            )));
        }
        if raw_id == MessageId::Extended as u8 && !self.extension_enabled {
            return Err(PeerError::Protocol(
                "extended message without extension protocol".into(),
            ));
        }

        let message = Message::decode(payload)?;

        if matches!(
            message,
            Message::Bitfield(_) | Message::HaveAll | Message::HaveNone | Message::ElasticBitfield(_)
        ) && self.first_message_seen
        {
            return Err(PeerError::Protocol(
                "availability message after first message".into(),
            ));
        }
        self.first_message_seen = true;

        if let Message::Extended { id, payload } = &message {
            if *id == EXTENSION_HANDSHAKE_ID {
                let update = ExtensionUpdate::decode(payload)?;
                self.events
                    .push_back(ProtocolEvent::ExtensionHandshake(update));
                return Ok(());
            }
        }

        self.events.push_back(ProtocolEvent::Message(message));
        Ok(())
    }
}
