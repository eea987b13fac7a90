use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;
use crate::piecedb::{BlockDescriptor, ViewSignature};

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake frame in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Message type identifiers in the peer wire protocol.
///
/// Each message (except keepalive) has a one-byte ID following the length
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    /// Stop sending data to the peer.
    Choke = 0,
    /// Ready to send data to the peer.
    Unchoke = 1,
    /// Want data from the peer.
    Interested = 2,
    /// Don't want data from the peer.
    NotInterested = 3,
    /// Announce a newly-acquired piece.
    Have = 4,
    /// Announce all available pieces.
    Bitfield = 5,
    /// Request a data block.
    Request = 6,
    /// Send piece data.
    Piece = 7,
    /// Cancel a pending request.
    Cancel = 8,
    // Fast extension (BEP-6)
    /// Suggest a piece to download.
    Suggest = 13,
    /// Peer has all pieces (seeder).
    HaveAll = 14,
    /// Peer has no pieces.
    HaveNone = 15,
    /// Reject a block request.
    Reject = 16,
    /// Allow downloading while choked.
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    /// Extension protocol message.
    Extended = 20,
    // Content modes
    /// Piece data with a merkle hash chain (BEP-30).
    MerklePiece = 21,
    /// Signed view length announcement (Elastic).
    ElasticSignature = 22,
    /// Piece data under a signed view (Elastic).
    ElasticPiece = 23,
    /// Bitfield that may outgrow the static piece count (Elastic).
    ElasticBitfield = 24,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            13 => Ok(MessageId::Suggest),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::Reject),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            21 => Ok(MessageId::MerklePiece),
            22 => Ok(MessageId::ElasticSignature),
            23 => Ok(MessageId::ElasticPiece),
            24 => Ok(MessageId::ElasticBitfield),
            _ => Err(PeerError::InvalidMessage(format!("unknown id {}", value))),
        }
    }
}

/// The handshake frame preceding the id-prefixed stream.
///
/// Reserved-byte capability bits:
/// - Byte 5, bit 4: extension protocol ([BEP-10])
/// - Byte 7, bit 2: fast extension ([BEP-6])
///
/// [BEP-6]: http://bittorrent.org/beps/bep_0006.html
/// [BEP-10]: http://bittorrent.org/beps/bep_0010.html
#[derive(Debug, Clone)]
pub struct Handshake {
    /// The torrent's info hash.
    pub info_hash: [u8; 20],
    /// The sender's peer ID.
    pub peer_id: [u8; 20],
    /// Reserved bytes carrying capability flags.
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Creates a handshake advertising the requested capabilities.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], fast: bool, extension: bool) -> Self {
        let mut reserved = [0u8; 8];
        if extension {
            reserved[5] |= 0x10;
        }
        if fast {
            reserved[7] |= 0x04;
        }
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    /// Whether the sender supports the extension protocol ([BEP-10]).
    ///
    /// [BEP-10]: http://bittorrent.org/beps/bep_0010.html
    pub fn supports_extension_protocol(&self) -> bool {
        (self.reserved[5] & 0x10) != 0
    }

    /// Whether the sender supports the fast extension ([BEP-6]).
    ///
    /// [BEP-6]: http://bittorrent.org/beps/bep_0006.html
    pub fn supports_fast_extension(&self) -> bool {
        (self.reserved[7] & 0x04) != 0
    }

    /// Encodes the handshake for transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }

        if data[0] != 19 || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A peer wire protocol message.
///
/// Messages are length-prefixed: a 4-byte big-endian length followed by a
/// 1-byte message ID (except keepalive, which is length 0) and payload.
#[derive(Debug, Clone)]
pub enum Message {
    /// Empty message to keep the connection alive.
    KeepAlive,
    /// We are choking the peer.
    Choke,
    /// We are unchoking the peer.
    Unchoke,
    /// We are interested in the peer's data.
    Interested,
    /// We are not interested in the peer's data.
    NotInterested,
    /// Announce that we have a piece.
    Have { piece: u32 },
    /// Bitfield of all pieces we have.
    Bitfield(Bytes),
    /// Request a block of data.
    Request(BlockDescriptor),
    /// Send piece data.
    Piece { index: u32, begin: u32, data: Bytes },
    /// Cancel a pending request.
    Cancel(BlockDescriptor),
    /// Suggest a piece to download (fast extension).
    Suggest { piece: u32 },
    /// Peer has all pieces (fast extension).
    HaveAll,
    /// Peer has no pieces (fast extension).
    HaveNone,
    /// Reject a block request (fast extension).
    Reject(BlockDescriptor),
    /// Allow downloading this piece while choked (fast extension).
    AllowedFast { piece: u32 },
    /// Extension protocol message ([BEP-10]).
    ///
    /// [BEP-10]: http://bittorrent.org/beps/bep_0010.html
    Extended { id: u8, payload: Bytes },
    /// Piece data carrying a merkle hash chain.
    MerklePiece {
        index: u32,
        begin: u32,
        hash_chain: Bytes,
        data: Bytes,
    },
    /// A signed view length announcement.
    ElasticSignature(ViewSignature),
    /// Piece data under a signed view; the hash chain is optional.
    ElasticPiece {
        index: u32,
        begin: u32,
        view_length: u64,
        hash_chain: Option<Bytes>,
        data: Bytes,
    },
    /// A bitfield whose length may exceed the static piece count.
    ElasticBitfield(Bytes),
    /// A message with an id we do not understand. Consumed and ignored.
    Unknown { id: u8, payload: Bytes },
}

impl Message {
    /// Encodes the message, including the 4-byte length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request(desc) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                put_descriptor(&mut buf, desc);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel(desc) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                put_descriptor(&mut buf, desc);
            }
            Message::Suggest { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Suggest as u8);
                buf.put_u32(*piece);
            }
            Message::HaveAll => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveAll as u8);
            }
            Message::HaveNone => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveNone as u8);
            }
            Message::Reject(desc) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Reject as u8);
                put_descriptor(&mut buf, desc);
            }
            Message::AllowedFast { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::AllowedFast as u8);
                buf.put_u32(*piece);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            Message::MerklePiece {
                index,
                begin,
                hash_chain,
                data,
            } => {
                buf.put_u32(13 + hash_chain.len() as u32 + data.len() as u32);
                buf.put_u8(MessageId::MerklePiece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(hash_chain.len() as u32);
                buf.put_slice(hash_chain);
                buf.put_slice(data);
            }
            Message::ElasticSignature(signature) => {
                buf.put_u32(29 + signature.signature.len() as u32);
                buf.put_u8(MessageId::ElasticSignature as u8);
                buf.put_u64(signature.view_length);
                buf.put_slice(&signature.root_hash);
                buf.put_slice(&signature.signature);
            }
            Message::ElasticPiece {
                index,
                begin,
                view_length,
                hash_chain,
                data,
            } => {
                let chain_len = hash_chain.as_ref().map(|c| 4 + c.len()).unwrap_or(0);
                buf.put_u32((18 + chain_len + data.len()) as u32);
                buf.put_u8(MessageId::ElasticPiece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u64(*view_length);
                match hash_chain {
                    Some(chain) => {
                        buf.put_u8(1);
                        buf.put_u32(chain.len() as u32);
                        buf.put_slice(chain);
                    }
                    None => buf.put_u8(0),
                }
                buf.put_slice(data);
            }
            Message::ElasticBitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::ElasticBitfield as u8);
                buf.put_slice(bits);
            }
            Message::Unknown { id, payload } => {
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        buf.freeze()
    }

    /// Decodes a framed payload: the message id byte plus body, without the
    /// length prefix. Keepalives (length 0) never reach this point.
    pub fn decode(mut payload: Bytes) -> Result<Self, PeerError> {
        if payload.is_empty() {
            return Err(PeerError::InvalidMessage("empty frame".into()));
        }

        let raw_id = payload.get_u8();
        let id = match MessageId::try_from(raw_id) {
            Ok(id) => id,
            Err(_) => {
                return Ok(Message::Unknown {
                    id: raw_id,
                    payload,
                })
            }
        };
        let body_len = payload.remaining();

        match id {
            MessageId::Choke => expect_len(body_len, 0, "choke").map(|_| Message::Choke),
            MessageId::Unchoke => expect_len(body_len, 0, "unchoke").map(|_| Message::Unchoke),
            MessageId::Interested => {
                expect_len(body_len, 0, "interested").map(|_| Message::Interested)
            }
            MessageId::NotInterested => {
                expect_len(body_len, 0, "not interested").map(|_| Message::NotInterested)
            }
            MessageId::Have => {
                expect_len(body_len, 4, "have")?;
                Ok(Message::Have {
                    piece: payload.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(payload)),
            MessageId::Request => {
                expect_len(body_len, 12, "request")?;
                Ok(Message::Request(get_descriptor(&mut payload)))
            }
            MessageId::Piece => {
                if body_len < 8 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: payload,
                })
            }
            MessageId::Cancel => {
                expect_len(body_len, 12, "cancel")?;
                Ok(Message::Cancel(get_descriptor(&mut payload)))
            }
            MessageId::Suggest => {
                expect_len(body_len, 4, "suggest")?;
                Ok(Message::Suggest {
                    piece: payload.get_u32(),
                })
            }
            MessageId::HaveAll => expect_len(body_len, 0, "have all").map(|_| Message::HaveAll),
            MessageId::HaveNone => expect_len(body_len, 0, "have none").map(|_| Message::HaveNone),
            MessageId::Reject => {
                expect_len(body_len, 12, "reject")?;
                Ok(Message::Reject(get_descriptor(&mut payload)))
            }
            MessageId::AllowedFast => {
                expect_len(body_len, 4, "allowed fast")?;
                Ok(Message::AllowedFast {
                    piece: payload.get_u32(),
                })
            }
            MessageId::Extended => {
                if body_len < 1 {
                    return Err(PeerError::InvalidMessage("extended too short".into()));
                }
                let ext_id = payload.get_u8();
                Ok(Message::Extended {
                    id: ext_id,
                    payload,
                })
            }
            MessageId::MerklePiece => {
                if body_len < 12 {
                    return Err(PeerError::InvalidMessage("merkle piece too short".into()));
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                let chain_len = payload.get_u32() as usize;
                if payload.remaining() < chain_len {
                    return Err(PeerError::InvalidMessage(
                        "merkle piece hash chain truncated".into(),
                    ));
                }
                let hash_chain = payload.copy_to_bytes(chain_len);
                Ok(Message::MerklePiece {
                    index,
                    begin,
                    hash_chain,
                    data: payload,
                })
            }
            MessageId::ElasticSignature => {
                if body_len < 29 {
                    return Err(PeerError::InvalidMessage(
                        "elastic signature too short".into(),
                    ));
                }
                let view_length = payload.get_u64();
                let mut root_hash = [0u8; 20];
                payload.copy_to_slice(&mut root_hash);
                Ok(Message::ElasticSignature(ViewSignature::new(
                    view_length,
                    root_hash,
                    payload,
                )))
            }
            MessageId::ElasticPiece => {
                if body_len < 17 {
                    return Err(PeerError::InvalidMessage("elastic piece too short".into()));
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                let view_length = payload.get_u64();
                let hash_chain = match payload.get_u8() {
                    0 => None,
                    1 => {
                        if payload.remaining() < 4 {
                            return Err(PeerError::InvalidMessage(
                                "elastic piece hash chain truncated".into(),
                            ));
                        }
                        let chain_len = payload.get_u32() as usize;
                        if payload.remaining() < chain_len {
                            return Err(PeerError::InvalidMessage(
                                "elastic piece hash chain truncated".into(),
                            ));
                        }
                        Some(payload.copy_to_bytes(chain_len))
                    }
                    _ => {
                        return Err(PeerError::InvalidMessage(
                            "elastic piece bad chain flag".into(),
                        ))
                    }
                };
                Ok(Message::ElasticPiece {
                    index,
                    begin,
                    view_length,
                    hash_chain,
                    data: payload,
                })
            }
            MessageId::ElasticBitfield => Ok(Message::ElasticBitfield(payload)),
        }
    }
}

fn put_descriptor(buf: &mut BytesMut, desc: &BlockDescriptor) {
    buf.put_u32(desc.piece_index);
    buf.put_u32(desc.offset);
    buf.put_u32(desc.length);
}

fn get_descriptor(payload: &mut Bytes) -> BlockDescriptor {
    BlockDescriptor::new(payload.get_u32(), payload.get_u32(), payload.get_u32())
}

fn expect_len(actual: usize, expected: usize, name: &str) -> Result<(), PeerError> {
    if actual != expected {
        return Err(PeerError::InvalidMessage(format!(
            "{} payload length {}",
            name, actual
        )));
    }
    Ok(())
}
