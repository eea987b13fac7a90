use thiserror::Error;

/// Errors that end a peer connection.
///
/// Every variant is terminal for the connection it occurs on: the engine
/// closes the stream and notifies the coordinator exactly once. Nothing here
/// propagates past the peer engine.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote sent a malformed handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The handshake named a torrent we do not serve, or (outbound) not the
    /// one we connected for.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The coordinator refused to register the peer.
    #[error("peer registration rejected")]
    RegistrationRejected,

    /// Malformed framing or message payload.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The remote closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// A well-formed message that violates protocol state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed extension-protocol payload.
    #[error("extension error: {0}")]
    Extension(String),

    /// Bencode failure inside an extension handshake.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}
