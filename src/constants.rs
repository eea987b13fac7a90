//! Protocol constants and tuning parameters.
//!
//! Values that are fixed by the wire protocol (block and message size
//! limits, the allowed-fast threshold) live here together with the tuning
//! parameters of the outbound queue and the keepalive policy.

use std::time::Duration;

use crate::counter::Period;

// ============================================================================
// Wire limits
// ============================================================================

/// Maximum length of a single requested block (BEP 3 common practice).
/// Requests above this are a protocol violation.
pub const MAX_BLOCK_LENGTH: u32 = 16384;

/// Maximum length of any framed message we will accept. Large enough for a
/// full block plus the merkle/elastic hash chain headers, small enough to
/// bound buffering against a hostile peer.
pub const MAX_MESSAGE_LENGTH: u32 = 131072;

// ============================================================================
// Fast extension (BEP 6)
// ============================================================================

/// Piece-count threshold for the allowed-fast machinery. Peers holding fewer
/// pieces than this are offered an allowed-fast set; a peer that reaches it
/// has its set withdrawn.
pub const ALLOWED_FAST_THRESHOLD: usize = 10;

// ============================================================================
// Request pipelining
// ============================================================================

/// Target depth of the outbound request pipeline (queued plus outstanding).
pub const REQUEST_PIPELINE_DEPTH: usize = 50;

// ============================================================================
// Timing
// ============================================================================

/// A connection that has received no data for this long is closed by the
/// periodic keepalive tick.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(240);

/// Suggested cadence for the external tick that drives
/// `send_keepalive_or_close`.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Short statistics window: two seconds in one-second buckets. Per-second
/// rates are the window total halved.
pub const SHORT_PERIOD: Period = Period::new(Duration::from_secs(1), 2);

// ============================================================================
// Extension protocol (BEP 10)
// ============================================================================

/// Extension name advertised on Merkle torrents.
pub const EXTENSION_MERKLE: &str = "merkle";

/// Extension name advertised on Elastic torrents.
pub const EXTENSION_ELASTIC: &str = "elastic";
