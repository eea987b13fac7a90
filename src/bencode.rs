//! Bencode encoding and decoding (BEP 3).
//!
//! Only the extension-protocol layer uses bencode here: handshake
//! dictionaries flow through [`decode`] and [`encode`] and are otherwise
//! kept opaque as [`Value`] trees.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;

#[cfg(test)]
mod tests;
