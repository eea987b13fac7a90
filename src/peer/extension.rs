use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{decode, encode, Value};

/// Sub-id of the extension-protocol handshake message.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// One extension-protocol handshake: extensions added or removed, plus the
/// rest of the dictionary, kept opaque for the coordinator to interpret.
///
/// The wire form is a bencoded dictionary whose `m` key maps extension names
/// to sub-ids; a sub-id of 0 withdraws the extension ([BEP-10]).
///
/// [BEP-10]: http://bittorrent.org/beps/bep_0010.html
#[derive(Debug, Clone, Default)]
pub struct ExtensionUpdate {
    /// Extensions enabled by this handshake, with their announced sub-ids.
    pub added: Vec<(String, u8)>,
    /// Extensions withdrawn by this handshake.
    pub removed: Vec<String>,
    /// The full handshake dictionary, for extension-specific keys.
    pub extra: Option<Value>,
}

impl ExtensionUpdate {
    /// Decodes a handshake payload.
    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value = decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("handshake is not a dictionary".into()))?;

        let mut added = Vec::new();
        let mut removed = Vec::new();

        if let Some(m) = dict.get(b"m".as_slice()).and_then(|v| v.as_dict()) {
            for (key, val) in m {
                let (Ok(name), Some(id)) = (std::str::from_utf8(key), val.as_integer()) else {
                    continue;
                };
                if !(0..=u8::MAX as i64).contains(&id) {
                    return Err(PeerError::Extension(format!(
                        "extension id {} out of range",
                        id
                    )));
                }
                if id == 0 {
                    removed.push(name.to_string());
                } else {
                    added.push((name.to_string(), id as u8));
                }
            }
        }

        Ok(Self {
            added,
            removed,
            extra: Some(value),
        })
    }

    /// Encodes a handshake payload announcing `added` under the given
    /// sub-ids and withdrawing `removed`. Top-level keys of `extra` are
    /// carried alongside the `m` dictionary.
    pub fn encode(
        added: &[(String, u8)],
        removed: &[String],
        extra: Option<&Value>,
    ) -> Result<Bytes, PeerError> {
        let mut dict = match extra.and_then(|v| v.as_dict()) {
            Some(d) => d.clone(),
            None => BTreeMap::new(),
        };

        let mut m = BTreeMap::new();
        for (name, id) in added {
            m.insert(
                Bytes::copy_from_slice(name.as_bytes()),
                Value::Integer(*id as i64),
            );
        }
        for name in removed {
            m.insert(Bytes::copy_from_slice(name.as_bytes()), Value::Integer(0));
        }
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));

        let encoded = encode(&Value::Dict(dict))?;
        Ok(Bytes::from(encoded))
    }
}
