use std::net::Ipv4Addr;

use sha1::{Digest, Sha1};

/// Generates the allowed-fast set for a peer (BEP-6).
///
/// The set is a deterministic function of the peer's IPv4 address (low
/// octet zeroed), the torrent's info hash, and the piece count, so both
/// sides can derive it independently. IPv6 peers receive no set.
///
/// `count` is the number of distinct indices to produce, normally
/// `min(ALLOWED_FAST_THRESHOLD, num_pieces)`.
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: Ipv4Addr,
    num_pieces: u32,
    count: usize,
) -> Vec<u32> {
    if num_pieces == 0 || count == 0 {
        return Vec::new();
    }

    let octets = peer_ip.octets();
    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&[octets[0], octets[1], octets[2], 0]);
    x.extend_from_slice(info_hash);

    let mut allowed_set = Vec::with_capacity(count);

    while allowed_set.len() < count {
        let mut hasher = Sha1::new();
        hasher.update(&x);
        let hash = hasher.finalize();

        for chunk in hash.chunks(4) {
            if allowed_set.len() >= count {
                break;
            }

            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % num_pieces;

            if !allowed_set.contains(&index) {
                allowed_set.push(index);
            }
        }

        x = hash.to_vec();
    }

    allowed_set
}
