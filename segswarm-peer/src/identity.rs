use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest as _, Sha256};

use crate::types::Stream;

/// Length in bytes of a swarm or peer id before hex encoding.
pub const ID_BYTES: usize = 20;

const PEER_ID_PREFIX: &str = "-SS0100-";
const PEER_ID_RANDOM_LEN: usize = 12;

/// Hex-encoded truncated SHA-256 of `data`.
pub fn hash_id(data: impl AsRef<[u8]>) -> String {
    let digest = Sha256::digest(data.as_ref());
    hex::encode(&digest[..ID_BYTES])
}

/// Swarm identifier for a stream rendition, shared by every viewer of the
/// same manifest.
pub fn swarm_id(manifest_url: &str, stream: &Stream) -> String {
    hash_id(stream.external_id(manifest_url))
}

/// A fresh random peer identifier, hashed.
pub fn generate_peer_id() -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PEER_ID_RANDOM_LEN)
        .map(char::from)
        .collect();
    hash_id(format!("{PEER_ID_PREFIX}{random}"))
}
