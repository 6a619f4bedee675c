use rand::Rng;

/// Azureus-style client identifier prefix (BEP 20): two letters, four
/// version digits, both hyphen-delimited.
const CLIENT_PREFIX: &[u8; 8] = b"-BB0100-";

/// Generates a fresh 20-byte peer id: the client prefix followed by random
/// bytes, unique per run (never persisted or reused across restarts).
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(CLIENT_PREFIX);
    rand::thread_rng().fill(&mut peer_id[8..]);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], CLIENT_PREFIX);
    }

    #[test]
    fn random_suffix_varies() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_ne!(&a[8..], &b[8..]);
    }
}
