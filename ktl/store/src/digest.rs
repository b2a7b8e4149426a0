use sha2::{Digest as _, Sha256};

/// All-zero digest used as `prev_digest` for `seq == 1` (`spec.md` §4.3).
pub const GENESIS_DIGEST: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// `Digest(N) = H(Digest(N-1) || canonical(event N))` (`spec.md` glossary).
pub fn chain(prev_digest: &str, canonical_event_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_digest.as_bytes());
    hasher.update(canonical_event_bytes);
    hex::encode(hasher.finalize())
}

/// CRC32 of the canonical bytes, stored alongside the SHA-256 digest as a
/// cheap corruption check that doesn't require walking the whole chain
/// (`spec.md` §3 `RunEvent.CRC32`).
pub fn crc32(canonical_event_bytes: &[u8]) -> u32 {
    crc32fast::hash(canonical_event_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_deterministic() {
        let a = chain(GENESIS_DIGEST, b"event-1");
        let b = chain(GENESIS_DIGEST, b"event-1");
        assert_eq!(a, b);
    }

    #[test]
    fn chain_depends_on_prev_digest() {
        let a = chain(GENESIS_DIGEST, b"event-1");
        let b = chain("deadbeef", b"event-1");
        assert_ne!(a, b);
    }
}
