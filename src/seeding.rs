use rand::Rng;
use sha2::{Digest, Sha512};

/// Draws a fresh seed from the OS-backed thread RNG.
pub fn create_seed() -> u64 {
    rand::rng().random::<u64>()
}

/// Spreads a seed over the full 64-bit range.
///
/// The digest is taken over the decimal text of the seed so that small,
/// adjacent seeds end up far apart. `None` hashes a fresh random seed.
pub fn hash_seed(seed: Option<u64>) -> u64 {
    let seed = seed.unwrap_or_else(create_seed);
    let digest = Sha512::digest(seed.to_string().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// Seed value sent to the emulator with the first no-op of an episode.
pub fn episode_seed(seed: Option<u64>) -> u64 {
    hash_seed(seed) % 256
}

/// A fresh 32-bit session id; used to suffix FIFO and script paths.
pub fn session_id() -> u32 {
    (hash_seed(None) % (1u64 << 32)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(hash_seed(Some(7)), hash_seed(Some(7)));
        assert_ne!(hash_seed(Some(7)), hash_seed(Some(8)));
    }

    #[test]
    fn episode_seed_fits_in_a_byte() {
        for s in 0..64 {
            assert!(episode_seed(Some(s)) < 256);
        }
    }

    #[test]
    fn session_ids_differ() {
        let ids: Vec<u32> = (0..16).map(|_| session_id()).collect();
        let mut dedup = ids.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), ids.len());
    }
}
