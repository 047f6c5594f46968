//! Key generation, hashing, and log obfuscation
//!
//! Keys are addressed in the store either raw or by a short hash selected
//! with `hash_key_function`. Generated tokens embed the owning org ID so a
//! key can be traced back without a lookup.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Generate a fresh token for an org. When `key_id` is empty a random one
/// is minted.
pub fn generate_token(org_id: &str, key_id: &str) -> String {
    let key_id = if key_id.is_empty() {
        uuid::Uuid::new_v4().simple().to_string()
    } else {
        key_id.to_string()
    };
    format!("{}{}", org_id, key_id)
}

/// Extract the org ID embedded in a generated token, if any.
pub fn token_org(token: &str) -> String {
    // Org IDs are 24-char hex identifiers; generated tokens start with one.
    if token.len() > 24 && token[..24].bytes().all(|b| b.is_ascii_hexdigit()) {
        token[..24].to_string()
    } else {
        String::new()
    }
}

/// Hash a key with the configured algorithm. Unknown algorithms fall back
/// to murmur32, matching the storage default.
pub fn hash_str(input: &str, algo: &str) -> String {
    match algo {
        "sha256" => {
            let mut hasher = Sha256::new();
            hasher.update(input.as_bytes());
            hex_encode(&hasher.finalize())
        }
        "murmur64" => {
            let (h1, _) = murmur3_x64_128(input.as_bytes(), 0);
            format!("{:x}", h1)
        }
        "murmur128" => {
            let (h1, h2) = murmur3_x64_128(input.as_bytes(), 0);
            format!("{:x}{:016x}", h1, h2)
        }
        _ => format!("{:x}", murmur3_x86_32(input.as_bytes(), 0)),
    }
}

/// Hash a key iff hashing is enabled; otherwise return it unchanged.
pub fn hash_key(key: &str, hash_keys: bool, algo: &str) -> String {
    if !hash_keys {
        return key.to_string();
    }
    hash_str(key, algo)
}

/// Obfuscate a key for log output, keeping the last four characters.
pub fn obfuscate(key: &str) -> String {
    if key.len() > 4 {
        format!("****{}", &key[key.len() - 4..])
    } else if key.is_empty() {
        String::new()
    } else {
        "--".to_string()
    }
}

/// Random secret for OAuth clients: base64 of 32 random bytes.
pub fn generate_client_secret() -> String {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 32];
    // SystemRandom only fails when the OS RNG is unavailable
    rng.fill(&mut bytes).expect("system rng unavailable");
    BASE64.encode(bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Murmur3 x86 32-bit
fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let mut k1: u32 = 0;
    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    fmix32(h1)
}

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Murmur3 x64 128-bit; the 64-bit variant takes the first half.
fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    const C1: u64 = 0x87c3_7b91_1142_53d5;
    const C2: u64 = 0x4cf5_ad43_2745_937f;

    let mut h1 = seed;
    let mut h2 = seed;

    let chunks = data.chunks_exact(16);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k1 = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(chunk[8..16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    for i in (0..tail.len()).rev() {
        match i {
            8..=14 => k2 ^= (tail[i] as u64) << ((i - 8) * 8),
            _ => k1 ^= (tail[i] as u64) << (i * 8),
        }
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    (h1, h2)
}

fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Token generation ---

    #[test]
    fn test_generate_token_embeds_org() {
        let token = generate_token("5e9d9544a1dcd60001d0ed20", "");
        assert!(token.starts_with("5e9d9544a1dcd60001d0ed20"));
        assert!(token.len() > 24);
    }

    #[test]
    fn test_generate_token_custom_key() {
        let token = generate_token("5e9d9544a1dcd60001d0ed20", "mykey");
        assert_eq!(token, "5e9d9544a1dcd60001d0ed20mykey");
    }

    #[test]
    fn test_token_org_roundtrip() {
        let token = generate_token("5e9d9544a1dcd60001d0ed20", "");
        assert_eq!(token_org(&token), "5e9d9544a1dcd60001d0ed20");
        assert_eq!(token_org("custom-key"), "");
    }

    // --- Hashing ---

    #[test]
    fn test_murmur32_known_vectors() {
        assert_eq!(murmur3_x86_32(b"", 0), 0);
        assert_eq!(murmur3_x86_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(murmur3_x86_32(b"hello, world", 0), 0x149b_bb7f);
    }

    #[test]
    fn test_murmur128_known_vector() {
        let (h1, _) = murmur3_x64_128(b"hello", 0);
        assert_eq!(h1, 0xcbd8_a7b3_41bd_9b02);
    }

    #[test]
    fn test_hash_str_sha256() {
        assert_eq!(
            hash_str("abc", "sha256"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_str_stable_across_algos() {
        for algo in ["murmur32", "murmur64", "murmur128", "sha256"] {
            assert_eq!(hash_str("key", algo), hash_str("key", algo));
            assert_ne!(hash_str("key", algo), hash_str("other", algo));
        }
    }

    #[test]
    fn test_hash_key_disabled_is_identity() {
        assert_eq!(hash_key("secret", false, "murmur32"), "secret");
        assert_ne!(hash_key("secret", true, "murmur32"), "secret");
    }

    // --- Obfuscation ---

    #[test]
    fn test_obfuscate() {
        assert_eq!(obfuscate("1234567890"), "****7890");
        assert_eq!(obfuscate("abc"), "--");
        assert_eq!(obfuscate(""), "");
    }

    // --- Secrets ---

    #[test]
    fn test_client_secret_unique() {
        let a = generate_client_secret();
        let b = generate_client_secret();
        assert_ne!(a, b);
        assert!(a.len() >= 40);
    }
}
