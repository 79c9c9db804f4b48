//! Hashing and store-path digests.
//!
//! Store paths are derived the way the store derives them: sha256 over a
//! typed fingerprint string, XOR-folded down to 20 bytes, then encoded in
//! the store's base32 alphabet.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

// omitted: E O U T
const BASE32_CHARS: &[u8] = b"0123456789abcdfghijklmnpqrsvwxyz";

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&sha256(data))
}

/// Encode bytes in nix-style base32 (lowercase, no padding, reversed).
pub fn to_nix_base32(bytes: &[u8]) -> String {
    let len = (bytes.len() * 8 - 1) / 5 + 1;

    let encoded: Vec<u8> = (0..len)
        .rev()
        .map(|n| {
            let b: usize = n * 5;
            let i: usize = b / 8;
            let j: usize = b % 8;
            // bits from the lower byte
            let v1 = if i < bytes.len() {
                bytes[i].checked_shr(j as u32).unwrap_or(0)
            } else {
                0
            };
            // bits from the upper byte
            let v2 = if i + 1 < bytes.len() {
                bytes[i + 1].checked_shl((8 - j) as u32).unwrap_or(0)
            } else {
                0
            };
            let v: usize = ((v1 | v2) & 0x1f) as usize;
            BASE32_CHARS[v]
        })
        .collect();

    String::from_utf8(encoded).expect("base32 alphabet is ASCII")
}

/// Decode nix-style base32 back to bytes.
pub fn from_nix_base32(input: &str) -> Result<Vec<u8>> {
    let input = input.as_bytes();
    let output_len = (input.len() * 5) / 8;
    let mut output = vec![0u8; output_len];

    for (i, &c) in input.iter().rev().enumerate() {
        let digit = match BASE32_CHARS.iter().position(|&b| b == c) {
            Some(d) => d,
            None => bail!("invalid base32 character: {}", c as char),
        };

        let b = i * 5;
        let i = b / 8;
        let j = b % 8;

        if i < output_len {
            output[i] |= (digit as u8) << j;

            if i + 1 < output_len && j > 3 {
                output[i + 1] |= (digit as u8) >> (8 - j);
            }
        }
    }

    Ok(output)
}

/// Compress a hash to a smaller size by XORing bytes.
fn compress_hash(hash: &[u8], new_size: usize) -> Vec<u8> {
    let mut result = vec![0u8; new_size];
    for (i, &byte) in hash.iter().enumerate() {
        result[i % new_size] ^= byte;
    }
    result
}

/// Derive a store path from a typed sha256 fingerprint.
///
/// The path digest is the first 20 bytes of an XOR-compressed sha256 over
/// `<type>:sha256:<hash>:<store-dir>:<name>`.
pub fn make_store_path(store_dir: &str, path_type: &str, hash: &[u8; 32], name: &str) -> String {
    let fingerprint = format!(
        "{}:sha256:{}:{}:{}",
        path_type,
        to_hex(hash),
        store_dir,
        name
    );
    let digest = compress_hash(&sha256(fingerprint.as_bytes()), 20);
    format!("{}/{}-{}", store_dir, to_nix_base32(&digest), name)
}

/// Store path of a source tree with the given recursive NAR sha256.
pub fn make_fixed_output_path(store_dir: &str, nar_sha256: &[u8; 32], name: &str) -> String {
    make_store_path(store_dir, "source", nar_sha256, name)
}

/// Store path of a plain-text object referencing `refs`.
pub fn make_text_path(
    store_dir: &str,
    name: &str,
    text: &str,
    refs: &std::collections::BTreeSet<String>,
) -> String {
    let mut path_type = String::from("text");
    for r in refs {
        path_type.push(':');
        path_type.push_str(r);
    }
    make_store_path(store_dir, &path_type, &sha256(text.as_bytes()), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn nix_base32_roundtrip() {
        let data = b"hello world";
        let encoded = to_nix_base32(data);
        let decoded = from_nix_base32(&encoded).unwrap();
        assert_eq!(data.to_vec(), decoded);
    }

    #[test]
    fn nix_base32_lengths() {
        // sha256 digests encode to 52 characters, path digests to 32
        assert_eq!(to_nix_base32(&[0u8; 32]).len(), 52);
        assert_eq!(to_nix_base32(&[0u8; 20]).len(), 32);
    }

    #[test]
    fn nix_base32_alphabet_excludes_confusables() {
        let encoded = to_nix_base32(&(0..=255u8).collect::<Vec<_>>());
        for c in ['e', 'o', 'u', 't'] {
            assert!(!encoded.contains(c), "alphabet must not contain '{}'", c);
        }
    }

    #[test]
    fn from_nix_base32_rejects_bad_chars() {
        assert!(from_nix_base32("abcde!").is_err());
        assert!(from_nix_base32("aetou").is_err());
    }

    #[test]
    fn store_path_shape() {
        let path = make_fixed_output_path("/nix/store", &[7u8; 32], "source");
        let rest = path.strip_prefix("/nix/store/").unwrap();
        let (digest, name) = rest.split_once('-').unwrap();
        assert_eq!(digest.len(), 32);
        assert_eq!(name, "source");
    }

    #[test]
    fn store_path_depends_on_hash_and_name() {
        let a = make_fixed_output_path("/nix/store", &[1u8; 32], "source");
        let b = make_fixed_output_path("/nix/store", &[2u8; 32], "source");
        let c = make_fixed_output_path("/nix/store", &[1u8; 32], "other");
        assert_ne!(a, b);
        assert_ne!(a, c);
        // deterministic
        assert_eq!(a, make_fixed_output_path("/nix/store", &[1u8; 32], "source"));
    }

    #[test]
    fn text_path_depends_on_references() {
        let no_refs = BTreeSet::new();
        let mut refs = BTreeSet::new();
        refs.insert("/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-dep".to_string());
        let a = make_text_path("/nix/store", "flake-closure", "x", &no_refs);
        let b = make_text_path("/nix/store", "flake-closure", "x", &refs);
        assert_ne!(a, b);
    }
}
