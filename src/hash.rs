// Hashing module using SHA-256

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::constants::HASH_CHUNK_SIZE;
use crate::error::Result;

/// Compute the SHA-256 of a file on disk, streaming in chunks.
pub fn compute_file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex_digest(hasher))
}

/// Compute the SHA-256 of an in-memory byte slice.
pub fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_digest(hasher)
}

/// Compute the SHA-256 of a value's canonical JSON form.
///
/// serde_json serializes map keys in sorted order (the `preserve_order`
/// feature is off) and emits no insignificant whitespace, so equal values
/// hash equally on both sides of a sync regardless of field insertion order.
/// Values hashed here must keep their maps as BTreeMap.
pub fn compute_canonical_sha256<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(compute_sha256(&bytes))
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_hash_matches_bytes_hash() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        let from_file = compute_file_sha256(file.path()).unwrap();
        let from_bytes = compute_sha256(b"Hello, World!");
        assert_eq!(from_file, from_bytes);
        assert_eq!(from_file.len(), 64);
    }

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        assert_eq!(
            compute_sha256(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_canonical_hash_is_order_independent() {
        let mut first = BTreeMap::new();
        first.insert("b".to_string(), vec!["2".to_string()]);
        first.insert("a".to_string(), vec!["1".to_string()]);

        let mut second = BTreeMap::new();
        second.insert("a".to_string(), vec!["1".to_string()]);
        second.insert("b".to_string(), vec!["2".to_string()]);

        assert_eq!(
            compute_canonical_sha256(&first).unwrap(),
            compute_canonical_sha256(&second).unwrap()
        );
    }
}
