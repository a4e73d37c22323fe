//! Cryptographic hashing utilities for package integrity verification

use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::Path;

/// Calculate SHA1 hash of data (for npm).
///
/// npm records a SHA1 hex digest under `dist.shasum` for every published
/// version, so this is the digest used across the registry engine.
///
/// # Examples
///
/// ```
/// # use vm_npm_registry::hash_utils::sha1_hash;
/// let data = b"hello world";
/// let hash = sha1_hash(data);
/// assert_eq!(hash.len(), 40); // SHA1 produces 40 hex characters
/// ```
pub fn sha1_hash(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Calculate the SHA1 hash of a file without loading it into memory.
pub fn sha1_file<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
