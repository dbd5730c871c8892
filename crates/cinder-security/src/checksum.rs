use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_hex_file(path: &Path) -> Result<String> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;
    sha256_hex_reader(file).with_context(|| format!("failed to hash file: {}", path.display()))
}

fn sha256_hex_reader(mut reader: impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .context("failed to read while hashing")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_sha256(bytes: &[u8], expected_hex: &str) -> Result<()> {
    let actual = sha256_hex(bytes);
    compare_digests(&actual, expected_hex)
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<()> {
    let actual = sha256_hex_file(path)?;
    compare_digests(&actual, expected_hex)
        .with_context(|| format!("checksum mismatch for {}", path.display()))
}

/// Verify both the hash and the authored size of a payload file. Presence at
/// a canonical path plus passing this check is the sole proof of a
/// trustworthy payload.
pub fn verify_payload_file(path: &Path, expected_hex: &str, expected_size: u64) -> Result<()> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to stat payload: {}", path.display()))?;
    if !metadata.is_file() {
        return Err(anyhow!("payload is not a regular file: {}", path.display()));
    }
    if metadata.len() != expected_size {
        return Err(anyhow!(
            "payload size mismatch for {}: expected {} bytes, found {}",
            path.display(),
            expected_size,
            metadata.len()
        ));
    }

    verify_sha256_file(path, expected_hex)
}

fn compare_digests(actual_hex: &str, expected_hex: &str) -> Result<()> {
    if actual_hex.eq_ignore_ascii_case(expected_hex.trim()) {
        return Ok(());
    }
    Err(anyhow!(
        "sha256 mismatch: expected {}, computed {}",
        expected_hex.trim(),
        actual_hex
    ))
}
