//! Content checksums for files moved between the local disk and storage
//! elements.
//!
//! Checksums are CRC32 values rendered as eight lowercase hex digits.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::DmResult;

const READ_CHUNK: usize = 1 << 20;

/// Checksum of an in-memory buffer.
pub fn checksum_bytes(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// Checksum of a local file, streamed in 1 MiB chunks.
pub async fn file_checksum(path: &Path) -> DmResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    let value = format!("{:08x}", hasher.finalize());
    debug!(path = %path.display(), size = total, checksum = %value, "computed file checksum");
    Ok(value)
}

/// Compare two checksums ignoring case and leading zeros.
pub fn checksums_match(a: &str, b: &str) -> bool {
    let norm = |s: &str| s.trim().trim_start_matches('0').to_ascii_lowercase();
    norm(a) == norm(b)
}
