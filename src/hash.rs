//! Content-addressed file identity.
//!
//! Hashing whole multi-gigabyte media files on every event would make the
//! watcher unusable, so identity is SHA-256 over the first 64 KiB, the
//! last 64 KiB, and the decimal file size. Renames and moves keep the
//! hash; any in-place edit that touches head, tail, or length changes it.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

const SAMPLE_BYTES: u64 = 64 * 1024;

/// Compute the content hash of a file: SHA-256(head 64 KiB ‖ tail 64 KiB ‖ size).
///
/// Files smaller than two samples hash the head only (the tail would
/// overlap it) plus the size.
pub fn content_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; SAMPLE_BYTES as usize];

    let head_len = file.read(&mut buf)?;
    hasher.update(&buf[..head_len]);

    if size > SAMPLE_BYTES * 2 {
        file.seek(SeekFrom::End(-(SAMPLE_BYTES as i64)))?;
        let tail_len = file.read(&mut buf)?;
        hasher.update(&buf[..tail_len]);
    }

    hasher.update(size.to_string().as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of a text, used as the embedding cache key.
pub fn text_hash(text: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn identical_content_same_hash() {
        let a = write_temp(b"hello world, this is some file content");
        let b = write_temp(b"hello world, this is some file content");
        assert_eq!(
            content_hash(a.path()).unwrap(),
            content_hash(b.path()).unwrap()
        );
    }

    #[test]
    fn different_content_different_hash() {
        let a = write_temp(b"alpha");
        let b = write_temp(b"omega");
        assert_ne!(
            content_hash(a.path()).unwrap(),
            content_hash(b.path()).unwrap()
        );
    }

    #[test]
    fn size_is_part_of_identity() {
        // Same head sample, different length.
        let short = write_temp(&vec![7u8; 200 * 1024]);
        let long = write_temp(&vec![7u8; 300 * 1024]);
        assert_ne!(
            content_hash(short.path()).unwrap(),
            content_hash(long.path()).unwrap()
        );
    }

    #[test]
    fn tail_edit_changes_hash_on_large_files() {
        let mut base = vec![1u8; 512 * 1024];
        let a = write_temp(&base);
        let last = base.len() - 1;
        base[last] = 2;
        let b = write_temp(&base);
        assert_ne!(
            content_hash(a.path()).unwrap(),
            content_hash(b.path()).unwrap()
        );
    }

    #[test]
    fn middle_edit_is_invisible_by_design() {
        let mut base = vec![1u8; 512 * 1024];
        let a = write_temp(&base);
        base[256 * 1024] = 2;
        let b = write_temp(&base);
        assert_eq!(
            content_hash(a.path()).unwrap(),
            content_hash(b.path()).unwrap()
        );
    }

    #[test]
    fn text_hash_is_deterministic() {
        assert_eq!(text_hash("query"), text_hash("query"));
        assert_ne!(text_hash("query"), text_hash("query "));
    }
}
