//! Integrity verification for finished artifacts: SHA-256 against a
//! user-supplied digest, or size verification by stat.

use crate::error::DownloadError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Compute the SHA-256 of a file, streaming in 8 KiB reads.
pub fn hash_file(path: &Path) -> Result<String, DownloadError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash off the async runtime and compare, case-insensitively, against the
/// expected hex digest.
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<bool, DownloadError> {
    let path: PathBuf = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| DownloadError::Io(e.to_string()))??;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

/// Size verification by stat: the artifact must be exactly `expected` bytes.
pub fn verify_size(path: &Path, expected: u64) -> Result<bool, DownloadError> {
    let meta = std::fs::metadata(path)?;
    Ok(meta.len() == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello world")
            .unwrap();

        // sha256("hello world")
        let expected = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        assert!(verify_sha256(&path, expected).await.unwrap());
        assert!(verify_sha256(&path, &expected.to_uppercase()).await.unwrap());
        assert!(!verify_sha256(&path, &"0".repeat(64)).await.unwrap());
    }

    #[test]
    fn size_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("four.bin");
        std::fs::write(&path, b"1234").unwrap();
        assert!(verify_size(&path, 4).unwrap());
        assert!(!verify_size(&path, 5).unwrap());
        assert!(verify_size(&path.join("missing"), 4).is_err());
    }
}
