//! Utility functions for the filebuild engine

pub mod case;
pub mod json;

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

pub use case::{FoldedCase, NativeCase, PathCase};
pub use json::{HashableValue, ValueError, is_equal, sanitize, to_hashable};

/**
 * Hash a single file and return the hex-encoded SHA-256 of its contents
 */
pub fn hash_file<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let file = File::open(path.as_ref())?;

    // Use a buffered reader to be efficient for large files
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_file() {
        let dir = std::env::temp_dir().join("filebuild_test_hash");
        std::fs::create_dir_all(&dir).unwrap();

        let file_path = dir.join("test.txt");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"test content").unwrap();

        let hash = hash_file(&file_path).unwrap();
        assert_eq!(hash.len(), 64, "SHA-256 hex should be 64 chars");

        // Same content should produce same hash
        let file_path2 = dir.join("test2.txt");
        let mut file2 = File::create(&file_path2).unwrap();
        file2.write_all(b"test content").unwrap();
        assert_eq!(hash, hash_file(&file_path2).unwrap());

        // Different content should produce a different hash
        std::fs::write(&file_path2, "other content").unwrap();
        assert_ne!(hash, hash_file(&file_path2).unwrap());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_hash_missing_file() {
        let dir = std::env::temp_dir().join("filebuild_test_hash_missing");
        std::fs::create_dir_all(&dir).unwrap();

        assert!(hash_file(dir.join("no_such_file")).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
