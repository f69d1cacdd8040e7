//! Streaming SHA-256 content hashing.

use crate::error::{ItemResult, Stage, item, item_io};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use vitrine_catalog::ContentHash;

const CHUNK_SIZE: usize = 64 * 1024;

/// Hash everything `reader` yields, a chunk at a time.
pub fn hash_reader(mut reader: impl Read) -> ItemResult<ContentHash> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(item_io(Stage::Hash)(err)),
        };
        hasher.update(&buffer[..read]);
    }
    ContentHash::parse(format!("{:x}", hasher.finalize())).map_err(item(Stage::Hash))
}

/// Blocking; see [`hash_file()`] for use from async code.
pub fn hash_file_blocking(path: &Path) -> ItemResult<ContentHash> {
    let file = File::open(path).map_err(item_io(Stage::Hash))?;
    hash_reader(BufReader::with_capacity(CHUNK_SIZE, file))
}

/// Hash a file's contents on a blocking thread. Files of any size are
/// supported; memory use is bounded by the chunk size.
pub async fn hash_file(path: impl Into<PathBuf>) -> ItemResult<ContentHash> {
    let path = path.into();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path))
        .await
        .map_err(|err| item(Stage::Hash)(exn::Exn::from(err)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    #[rstest]
    #[case(b"".as_slice(), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")]
    #[case(b"abc".as_slice(), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")]
    fn test_known_digests(#[case] input: &[u8], #[case] expected: &str) {
        assert_eq!(hash_reader(Cursor::new(input)).unwrap().as_str(), expected);
    }

    #[test]
    fn test_multi_chunk_input_matches_single_update() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let expected = format!("{:x}", Sha256::digest(&data));
        assert_eq!(hash_reader(Cursor::new(&data)).unwrap().as_str(), expected);
    }

    #[tokio::test]
    async fn test_identical_files_hash_equal() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = (dir.path().join("a.jpg"), dir.path().join("a-copy.jpg"), dir.path().join("other.jpg"));
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();
        std::fs::write(&c, b"different bytes").unwrap();
        assert_eq!(hash_file(&a).await.unwrap(), hash_file(&b).await.unwrap());
        assert_ne!(hash_file(&a).await.unwrap(), hash_file(&c).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_file_is_an_item_error() {
        let err = hash_file("/definitely/not/here.jpg").await.unwrap_err();
        assert_eq!(err.stage, Stage::Hash);
    }
}
