//! Content-addressed fingerprint of a file: SHA-256 over the concatenated
//! SHA-256 digests of fixed 4 MiB blocks, rendered as lowercase hex. Two
//! files hash equal iff they are byte-identical.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Hash of the empty file: SHA-256 of the empty block-digest string.
pub const EMPTY_CONTENT_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Streaming hash of a file. Reads in small buffers so peak memory stays
/// well below one block regardless of file size.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut outer = Sha256::new();
    let mut block = Sha256::new();
    let mut block_len = 0usize;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        let mut chunk = &buf[..n];
        while !chunk.is_empty() {
            let take = (BLOCK_SIZE - block_len).min(chunk.len());
            block.update(&chunk[..take]);
            block_len += take;
            chunk = &chunk[take..];
            if block_len == BLOCK_SIZE {
                outer.update(block.finalize_reset());
                block_len = 0;
            }
        }
    }

    if block_len > 0 {
        outer.update(block.finalize_reset());
    }
    Ok(format!("{:x}", outer.finalize()))
}

/// Same construction over an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut outer = Sha256::new();
    for block in data.chunks(BLOCK_SIZE) {
        outer.update(Sha256::digest(block));
    }
    format!("{:x}", outer.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_temp_dir;

    #[test]
    fn empty_input_hashes_to_fixed_constant() {
        assert_eq!(hash_bytes(b""), EMPTY_CONTENT_HASH);

        let root = make_temp_dir();
        let p = root.join("empty.bin");
        fs::write(&p, b"").unwrap();
        assert_eq!(hash_file(&p).unwrap(), EMPTY_CONTENT_HASH);
    }

    #[test]
    fn file_and_buffer_agree() {
        let root = make_temp_dir();
        let p = root.join("hello.txt");
        fs::write(&p, b"hello").unwrap();
        assert_eq!(hash_file(&p).unwrap(), hash_bytes(b"hello"));
    }

    #[test]
    fn single_block_matches_double_sha256() {
        // Below one block the construction is SHA256(SHA256(data)).
        let inner = Sha256::digest(b"hello");
        let expected = format!("{:x}", Sha256::digest(inner));
        assert_eq!(hash_bytes(b"hello"), expected);
    }

    #[test]
    fn block_boundary_splits_digests() {
        // One byte past a block boundary must hash as two blocks.
        let mut data = vec![0xabu8; BLOCK_SIZE + 1];
        data[BLOCK_SIZE] = 0xcd;
        let mut concat = Vec::new();
        concat.extend_from_slice(&Sha256::digest(&data[..BLOCK_SIZE]));
        concat.extend_from_slice(&Sha256::digest(&data[BLOCK_SIZE..]));
        let expected = format!("{:x}", Sha256::digest(&concat));
        assert_eq!(hash_bytes(&data), expected);

        let root = make_temp_dir();
        let p = root.join("boundary.bin");
        fs::write(&p, &data).unwrap();
        assert_eq!(hash_file(&p).unwrap(), expected);
    }

    #[test]
    fn hash_is_content_only() {
        let root = make_temp_dir();
        let a = root.join("a.bin");
        let b = root.join("sub");
        fs::create_dir_all(&b).unwrap();
        let b = b.join("b.bin");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();
        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn missing_file_is_an_error() {
        let root = make_temp_dir();
        assert!(hash_file(&root.join("nope.bin")).is_err());
    }
}
