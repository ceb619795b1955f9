/// Default hashmap for quay. Opts-out of more expensive secure hash.
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
/// Default hashset for quay. Opts-out of more expensive secure hash.
pub type HashSet<T> = std::collections::HashSet<T, ahash::RandomState>;

use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::io::Read;
use std::path::Path;

/// 64-bit content checksum rendered as fixed-width lowercase hex. This is
/// the `hash` field carried by version files, bundles and update descriptors.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = SipHasher13::new();
    hasher.write(data);
    format!("{:0>16x}", hasher.finish())
}

/// Checksum a file on disk without reading it fully into memory.
pub fn content_hash_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = SipHasher13::new();
    let mut file = std::fs::File::open(path)?;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.write(&buffer[..read]);
    }

    Ok(format!("{:0>16x}", hasher.finish()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_is_stable_and_fixed_width() {
        let a = content_hash(b"bundle contents");
        let b = content_hash(b"bundle contents");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = content_hash(b"other contents");
        assert_ne!(a, c);
    }

    #[test]
    fn file_hash_matches_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.bin");
        std::fs::write(&path, b"some bundle payload").unwrap();

        assert_eq!(
            content_hash_file(&path).unwrap(),
            content_hash(b"some bundle payload")
        );
    }
}
