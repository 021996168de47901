//! Pluggable 64-bit streaming content hash.

/// Incremental hasher fed with the bytes of a contiguous transfer sequence.
pub trait ContentHasher: Send {
    fn update(&mut self, data: &[u8]);
    fn digest(&self) -> u64;
}

/// Produces a fresh hasher per tracked sequence.
pub trait HashAlgorithm: Send + Sync {
    fn start(&self) -> Box<dyn ContentHasher>;

    /// One-shot digest of a complete buffer.
    fn digest_of(&self, data: &[u8]) -> u64 {
        let mut hasher = self.start();
        hasher.update(data);
        hasher.digest()
    }
}

/// BLAKE3 truncated to its first eight bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Digest64;

struct Blake3Stream(blake3::Hasher);

impl ContentHasher for Blake3Stream {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn digest(&self) -> u64 {
        let hash = self.0.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }
}

impl HashAlgorithm for Blake3Digest64 {
    fn start(&self) -> Box<dyn ContentHasher> {
        Box::new(Blake3Stream(blake3::Hasher::new()))
    }
}

/// Wire form of a digest: lowercase hex of its little-endian bytes.
pub fn digest_hex(digest: u64) -> String {
    hex::encode(digest.to_le_bytes())
}
