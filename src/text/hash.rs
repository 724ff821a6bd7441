//! Hash utilities for content-based cache keys.
//!
//! Embedding keys combine the child text with its section geometry, so the
//! hasher is incremental rather than a one-shot function.

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Incremental FNV-1a 64-bit hasher.
///
/// Fast and non-cryptographic; suitable for change detection and cache keys,
/// not for adversarial inputs.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a {
    state: u64,
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self { state: FNV_OFFSET }
    }
}

impl Fnv1a {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.state ^= *byte as u64;
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn write_str(&mut self, text: &str) {
        self.write(text.as_bytes());
    }

    pub fn write_usize(&mut self, value: usize) {
        self.write(&(value as u64).to_le_bytes());
    }

    pub fn finish(&self) -> u64 {
        self.state
    }
}

/// Compute the FNV-1a 64-bit hash of text content.
///
/// # Example
///
/// ```
/// use nestcache::text::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash("var x=1;"), fnv1a_hash("var x=1;"));
/// assert_ne!(fnv1a_hash("var x=1;"), fnv1a_hash("var y=2;"));
/// ```
#[inline]
pub fn fnv1a_hash(text: &str) -> u64 {
    let mut hasher = Fnv1a::new();
    hasher.write_str(text);
    hasher.finish()
}
