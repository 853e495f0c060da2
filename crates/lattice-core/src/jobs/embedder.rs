//! Embedding providers
//!
//! The worker is decoupled from any concrete embedding backend through
//! the `Embedder` trait. A provider that is not configured reports itself
//! disabled and the worker simply does not start.

use async_trait::async_trait;

use crate::error::Result;

/// Computes embedding vectors for object text
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Whether the provider is configured and usable
    fn is_enabled(&self) -> bool {
        true
    }

    /// The dimensionality of produced vectors
    fn dimensions(&self) -> usize;

    /// Embed one text into a vector of `dimensions()` floats
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Deterministic offline embedder.
///
/// Hashes token trigrams into a fixed-size vector and L2-normalizes it.
/// Not semantically meaningful, but stable across runs, which makes it
/// useful for tests and for running the engine without a remote
/// embedding provider.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in text.to_lowercase().split_whitespace() {
            let bytes = token.as_bytes();
            let windows: Vec<&[u8]> = if bytes.len() < 3 {
                vec![bytes]
            } else {
                bytes.windows(3).collect()
            };
            for gram in windows {
                let slot = fnv1a(gram) as usize % self.dimensions;
                vector[slot] += 1.0;
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }
}

/// An embedder that is never enabled; workers built on it stay stopped
#[derive(Debug, Clone, Default)]
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn is_enabled(&self) -> bool {
        false
    }

    fn dimensions(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(crate::error::Error::Other(
            "embedding provider is disabled".into(),
        ))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
