//! Embedding provider abstraction and concrete clients.

use anyhow::Result;

mod openai;

pub use openai::{OpenAiConfig, OpenAiEmbedder};

/// Trait implemented by concrete embedding providers.
///
/// Implementations return one vector per input, in input order, all with the
/// same dimensionality. Repeated calls with the same text must stay
/// semantically stable (a text is always maximally similar to itself).
pub trait TextEmbedder {
    /// Embeds a batch of strings.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Maximum inputs accepted per [`TextEmbedder::embed_batch`] call.
    fn batch_size(&self) -> usize {
        32
    }
}
