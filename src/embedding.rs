//! Embedding provider boundary.
//!
//! Model execution lives outside the core. The engine only needs three
//! capabilities: embed text, embed a batch, report the output dimension.
//! [`ExternalEmbedding`] is the default provider: it validates vector
//! lengths and refuses to generate, since the caller supplies embeddings
//! with every write.

use crate::config::{Config, EmbeddingProvider};
use crate::error::{PulseError, Result, ValidationError};
use crate::types::Embedding;

/// Capability set for embedding generation.
///
/// Implementations must be `Send + Sync`; the database calls them from the
/// write path while holding the writer lock.
pub trait EmbeddingService: Send + Sync {
    /// Generates an embedding for one text.
    fn embed(&self, text: &str) -> Result<Embedding>;

    /// Generates embeddings for several texts, in input order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Output dimension of every embedding this service produces.
    fn dimension(&self) -> usize;

    /// Checks a caller-supplied embedding against `dimension()`.
    fn validate_embedding(&self, embedding: &Embedding) -> Result<()> {
        if embedding.len() != self.dimension() {
            return Err(
                ValidationError::dimension_mismatch(self.dimension(), embedding.len()).into(),
            );
        }
        Ok(())
    }
}

/// Provider for caller-supplied embeddings.
///
/// `embed()` always fails: with this provider the engine never generates
/// vectors, it only checks their length.
#[derive(Clone, Debug)]
pub struct ExternalEmbedding {
    dimension: usize,
}

impl ExternalEmbedding {
    /// Builds a validator for the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl EmbeddingService for ExternalEmbedding {
    fn embed(&self, _text: &str) -> Result<Embedding> {
        Err(PulseError::embedding(
            "external embedding mode: embeddings must be supplied by the caller",
        ))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Resolves the configured provider into a service instance.
///
/// `Builtin` fails here: bundling a model runtime is outside the core; wire
/// one in by implementing [`EmbeddingService`] and using the `External`
/// provider with caller-side generation.
pub(crate) fn create_embedding_service(config: &Config) -> Result<Box<dyn EmbeddingService>> {
    match &config.embedding_provider {
        EmbeddingProvider::External => {
            Ok(Box::new(ExternalEmbedding::new(config.dimension())))
        }
        EmbeddingProvider::Builtin { .. } => Err(PulseError::embedding(
            "builtin embedding model is not bundled with this build",
        )),
    }
}
