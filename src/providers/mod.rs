//! Embedding and generation backends.
//! The orchestrator only sees these traits; concrete clients live in
//! submodules and normalize their wire formats into `Embedding` / `String`.

pub mod cache;
pub mod http;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::model::Embedding;

pub use cache::CachedEmbeddings;
pub use http::HttpModelClient;

/// Text to dense vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError>;

    /// Model identifier, part of memo keys.
    fn model_name(&self) -> &str;
}

/// Prompt to raw completion text.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

#[async_trait]
impl<T: EmbeddingProvider + ?Sized> EmbeddingProvider for std::sync::Arc<T> {
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        (**self).embed(text).await
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}
