//! Text-transformation service boundary.
//!
//! The pipeline sees the model as an opaque function from `(stage, content,
//! language)` to new content, failing with a [`TransformError`] from a fixed
//! taxonomy. [`OpenAiClient`] is the production implementation.

mod client;
mod error;
pub mod prompts;

use async_trait::async_trait;
use relingo_shared::{ArticleMetadata, Stage};

pub use client::OpenAiClient;
pub use error::TransformError;

/// Opaque text-transformation service.
#[async_trait]
pub trait TransformService: Send + Sync {
    /// Produce the content of `stage` from the previous stage's content.
    ///
    /// `target_language` is needed for [`Stage::Translated`] and
    /// [`Stage::Improved`].
    async fn transform(
        &self,
        stage: Stage,
        content: &str,
        target_language: Option<&str>,
    ) -> Result<String, TransformError>;

    /// Derive title, description and slug for an assembled article.
    async fn extract_metadata(
        &self,
        content: &str,
        target_language: &str,
    ) -> Result<ArticleMetadata, TransformError>;
}
