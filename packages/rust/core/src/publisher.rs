//! Hand-off of finished articles to the destination CMS.

use async_trait::async_trait;
use tracing::info;

use relingo_shared::{Destination, FinishedArticle, Result};

/// Downstream consumer of finished articles.
///
/// Errors are logged by the caller and never roll back the stored article;
/// implementations own their own retry policy.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, article: &FinishedArticle, destination: &Destination) -> Result<()>;
}

/// Publisher that only logs the hand-off. The article stays queryable via
/// `relingo articles`.
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, article: &FinishedArticle, destination: &Destination) -> Result<()> {
        info!(
            job_id = %article.job_id,
            source_url = %article.source_url,
            target_language = %article.target_language,
            title = %article.metadata.title,
            slug = %article.metadata.slug,
            blog_url = %destination.blog_url,
            username = %destination.username,
            bytes = article.content.len(),
            "article ready for publishing"
        );
        Ok(())
    }
}
