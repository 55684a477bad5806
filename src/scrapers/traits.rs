use crate::error::SourceError;
use crate::models::Listing;
use crate::scrapers::types::SearchParams;
use async_trait::async_trait;

/// Common trait for all listing sources
#[async_trait]
pub trait ListingSource: Send + Sync {
    /// Scrape the listings matching `params`.
    ///
    /// Zero matches is `Ok(vec![])`; errors are for transport, parse and
    /// block failures, which the caller may retry.
    async fn scrape(&self, params: &SearchParams) -> Result<Vec<Listing>, SourceError>;

    /// Get the name of the scraper source
    fn source_name(&self) -> &'static str;
}
