pub mod browser;
pub mod flatfox;
pub mod homegate;
pub mod registry;
pub mod stadt_zuerich;
pub mod traits;
pub mod types;

pub use flatfox::FlatfoxScraper;
pub use homegate::HomegateScraper;
pub use registry::{SourceOptions, SourceRegistry};
pub use stadt_zuerich::StadtZuerichScraper;
pub use traits::ListingSource;
pub use types::SearchParams;

use reqwest::{Client, ClientBuilder, StatusCode};
use scraper::{ElementRef, Selector};
use std::time::Duration;
use tracing::debug;

use crate::control::RateLimiter;
use crate::error::SourceError;

pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Markers of challenge/denial pages served instead of content
const BLOCK_MARKERS: &[&str] = &[
    "captcha-delivery.com",
    "px-captcha",
    "cf-chl-",
    "challenge-platform",
    "<title>just a moment",
    "<title>access denied",
    "are you a robot",
];

pub(crate) fn client_builder() -> ClientBuilder {
    Client::builder()
        .timeout(Duration::from_secs(20))
        .user_agent(USER_AGENT)
}

/// Why a response looks like anti-scraping pushback, if it does
pub(crate) fn detect_block(status: Option<StatusCode>, body: &str) -> Option<String> {
    if let Some(status) = status {
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            return Some(format!("HTTP {}", status.as_u16()));
        }
    }

    let lower = body.to_lowercase();
    BLOCK_MARKERS
        .iter()
        .find(|marker| lower.contains(*marker))
        .map(|marker| format!("challenge page ({})", marker))
}

/// GET a page after pacing, classifying blocks and bad statuses
pub(crate) async fn fetch_page(
    client: &Client,
    limiter: &RateLimiter,
    url: &str,
) -> Result<String, SourceError> {
    limiter.pace().await;
    debug!("Fetching URL: {}", url);

    let response = client.get(url).send().await?;
    let status = response.status();
    let body = response.text().await?;
    debug!("Downloaded {} bytes from {}", body.len(), url);

    if let Some(reason) = detect_block(Some(status), &body) {
        return Err(SourceError::Blocked(format!("{}: {}", url, reason)));
    }
    if !status.is_success() {
        return Err(SourceError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(body)
}

pub(crate) fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("selector {:?}: {:?}", css, e)))
}

/// Whitespace-collapsed text content of an element
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_on_status_and_markers() {
        assert_eq!(
            detect_block(Some(StatusCode::TOO_MANY_REQUESTS), "").as_deref(),
            Some("HTTP 429")
        );
        assert!(detect_block(
            Some(StatusCode::OK),
            "<html><head><title>Just a moment...</title></head></html>"
        )
        .is_some());
        assert!(detect_block(None, "<div class=\"listing-thumb\"></div>").is_none());
        assert!(detect_block(Some(StatusCode::NOT_FOUND), "not here").is_none());
    }
}
