use crate::control::RateLimiter;
use crate::error::SourceError;
use crate::models::{Listing, Scalar};
use crate::scrapers::browser::{browser_error, run_blocking, ChromeSession};
use crate::scrapers::detect_block;
use crate::scrapers::traits::ListingSource;
use crate::scrapers::types::SearchParams;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

const LISTINGS_POINTER: &str = "/resultList/search/fullSearch/result/listings";
const STATE_SCRIPT: &str = "JSON.stringify(window.__INITIAL_STATE__ || null)";

/// Homegate scraper. Results only exist in the page's initial JSON state,
/// so this one goes through headless Chrome.
pub struct HomegateScraper {
    limiter: Arc<RateLimiter>,
    headless: bool,
    max_detail: usize,
}

impl HomegateScraper {
    pub fn new(limiter: Arc<RateLimiter>, headless: bool, max_detail: usize) -> Self {
        Self {
            limiter,
            headless,
            max_detail,
        }
    }

    pub fn search_url(params: &SearchParams) -> Result<String, SourceError> {
        let zip = params
            .query_value("zip")
            .ok_or_else(|| SourceError::InvalidParams("homegate needs a zip".into()))?;

        let mut query = Vec::new();
        for (name, key) in [
            ("be", "radius"),
            ("ac", "min_rooms"),
            ("ad", "max_rooms"),
            ("ah", "max_price"),
        ] {
            if let Some(value) = params.query_value(key) {
                query.push(format!("{}={}", name, value));
            }
        }
        query.push("ep=1".to_string());

        Ok(format!(
            "https://www.homegate.ch/mieten/immobilien/plz-{}/trefferliste?{}",
            zip,
            query.join("&")
        ))
    }

    /// Map the result list of `window.__INITIAL_STATE__` to listings
    pub fn listings_from_state(state: &Value) -> Result<Vec<Listing>, SourceError> {
        let entries = state
            .pointer(LISTINGS_POINTER)
            .and_then(Value::as_array)
            .ok_or_else(|| SourceError::Parse(format!("no array at {}", LISTINGS_POINTER)))?;

        Ok(entries
            .iter()
            .filter_map(|entry| entry.get("listing"))
            .filter_map(Self::listing_from_entry)
            .collect())
    }

    fn listing_from_entry(listing: &Value) -> Option<Listing> {
        let id = match listing.get("id")? {
            Value::String(id) => id.clone(),
            Value::Number(id) => id.to_string(),
            _ => return None,
        };

        let title = listing
            .pointer("/localization/de/text/title")
            .or_else(|| {
                listing
                    .get("localization")?
                    .as_object()?
                    .values()
                    .find_map(|loc| loc.pointer("/text/title"))
            })
            .and_then(Value::as_str)
            .map(str::to_string);

        let price = listing.pointer("/prices/rent/gross").and_then(Value::as_f64).map(|gross| {
            let currency = listing
                .pointer("/prices/currency")
                .and_then(Value::as_str)
                .unwrap_or("CHF");
            Scalar::Text(format!("{} {}", currency, gross))
        });

        let rooms = listing
            .pointer("/characteristics/numberOfRooms")
            .and_then(Value::as_f64)
            .map(Scalar::Number);

        let locality = listing.pointer("/address/locality").and_then(Value::as_str);
        let postal_code = listing.pointer("/address/postalCode").and_then(Value::as_str);
        let location = match (postal_code, locality) {
            (Some(zip), Some(place)) => Some(format!("{} {}", zip, place)),
            (None, Some(place)) => Some(place.to_string()),
            _ => None,
        };

        Some(Listing {
            title,
            price,
            location,
            url: format!("https://www.homegate.ch/mieten/{}", id),
            rooms,
        })
    }

    /// Runs on a blocking thread; `handle` lets it wait on the shared limiter
    fn scrape_blocking(
        url: String,
        headless: bool,
        max_detail: usize,
        limiter: Arc<RateLimiter>,
        handle: Handle,
    ) -> Result<Vec<Listing>, SourceError> {
        let session = ChromeSession::launch(headless).map_err(browser_error)?;

        handle.block_on(limiter.pace());
        info!("🔍 Navigating to: {}", url);
        let tab = session.open(&url).map_err(browser_error)?;

        let html = ChromeSession::html(&tab).map_err(browser_error)?;
        if let Some(reason) = detect_block(None, &html) {
            return Err(SourceError::Blocked(format!("{}: {}", url, reason)));
        }

        let state_json = ChromeSession::evaluate_string(&tab, STATE_SCRIPT)
            .map_err(browser_error)?
            .unwrap_or_else(|| "null".to_string());
        let state: Value = serde_json::from_str(&state_json)
            .map_err(|e| SourceError::Parse(format!("initial state: {}", e)))?;
        if state.is_null() {
            return Err(SourceError::SoftMiss("page has no __INITIAL_STATE__".into()));
        }

        let mut listings = Self::listings_from_state(&state)?;
        info!("🔗 Extracted {} listings", listings.len());

        // titles missing from the result list come from the detail page
        let untitled: Vec<usize> = listings
            .iter()
            .enumerate()
            .filter(|(_, l)| l.title.is_none())
            .map(|(i, _)| i)
            .take(max_detail)
            .collect();

        for index in untitled {
            let detail_url = listings[index].url.clone();
            handle.block_on(limiter.pace());

            let title = session.open(&detail_url).and_then(|detail| {
                let title = ChromeSession::evaluate_string(&detail, "document.title");
                let _ = detail.close(true);
                title
            });
            match title {
                Ok(Some(title)) if !title.trim().is_empty() => {
                    listings[index].title = Some(title.trim().to_string());
                }
                Ok(_) => warn!("No title on {}", detail_url),
                Err(e) => warn!("Failed {}: {:#}", detail_url, e),
            }
        }

        Ok(listings)
    }
}

#[async_trait]
impl ListingSource for HomegateScraper {
    async fn scrape(&self, params: &SearchParams) -> Result<Vec<Listing>, SourceError> {
        let url = Self::search_url(params)?;
        let headless = self.headless;
        let max_detail = self.max_detail;
        let limiter = Arc::clone(&self.limiter);

        run_blocking(move |handle| {
            Self::scrape_blocking(url, headless, max_detail, limiter, handle)
        })
        .await
    }

    fn source_name(&self) -> &'static str {
        "Homegate"
    }
}
