use crate::control::RateLimiter;
use crate::error::SourceError;
use crate::models::{Listing, Scalar};
use crate::scrapers::traits::ListingSource;
use crate::scrapers::types::SearchParams;
use crate::scrapers::{client_builder, detect_block, element_text, fetch_page, selector};
use async_trait::async_trait;
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use scraper::Html;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

const BASE_URL: &str = "https://www.vermietungen.stadt-zuerich.ch";
const SITE_SUFFIX: &str = "vermietungen.stadt-zuerich.ch";

static FIRST_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)?").expect("number pattern is valid"));

/// Client-side room bounds; the site's own filter is not always applied
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoomFilter {
    pub exact: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl RoomFilter {
    pub fn from_params(params: &SearchParams) -> Self {
        Self {
            exact: params.f64("exact_rooms"),
            min: params.f64("min_rooms"),
            max: params.f64("max_rooms"),
        }
    }

    fn is_empty(&self) -> bool {
        self.exact.is_none() && self.min.is_none() && self.max.is_none()
    }

    /// `(min, max)` to send to the site
    fn bounds(&self) -> (Option<f64>, Option<f64>) {
        match self.exact {
            Some(exact) => (Some(exact), Some(exact)),
            None => (self.min, self.max),
        }
    }

    fn accepts(&self, rooms: Option<f64>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(rooms) = rooms else {
            return false;
        };
        if let Some(exact) = self.exact {
            if (rooms - exact).abs() > 1e-9 {
                return false;
            }
        }
        self.min.map_or(true, |min| rooms >= min) && self.max.map_or(true, |max| rooms <= max)
    }
}

/// First number in a cell, with apostrophe grouping removed and `.` decimals
fn first_number(text: &str) -> Option<String> {
    let cleaned: String = text.chars().filter(|c| !matches!(c, '\'' | '’')).collect();
    FIRST_NUMBER
        .find(&cleaned)
        .map(|m| m.as_str().replace(',', "."))
}

/// City of Zürich rental listings
pub struct StadtZuerichScraper {
    client: Client,
    jar: Arc<Jar>,
    limiter: Arc<RateLimiter>,
}

impl StadtZuerichScraper {
    pub fn new(limiter: Arc<RateLimiter>) -> Result<Self, SourceError> {
        let jar = Arc::new(Jar::default());
        let client = client_builder()
            .cookie_provider(Arc::clone(&jar))
            .build()?;
        Ok(Self {
            client,
            jar,
            limiter,
        })
    }

    fn list_url(params: &SearchParams) -> String {
        params
            .str("list_url")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/", BASE_URL))
    }

    fn csrf_token(&self, list_url: &str) -> Option<String> {
        let url = Url::parse(list_url).ok()?;
        let cookies = self.jar.cookies(&url)?;
        cookies
            .to_str()
            .ok()?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == "csrftoken")
            .map(|(_, value)| value.to_string())
    }

    /// Load the list page for its cookies, then ask the site to filter by
    /// rooms. Falls back to the unfiltered page if the POST gives nothing.
    async fn fetch_filtered(
        &self,
        list_url: &str,
        filter: &RoomFilter,
    ) -> Result<String, SourceError> {
        let unfiltered = fetch_page(&self.client, &self.limiter, list_url).await?;

        let rooms_value = match filter.bounds() {
            (Some(min), Some(max)) => format!("{},{}", min, max),
            (Some(bound), None) | (None, Some(bound)) => format!("{},{}", bound, bound),
            (None, None) => String::new(),
        };

        let mut request = self
            .client
            .post(list_url)
            .header("Referer", list_url)
            .header("Origin", BASE_URL)
            .header("X-Requested-With", "XMLHttpRequest")
            .form(&[("rooms", rooms_value.as_str()), ("search", "")]);
        if let Some(token) = self.csrf_token(list_url) {
            request = request.header("X-CSRFToken", token);
        }

        self.limiter.pace().await;
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Filter POST failed, using unfiltered page: {}", e);
                return Ok(unfiltered);
            }
        };

        let status = response.status();
        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.contains("text/html"));
        let body = response.text().await?;

        Self::pick_filtered(list_url, status, is_html, body, unfiltered)
    }

    /// Use the filter response when it is a usable page, otherwise the
    /// unfiltered one. A block on the POST is still a block.
    fn pick_filtered(
        list_url: &str,
        status: StatusCode,
        is_html: bool,
        body: String,
        unfiltered: String,
    ) -> Result<String, SourceError> {
        if let Some(reason) = detect_block(Some(status), &body) {
            return Err(SourceError::Blocked(format!("{} (filter): {}", list_url, reason)));
        }
        if status.is_success() && is_html && !body.trim().is_empty() {
            return Ok(body);
        }

        debug!("Filter POST gave no page ({}), using unfiltered page", status);
        Ok(unfiltered)
    }

    /// Parse the rows of the main listing table
    pub fn parse_rows(html: &str, filter: &RoomFilter) -> Result<Vec<Listing>, SourceError> {
        let document = Html::parse_document(html);
        let table_selector = selector("div.table-container.main-table table")?;
        let row_selector = selector("tbody tr")?;
        let address_selector = selector("td.publicated_adress")?;
        let rooms_selector = selector("td.rooms")?;
        let rent_selector = selector("td.rentalgross")?;
        let apply_selector = selector("td.apply_button a.apply_button")?;

        let Some(table) = document.select(&table_selector).next() else {
            return Err(SourceError::SoftMiss("listing table not found".into()));
        };

        let cell = |row: scraper::ElementRef<'_>, sel: &scraper::Selector| {
            row.select(sel).next().map(element_text).unwrap_or_default()
        };

        let mut listings = Vec::new();
        for row in table.select(&row_selector) {
            let address = cell(row, &address_selector);
            let rooms = first_number(&cell(row, &rooms_selector));
            let price = first_number(&cell(row, &rent_selector));

            let rooms_value = rooms.as_deref().and_then(|r| r.parse::<f64>().ok());
            if !filter.accepts(rooms_value) {
                continue;
            }

            // rows without an apply link have no identity of their own
            let url = row
                .select(&apply_selector)
                .next()
                .and_then(|a| a.value().attr("href"))
                .filter(|href| !href.trim().is_empty())
                .and_then(|href| Url::parse(BASE_URL).ok()?.join(href.trim()).ok())
                .map(String::from)
                .unwrap_or_default();

            let mut parts = Vec::new();
            if !address.is_empty() {
                parts.push(address);
            }
            if let Some(rooms) = &rooms {
                parts.push(format!("{} Zi.", rooms));
            }
            if let Some(price) = &price {
                parts.push(format!("CHF {}", price));
            }

            listings.push(Listing {
                title: Some(format!("{} | {}", parts.join(", "), SITE_SUFFIX)),
                price: price.map(|p| Scalar::Text(format!("CHF {}", p))),
                location: Some("Zürich".to_string()),
                url,
                rooms: rooms.map(Scalar::Text),
            });
        }

        Ok(listings)
    }
}

#[async_trait]
impl ListingSource for StadtZuerichScraper {
    async fn scrape(&self, params: &SearchParams) -> Result<Vec<Listing>, SourceError> {
        let filter = RoomFilter::from_params(params);
        let list_url = Self::list_url(params);
        info!("🔍 Navigating to: {}", list_url);

        let html = if filter.is_empty() {
            fetch_page(&self.client, &self.limiter, &list_url).await?
        } else {
            self.fetch_filtered(&list_url, &filter).await?
        };

        let listings = Self::parse_rows(&html, &filter)?;
        info!("Scraped {} listings from Stadt Zürich", listings.len());
        Ok(listings)
    }

    fn source_name(&self) -> &'static str {
        "Stadt Zürich"
    }
}
