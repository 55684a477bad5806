use crate::control::RateLimiter;
use crate::error::SourceError;
use crate::models::{Listing, Scalar};
use crate::scrapers::browser::{browser_error, run_blocking, ChromeSession};
use crate::scrapers::traits::ListingSource;
use crate::scrapers::types::SearchParams;
use crate::scrapers::{detect_block, element_text, selector};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use scraper::Html;
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info};

const BASE_URL: &str = "https://flatfox.ch";
const SEARCH_URL: &str = "https://flatfox.ch/de/search/";

/// How long the result list may take to render
const RENDER_TIMEOUT: Duration = Duration::from_secs(20);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Elements that can carry the "nothing found" notice
const NOTICE_CSS: &str = "h1, h2, h3, h4, p, [class*='empty'], [class*='no-result']";

const EMPTY_MARKERS: &[&str] = &[
    "keine inserate",
    "keine passenden",
    "keine ergebnisse",
    "keine treffer",
    "aucune annonce",
    "no listings",
    "no results",
];

static ROOMS_IN_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*Zimmer").expect("rooms pattern is valid"));

/// What a rendered search page shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Results,
    NoResults,
    /// Neither cards nor an empty notice, still rendering or changed markup
    Unknown,
}

/// Flatfox search results. The cards are rendered client-side, so the page
/// goes through headless Chrome.
pub struct FlatfoxScraper {
    limiter: Arc<RateLimiter>,
    headless: bool,
}

impl FlatfoxScraper {
    pub fn new(limiter: Arc<RateLimiter>, headless: bool) -> Self {
        Self { limiter, headless }
    }

    /// Search url for a profile, newest listings first
    pub fn search_url(params: &SearchParams) -> Result<Url, SourceError> {
        let mut pairs: Vec<(&str, String)> = vec![("categories", "rent".to_string())];

        for (name, key) in [("min_rooms", "min_rooms"), ("max_price", "max_price")] {
            if let Some(value) = params.query_value(key) {
                pairs.push((name, value));
            }
        }
        let temporary = params.bool("temporary").unwrap_or(false);
        pairs.push(("is_temporary", temporary.to_string()));
        pairs.push(("ordering", "-insertion".to_string()));

        if let Some(query) = params.str("query") {
            pairs.push(("place_name", format!("{}, Kanton Zürich, Schweiz", query)));
            pairs.push(("place_type", "place".to_string()));
            pairs.push(("query", query.to_string()));
        }
        if let Some(region) = params.query_value("region") {
            pairs.push(("regions", region));
        }
        if let Some(take) = params.query_value("take") {
            pairs.push(("take", take));
        }

        let bbox = params.f64_list("bbox");
        if let [north, east, south, west] = bbox.as_slice() {
            pairs.push(("north", north.to_string()));
            pairs.push(("east", east.to_string()));
            pairs.push(("south", south.to_string()));
            pairs.push(("west", west.to_string()));
        } else if !bbox.is_empty() {
            return Err(SourceError::InvalidParams(format!(
                "bbox needs 4 values (north, east, south, west), got {}",
                bbox.len()
            )));
        }

        let mut url = Url::parse_with_params(SEARCH_URL, &pairs)
            .map_err(|e| SourceError::InvalidParams(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            for category in params.str_list("object_categories") {
                query.append_pair("object_category", &category);
            }
        }
        Ok(url)
    }

    pub fn page_state(html: &str) -> Result<PageState, SourceError> {
        Self::state_of(&Html::parse_document(html))
    }

    fn state_of(document: &Html) -> Result<PageState, SourceError> {
        let card_selector = selector(".listing-thumb")?;
        if document.select(&card_selector).next().is_some() {
            return Ok(PageState::Results);
        }

        let notice_selector = selector(NOTICE_CSS)?;
        let empty = document.select(&notice_selector).any(|el| {
            let text = element_text(el).to_lowercase();
            EMPTY_MARKERS.iter().any(|marker| text.contains(marker))
        });
        Ok(if empty {
            PageState::NoResults
        } else {
            PageState::Unknown
        })
    }

    /// Extract listings from the `.listing-thumb` cards of a result page.
    /// An explicit "nothing found" page is an empty result; a page with
    /// neither cards nor that notice is a soft miss.
    pub fn parse_listings(html: &str) -> Result<Vec<Listing>, SourceError> {
        let document = Html::parse_document(html);
        match Self::state_of(&document)? {
            PageState::Results => {}
            PageState::NoResults => {
                info!("Flatfox reports no matching listings");
                return Ok(Vec::new());
            }
            PageState::Unknown => {
                return Err(SourceError::SoftMiss(
                    "neither .listing-thumb cards nor an empty-result notice".into(),
                ));
            }
        }

        let card_selector = selector(".listing-thumb")?;
        let title_selector = selector(".listing-thumb-title h2")?;
        let price_selector = selector(".price")?;
        let link_selector = selector("a")?;

        let cards: Vec<_> = document.select(&card_selector).collect();
        debug!("Found {} listing cards", cards.len());

        let mut listings = Vec::new();
        for card in cards {
            let title_el = card.select(&title_selector).next();
            let price_el = card.select(&price_selector).next();
            let link_el = card.select(&link_selector).next();

            let (Some(title_el), Some(price_el), Some(link_el)) = (title_el, price_el, link_el)
            else {
                debug!("Skipping incomplete card");
                continue;
            };

            let title = element_text(title_el);
            let price = element_text(price_el);
            let href = link_el.value().attr("href").unwrap_or("").trim();

            let url = if href.is_empty() {
                String::new()
            } else if href.starts_with("http") {
                href.to_string()
            } else {
                format!("{}{}", BASE_URL, href)
            };

            let rooms = ROOMS_IN_TITLE
                .captures(&title)
                .and_then(|caps| caps[1].replace(',', ".").parse::<f64>().ok())
                .map(Scalar::Number);

            // the last comma-separated part of a title is the place
            let location = title
                .rsplit_once(',')
                .map(|(_, place)| place.trim().to_string())
                .filter(|place| !place.is_empty());

            listings.push(Listing {
                title: Some(title),
                price: Some(Scalar::Text(price)),
                location,
                url,
                rooms,
            });
        }

        Ok(listings)
    }

    /// Runs on a blocking thread; polls the rendered page until cards or
    /// an empty notice show up, or the render timeout passes
    fn scrape_blocking(
        url: String,
        headless: bool,
        limiter: Arc<RateLimiter>,
        handle: Handle,
    ) -> Result<Vec<Listing>, SourceError> {
        let session = ChromeSession::launch(headless).map_err(browser_error)?;

        handle.block_on(limiter.pace());
        info!("🔍 Navigating to: {}", url);
        let tab = session.open(&url).map_err(browser_error)?;

        let deadline = Instant::now() + RENDER_TIMEOUT;
        loop {
            let html = ChromeSession::html(&tab).map_err(browser_error)?;
            if let Some(reason) = detect_block(None, &html) {
                return Err(SourceError::Blocked(format!("{}: {}", url, reason)));
            }

            let settled = Self::page_state(&html)? != PageState::Unknown;
            if settled || Instant::now() >= deadline {
                return Self::parse_listings(&html);
            }
            debug!("Waiting for Flatfox results to render");
            thread::sleep(POLL_INTERVAL);
        }
    }
}

#[async_trait]
impl ListingSource for FlatfoxScraper {
    async fn scrape(&self, params: &SearchParams) -> Result<Vec<Listing>, SourceError> {
        let url = Self::search_url(params)?.to_string();
        let headless = self.headless;
        let limiter = Arc::clone(&self.limiter);

        let listings =
            run_blocking(move |handle| Self::scrape_blocking(url, headless, limiter, handle))
                .await?;

        info!("Scraped {} listings from Flatfox", listings.len());
        Ok(listings)
    }

    fn source_name(&self) -> &'static str {
        "Flatfox"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RESULT_PAGE: &str = r#"
        <html><body>
          <div class="listing-thumb">
            <a href="/de/wohnung/8004-zuerich/1234567/">
              <div class="listing-thumb-title"><h2>4.5 Zimmer-Wohnung, Zürich</h2></div>
              <span class="price">CHF 3'450.–</span>
            </a>
          </div>
          <div class="listing-thumb">
            <a href="/de/wohnung/8050-zuerich/7654321/">
              <div class="listing-thumb-title"><h2>Studio mit Balkon</h2></div>
              <span class="price">CHF 1'650.–</span>
            </a>
          </div>
          <div class="listing-thumb">
            <div class="listing-thumb-title"><h2>No link here</h2></div>
          </div>
        </body></html>
    "#;

    #[test]
    fn parses_cards() {
        let listings = FlatfoxScraper::parse_listings(RESULT_PAGE).unwrap();
        assert_eq!(listings.len(), 2);

        let first = &listings[0];
        assert_eq!(first.title.as_deref(), Some("4.5 Zimmer-Wohnung, Zürich"));
        assert_eq!(first.url, "https://flatfox.ch/de/wohnung/8004-zuerich/1234567/");
        assert_eq!(first.rooms, Some(Scalar::Number(4.5)));
        assert_eq!(first.location.as_deref(), Some("Zürich"));
        assert_eq!(first.price, Some(Scalar::Text("CHF 3'450.–".into())));

        let second = &listings[1];
        assert_eq!(second.rooms, None);
        assert_eq!(second.location, None);
    }

    #[test]
    fn page_without_cards_or_notice_is_a_soft_miss() {
        let html = "<html><body><div id=\"app\">Loading…</div></body></html>";
        assert_eq!(FlatfoxScraper::page_state(html).unwrap(), PageState::Unknown);
        assert!(matches!(
            FlatfoxScraper::parse_listings(html),
            Err(SourceError::SoftMiss(_))
        ));
    }

    #[test]
    fn empty_search_is_an_empty_result() {
        let html = r#"
            <html><body>
              <div class="search-results">
                <div class="search-empty-state">
                  <h3>Leider keine Inserate gefunden</h3>
                  <p>Passe deine Suchkriterien an.</p>
                </div>
              </div>
            </body></html>
        "#;
        assert_eq!(FlatfoxScraper::page_state(html).unwrap(), PageState::NoResults);
        assert_eq!(FlatfoxScraper::parse_listings(html).unwrap(), Vec::new());
    }

    #[test]
    fn notice_text_inside_scripts_does_not_count() {
        let html = r#"<html><body>
            <script>window.i18n = {"empty": "Keine Inserate gefunden"};</script>
            <div id="app"></div>
        </body></html>"#;
        assert_eq!(FlatfoxScraper::page_state(html).unwrap(), PageState::Unknown);
    }

    #[test]
    fn search_url_carries_profile_params() {
        let params: SearchParams = serde_json::from_value(json!({
            "min_rooms": 4.5,
            "max_price": 3500,
            "bbox": [47.400271, 8.609897, 47.354793, 8.4406],
            "temporary": false,
            "object_categories": ["APARTMENT", "HOUSE"],
            "region": "zuerich",
            "query": "Zürich",
            "take": 48
        }))
        .unwrap();

        let url = FlatfoxScraper::search_url(&params).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let has = |k: &str, v: &str| pairs.iter().any(|(pk, pv)| pk == k && pv == v);

        assert!(url.as_str().starts_with(SEARCH_URL));
        assert!(has("min_rooms", "4.5"));
        assert!(has("max_price", "3500"));
        assert!(has("is_temporary", "false"));
        assert!(has("ordering", "-insertion"));
        assert!(has("place_name", "Zürich, Kanton Zürich, Schweiz"));
        assert!(has("north", "47.400271"));
        assert!(has("west", "8.4406"));
        assert!(has("object_category", "APARTMENT"));
        assert!(has("object_category", "HOUSE"));
    }

    #[test]
    fn malformed_bbox_is_invalid_params() {
        let params = SearchParams::new().with("bbox", json!([47.4, 8.6]));
        assert!(matches!(
            FlatfoxScraper::search_url(&params),
            Err(SourceError::InvalidParams(_))
        ));
    }
}
