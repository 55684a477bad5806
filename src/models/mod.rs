use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::scrapers::types::SearchParams;

/// Site a listing was scraped from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Flatfox,
    Homegate,
    StadtZuerich,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::Flatfox,
        SourceKind::Homegate,
        SourceKind::StadtZuerich,
    ];

    /// Key used in profile files
    pub fn key(&self) -> &'static str {
        match self {
            SourceKind::Flatfox => "flatfox",
            SourceKind::Homegate => "homegate",
            SourceKind::StadtZuerich => "vermietungen-stadt-zuerich",
        }
    }
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.key() == key)
            .ok_or_else(|| ConfigError::UnknownSource(key.to_string()))
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A field that sites deliver either as text ("CHF 3'500.–") or as a number
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    pub fn is_blank(&self) -> bool {
        match self {
            Scalar::Number(_) => false,
            Scalar::Text(text) => text.trim().is_empty(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Text(text) => f.write_str(text),
        }
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}

impl From<&str> for Scalar {
    fn from(text: &str) -> Self {
        Scalar::Text(text.to_string())
    }
}

impl From<String> for Scalar {
    fn from(text: String) -> Self {
        Scalar::Text(text)
    }
}

/// A listing as produced by a source. The url is its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub title: Option<String>,
    pub price: Option<Scalar>,
    pub location: Option<String>,
    #[serde(default)]
    pub url: String,
    pub rooms: Option<Scalar>,
}

impl Listing {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            title: None,
            price: None,
            location: None,
            url: url.into(),
            rooms: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_price(mut self, price: impl Into<Scalar>) -> Self {
        self.price = Some(price.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_rooms(mut self, rooms: impl Into<Scalar>) -> Self {
        self.rooms = Some(rooms.into());
        self
    }

    /// Listings without a url can't be deduplicated or persisted
    pub fn has_identity(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![format!("🏠 {}", self.title.as_deref().unwrap_or("(untitled)"))];

        if let Some(rooms) = self.rooms.as_ref().filter(|r| !r.is_blank()) {
            parts.push(format!("{} Zi", rooms));
        }
        if let Some(price) = self.price.as_ref().filter(|p| !p.is_blank()) {
            parts.push(price.to_string());
        }
        if let Some(location) = self.location.as_deref().filter(|l| !l.is_empty()) {
            parts.push(location.to_string());
        }

        write!(f, "{}\n🔗 {}", parts.join(" | "), self.url)
    }
}

/// Named scrape configuration; its name partitions the dedupe state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub source_key: String,
    pub params: SearchParams,
    pub notify_target: Option<String>,
}

/// Seen-tracking row for one (profile, url)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub profile_name: String,
    pub url: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Denormalized archive row, latest observation wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedListing {
    pub profile_name: String,
    pub url: String,
    pub title: Option<String>,
    pub price_amount: Option<f64>,
    pub price_currency: Option<String>,
    pub location: Option<String>,
    pub rooms: Option<f64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_parses_profile_keys() {
        assert_eq!("flatfox".parse::<SourceKind>().unwrap(), SourceKind::Flatfox);
        assert_eq!(
            " vermietungen-stadt-zuerich ".parse::<SourceKind>().unwrap(),
            SourceKind::StadtZuerich
        );
        assert!(matches!(
            "immoscout".parse::<SourceKind>(),
            Err(ConfigError::UnknownSource(key)) if key == "immoscout"
        ));
    }

    #[test]
    fn listing_deserializes_mixed_price_and_rooms() {
        let listing: Listing = serde_json::from_str(
            r#"{"title":"Altbau","price":"CHF 2'950.–","location":"Zürich","url":"https://x/1","rooms":3.5}"#,
        )
        .unwrap();

        assert_eq!(listing.price, Some(Scalar::Text("CHF 2'950.–".into())));
        assert_eq!(listing.rooms, Some(Scalar::Number(3.5)));
        assert!(listing.has_identity());
    }

    #[test]
    fn display_skips_blank_fields() {
        let listing = Listing::new("https://flatfox.ch/de/flat/1/")
            .with_title("Helle Wohnung")
            .with_rooms("")
            .with_price("CHF 3500");

        assert_eq!(
            listing.to_string(),
            "🏠 Helle Wohnung | CHF 3500\n🔗 https://flatfox.ch/de/flat/1/"
        );
    }
}
