//! Settings from the environment and search profiles from a JSON file.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::control::{RateLimiter, RetryPolicy};
use crate::error::ConfigError;
use crate::models::Profile;
use crate::notify::whatsapp::DEFAULT_ENDPOINT;
use crate::scrapers::{SearchParams, SourceOptions};

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub min_delay: Duration,
    pub jitter: Duration,
    pub max_detail: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub attempts: u32,
    pub backoff_base: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub profiles_path: PathBuf,
    pub profile_selector: Option<String>,
    pub whatsapp_url: String,
    pub notify_delay: Duration,
    pub notify_retry_delay: Duration,
    pub crawl: CrawlSettings,
    pub headless: bool,
    pub dry_run: bool,
    pub log_level: String,
}

impl Settings {
    /// Read settings from the process environment. Call `dotenvy::dotenv()`
    /// first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys take their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Settings {
            db_path: get("DEDUP_DB_PATH")
                .unwrap_or_else(|| "data/dedupe.sqlite3".to_string())
                .into(),
            profiles_path: get("PROFILES_PATH")
                .unwrap_or_else(|| "config/search_profiles.json".to_string())
                .into(),
            profile_selector: get("PROFILE_SELECTOR"),
            whatsapp_url: get("WHATSAPP_API_URL").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            notify_delay: seconds("WHATSAPP_SEND_DELAY_SEC", get("WHATSAPP_SEND_DELAY_SEC"), 10.0)?,
            notify_retry_delay: seconds(
                "NOTIFY_RETRY_DELAY_SEC",
                get("NOTIFY_RETRY_DELAY_SEC"),
                3.0,
            )?,
            crawl: CrawlSettings {
                min_delay: seconds("CRAWL_MIN_DELAY_SEC", get("CRAWL_MIN_DELAY_SEC"), 2.0)?,
                jitter: seconds("CRAWL_JITTER_SEC", get("CRAWL_JITTER_SEC"), 2.0)?,
                max_detail: parsed(
                    "CRAWL_MAX_DETAIL_PER_RUN",
                    get("CRAWL_MAX_DETAIL_PER_RUN"),
                    25,
                )?,
                backoff_min: seconds("CRAWL_BACKOFF_MIN", get("CRAWL_BACKOFF_MIN"), 10.0)?,
                backoff_max: seconds("CRAWL_BACKOFF_MAX", get("CRAWL_BACKOFF_MAX"), 300.0)?,
                attempts: parsed("SCRAPE_ATTEMPTS", get("SCRAPE_ATTEMPTS"), 3)?,
                backoff_base: seconds("SCRAPE_BACKOFF_SEC", get("SCRAPE_BACKOFF_SEC"), 2.0)?,
            },
            headless: flag("HEADLESS", get("HEADLESS"), true)?,
            dry_run: flag("DRY_RUN", get("DRY_RUN"), false)?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn crawl_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.crawl.min_delay, self.crawl.jitter)
    }

    pub fn notify_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.notify_delay, Duration::ZERO)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.crawl.attempts,
            backoff_base: self.crawl.backoff_base,
            jitter: Duration::from_millis(500),
            block_backoff_min: self.crawl.backoff_min,
            block_backoff_max: self.crawl.backoff_max.max(self.crawl.backoff_min),
        }
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            headless: self.headless,
            max_detail: self.crawl.max_detail,
        }
    }
}

fn parsed<T: FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidSetting { key, value }),
    }
}

fn seconds(
    key: &'static str,
    value: Option<String>,
    default: f64,
) -> Result<Duration, ConfigError> {
    let secs: f64 = parsed(key, value.clone(), default)?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidSetting {
        key,
        value: value.unwrap_or_default(),
    })
}

fn flag(key: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::to_lowercase).as_deref() {
        None => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(_) => Err(ConfigError::InvalidSetting {
            key,
            value: value.unwrap_or_default(),
        }),
    }
}

/// One profile entry as written in the profile file
#[derive(Debug, Deserialize)]
struct RawProfile {
    name: Option<String>,
    scraper: Option<String>,
    #[serde(alias = "destination")]
    jid: Option<String>,
    /// Environment variable holding the destination
    jid_env: Option<String>,
    #[serde(default)]
    params: SearchParams,
}

/// Profiles that passed validation, plus the entries that were skipped
#[derive(Debug, Default)]
pub struct ProfileSet {
    pub profiles: Vec<Profile>,
    pub rejected: Vec<ConfigError>,
}

impl ProfileSet {
    /// Keep only the profiles named in a comma-separated selector.
    /// Names that match nothing are ignored.
    pub fn select(mut self, selector: Option<&str>) -> Self {
        let Some(selector) = selector else {
            return self;
        };
        let wanted: HashSet<&str> = selector
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();
        if wanted.is_empty() {
            return self;
        }

        let before = self.profiles.len();
        self.profiles.retain(|p| wanted.contains(p.name.as_str()));
        info!(
            "Limiting to profiles {:?} ({} of {} total)",
            wanted,
            self.profiles.len(),
            before
        );
        self
    }
}

pub fn load_profiles(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ProfileSet, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_profiles(&content, lookup)
}

/// Parse a JSON array of profiles. Invalid entries are collected in
/// `rejected` instead of failing the whole file.
pub fn parse_profiles(
    json: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ProfileSet, ConfigError> {
    let entries: Vec<Value> = serde_json::from_str(json)?;
    let mut set = ProfileSet::default();
    let mut names = HashSet::new();

    for (index, entry) in entries.into_iter().enumerate() {
        match validate(index, entry, &lookup) {
            Ok(profile) if !names.insert(profile.name.clone()) => {
                set.rejected.push(ConfigError::DuplicateProfile(profile.name));
            }
            Ok(profile) => set.profiles.push(profile),
            Err(e) => set.rejected.push(e),
        }
    }

    for e in &set.rejected {
        warn!("❌ Skipping profile: {}", e);
    }
    debug!("Loaded {} profiles", set.profiles.len());
    Ok(set)
}

fn validate(
    index: usize,
    entry: Value,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Profile, ConfigError> {
    let raw: RawProfile = serde_json::from_value(entry)?;
    let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    let name = non_empty(raw.name).ok_or(ConfigError::MissingField { index, field: "name" })?;
    let source_key = non_empty(raw.scraper).ok_or(ConfigError::MissingField {
        index,
        field: "scraper",
    })?;
    let notify_target =
        non_empty(raw.jid).or_else(|| non_empty(raw.jid_env.as_deref().and_then(lookup)));

    Ok(Profile {
        name,
        source_key,
        params: raw.params,
        notify_target,
    })
}
