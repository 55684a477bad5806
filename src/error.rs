//! Typed errors for each failure class of a run.
//!
//! Source and notification failures are recoverable and handled close to
//! where they happen; store failures end the current profile; configuration
//! failures skip a profile (or, for the settings themselves, the process).

use std::path::PathBuf;
use thiserror::Error;

use crate::orchestrator::Stage;

/// A scrape attempt that produced no usable result
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("browser error: {0}")]
    Browser(String),

    /// The profile's params can't produce a request; retrying won't help
    #[error("invalid search params: {0}")]
    InvalidParams(String),

    #[error("unexpected page content: {0}")]
    Parse(String),

    /// Completed without raising but found nothing where results were expected
    #[error("no usable results: {0}")]
    SoftMiss(String),

    /// The site answered with a challenge or denial page
    #[error("blocked: {0}")]
    Blocked(String),
}

impl SourceError {
    pub fn is_blocked(&self) -> bool {
        matches!(self, SourceError::Blocked(_))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::InvalidParams(_))
    }
}

/// Delivery of one message failed
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gateway rejected message with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid timestamp {value:?} in {column}")]
    Timestamp { column: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no scraper found for key: {0}")]
    UnknownSource(String),

    #[error("scraper {0} is not registered for this run")]
    SourceUnavailable(String),

    #[error("profile #{index} is missing required field {field}")]
    MissingField { index: usize, field: &'static str },

    #[error("profile {0} is defined more than once")]
    DuplicateProfile(String),

    #[error("invalid value {value:?} for {key}")]
    InvalidSetting { key: &'static str, value: String },

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid profile file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Why one profile's pipeline stopped early
#[derive(Debug, Error)]
pub enum ProfileFailure {
    #[error("profile {profile} skipped while {stage}: {source}")]
    Configuration {
        profile: String,
        stage: Stage,
        #[source]
        source: ConfigError,
    },

    #[error("profile {profile} aborted while {stage}: {source}")]
    Persistence {
        profile: String,
        stage: Stage,
        #[source]
        source: StoreError,
    },
}

impl ProfileFailure {
    pub fn profile(&self) -> &str {
        match self {
            ProfileFailure::Configuration { profile, .. }
            | ProfileFailure::Persistence { profile, .. } => profile,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            ProfileFailure::Configuration { stage, .. }
            | ProfileFailure::Persistence { stage, .. } => *stage,
        }
    }
}
