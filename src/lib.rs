pub mod config;
pub mod control;
pub mod dedupe;
pub mod error;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod scrapers;
pub mod store;

pub use config::{ProfileSet, Settings};
pub use dedupe::DedupeEngine;
pub use error::{ConfigError, NotifyError, ProfileFailure, SourceError, StoreError};
pub use models::{Listing, Profile, Scalar, SourceKind};
pub use orchestrator::{Orchestrator, ProfileReport, RunReport, Stage};
pub use store::ListingStore;
