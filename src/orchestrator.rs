//! Per-profile pipeline: scrape, dedupe, notify, persist.
//!
//! Profiles run one after another. A failing profile is recorded in the
//! [`RunReport`] and the run moves on to the next one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::control::{RateLimiter, RetryPolicy};
use crate::dedupe::DedupeEngine;
use crate::error::{ProfileFailure, StoreError};
use crate::models::{Listing, Profile};
use crate::notify::{format_message, NotificationDispatcher};
use crate::scrapers::{ListingSource, SourceRegistry};
use crate::store::ListingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Scraping,
    Deduping,
    Notifying,
    Persisting,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Scraping => "scraping",
            Stage::Deduping => "deduping",
            Stage::Notifying => "notifying",
            Stage::Persisting => "persisting",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Counters for one completed profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileReport {
    pub profile: String,
    pub scraped: usize,
    pub scrape_attempts: u32,
    /// Every scrape attempt failed and the profile ran on an empty result
    pub scrape_exhausted: bool,
    pub fresh: usize,
    pub notified: usize,
    pub notify_failed: usize,
    pub skipped_without_url: usize,
    pub persisted: usize,
}

impl ProfileReport {
    fn new(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
            ..Self::default()
        }
    }
}

pub type ProfileOutcome = Result<ProfileReport, ProfileFailure>;

#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<ProfileOutcome>,
}

impl RunReport {
    pub fn completed(&self) -> impl Iterator<Item = &ProfileReport> {
        self.outcomes.iter().filter_map(|o| o.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProfileFailure> {
        self.outcomes.iter().filter_map(|o| o.as_ref().err())
    }

    pub fn total_notified(&self) -> usize {
        self.completed().map(|r| r.notified).sum()
    }

    pub fn total_fresh(&self) -> usize {
        self.completed().map(|r| r.fresh).sum()
    }
}

pub struct Orchestrator {
    sources: SourceRegistry,
    store: ListingStore,
    notifier: Arc<dyn NotificationDispatcher>,
    retry: RetryPolicy,
    notify_limiter: Arc<RateLimiter>,
    notify_retry_delay: Duration,
    dry_run: bool,
}

impl Orchestrator {
    pub fn new(
        sources: SourceRegistry,
        store: ListingStore,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            sources,
            store,
            notifier,
            retry: RetryPolicy::default(),
            notify_limiter: Arc::new(RateLimiter::new(Duration::from_secs(10), Duration::ZERO)),
            notify_retry_delay: Duration::from_secs(3),
            dry_run: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_notify_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.notify_limiter = limiter;
        self
    }

    pub fn with_notify_retry_delay(mut self, delay: Duration) -> Self {
        self.notify_retry_delay = delay;
        self
    }

    /// Scrape and dedupe only; nothing is sent or written
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run(&self, profiles: &[Profile]) -> RunReport {
        let mut report = RunReport::default();

        for profile in profiles {
            let span = info_span!("profile", name = %profile.name);
            let outcome = self.run_profile(profile).instrument(span).await;

            match &outcome {
                Ok(r) => info!(
                    "✅ {}: {} scraped, {} new, {} notified",
                    r.profile, r.scraped, r.fresh, r.notified
                ),
                Err(e) => error!("❌ {}", e),
            }
            report.outcomes.push(outcome);
        }

        report
    }

    pub async fn run_profile(&self, profile: &Profile) -> ProfileOutcome {
        let mut report = ProfileReport::new(&profile.name);

        debug!("Stage: {}", Stage::Scraping);
        let source = self
            .sources
            .resolve(&profile.source_key)
            .map_err(|source| ProfileFailure::Configuration {
                profile: profile.name.clone(),
                stage: Stage::Scraping,
                source,
            })?;
        let scraped = self.scrape(source.as_ref(), profile, &mut report).await;

        debug!("Stage: {}", Stage::Deduping);
        let fresh = DedupeEngine::new(&self.store)
            .new_listings(profile, &scraped)
            .await
            .map_err(persistence(profile, Stage::Deduping))?;
        report.fresh = fresh.len();

        if fresh.is_empty() {
            info!("No new listings for {}", profile.name);
            debug!("Stage: {}", Stage::Done);
            return Ok(report);
        }
        info!("🆕 {} new listings for {}", fresh.len(), profile.name);

        if self.dry_run {
            for listing in &fresh {
                info!("[dry run] {}", listing);
            }
            return Ok(report);
        }

        debug!("Stage: {}", Stage::Notifying);
        self.notify_all(profile, &fresh, &mut report).await;

        debug!("Stage: {}", Stage::Persisting);
        self.store
            .archive(&profile.name, &fresh)
            .await
            .map_err(persistence(profile, Stage::Persisting))?;
        report.persisted = self
            .store
            .mark_seen(&profile.name, &fresh)
            .await
            .map_err(persistence(profile, Stage::Persisting))?;

        debug!("Stage: {}", Stage::Done);
        Ok(report)
    }

    async fn scrape(
        &self,
        source: &dyn ListingSource,
        profile: &Profile,
        report: &mut ProfileReport,
    ) -> Vec<Listing> {
        info!("🔍 Scraping {} via {}", profile.name, source.source_name());
        let params = &profile.params;
        let label = format!("{}/{}", profile.name, source.source_name());

        let outcome = self.retry.run(&label, move |_| source.scrape(params)).await;
        report.scrape_attempts = outcome.attempts;
        report.scrape_exhausted = outcome.exhausted();
        if let Some(e) = &outcome.last_error {
            warn!("Continuing {} with no listings: {}", profile.name, e);
        }

        report.scraped = outcome.value.len();
        outcome.value
    }

    async fn notify_all(&self, profile: &Profile, fresh: &[Listing], report: &mut ProfileReport) {
        let Some(target) = profile.notify_target.as_deref() else {
            warn!(
                "No notify target for {}, {} listings will only be recorded",
                profile.name,
                fresh.len()
            );
            return;
        };

        for listing in fresh {
            if !listing.has_identity() {
                warn!(
                    "Not notifying listing without URL: {}",
                    listing.title.as_deref().unwrap_or("untitled")
                );
                report.skipped_without_url += 1;
                continue;
            }

            if self.deliver(&format_message(listing), target, &listing.url).await {
                report.notified += 1;
            } else {
                report.notify_failed += 1;
            }
        }
    }

    /// Send once, and once more after the retry delay
    async fn deliver(&self, message: &str, target: &str, url: &str) -> bool {
        self.notify_limiter.pace().await;
        let Err(first) = self.notifier.send(message, target).await else {
            return true;
        };
        warn!("Notification for {} failed, retrying: {}", url, first);

        sleep(self.notify_retry_delay).await;
        match self.notifier.send(message, target).await {
            Ok(()) => true,
            Err(e) => {
                error!("Giving up on notification for {}: {}", url, e);
                false
            }
        }
    }
}

fn persistence(profile: &Profile, stage: Stage) -> impl FnOnce(StoreError) -> ProfileFailure + '_ {
    move |source| ProfileFailure::Persistence {
        profile: profile.name.clone(),
        stage,
        source,
    }
}
