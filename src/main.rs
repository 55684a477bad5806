use anyhow::Context;
use listing_scout::config::{load_profiles, Settings};
use listing_scout::notify::WhatsAppNotifier;
use listing_scout::scrapers::SourceRegistry;
use listing_scout::{ListingStore, Orchestrator};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env().context("invalid settings")?;

    // RUST_LOG wins; LOG_LEVEL is the simple knob
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🏠 Listing Scout");
    info!("================");
    if settings.dry_run {
        warn!("DRY_RUN is set: no notifications will be sent and nothing is stored");
    }

    let profiles = load_profiles(&settings.profiles_path, |key| std::env::var(key).ok())
        .with_context(|| format!("failed to load profiles from {:?}", settings.profiles_path))?
        .select(settings.profile_selector.as_deref());
    info!("📋 {} profiles to run", profiles.profiles.len());

    let store = ListingStore::open(&settings.db_path)
        .await
        .with_context(|| format!("failed to open dedupe store {:?}", settings.db_path))?;
    store.init().await.context("failed to create dedupe tables")?;
    info!("💾 Dedupe store ready at {:?}", settings.db_path);

    let crawl_limiter = Arc::new(settings.crawl_limiter());
    let sources = SourceRegistry::standard(&settings.source_options(), crawl_limiter)
        .context("failed to set up listing sources")?;
    let notifier = WhatsAppNotifier::new(settings.whatsapp_url.clone())
        .context("failed to set up WhatsApp client")?;
    info!("📤 Notifications go to {}", notifier.endpoint());

    let orchestrator = Orchestrator::new(sources, store, Arc::new(notifier))
        .with_retry(settings.retry_policy())
        .with_notify_limiter(Arc::new(settings.notify_limiter()))
        .with_notify_retry_delay(settings.notify_retry_delay)
        .with_dry_run(settings.dry_run);

    let report = orchestrator.run(&profiles.profiles).await;

    info!("");
    info!(
        "✅ Done: {} profiles completed, {} new listings, {} notifications sent",
        report.completed().count(),
        report.total_fresh(),
        report.total_notified()
    );
    for failure in report.failures() {
        error!("   {}", failure);
    }
    if !profiles.rejected.is_empty() {
        warn!("{} profile entries were invalid and skipped", profiles.rejected.len());
    }

    Ok(())
}
