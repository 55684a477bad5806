use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::control::RateLimiter;
use crate::error::{ConfigError, SourceError};
use crate::models::SourceKind;
use crate::scrapers::{FlatfoxScraper, HomegateScraper, ListingSource, StadtZuerichScraper};

/// Settings the concrete sources need at construction time
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub headless: bool,
    /// Detail pages a source may visit per run
    pub max_detail: usize,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            headless: true,
            max_detail: 25,
        }
    }
}

/// Sources available for a run, keyed by [`SourceKind`]
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<SourceKind, Arc<dyn ListingSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in source, all pacing through `limiter`
    pub fn standard(
        options: &SourceOptions,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, SourceError> {
        let registry = Self::new()
            .with(
                SourceKind::Flatfox,
                Arc::new(FlatfoxScraper::new(Arc::clone(&limiter), options.headless)),
            )
            .with(
                SourceKind::Homegate,
                Arc::new(HomegateScraper::new(
                    Arc::clone(&limiter),
                    options.headless,
                    options.max_detail,
                )),
            )
            .with(
                SourceKind::StadtZuerich,
                Arc::new(StadtZuerichScraper::new(limiter)?),
            );

        info!("Registered {} listing sources", registry.sources.len());
        Ok(registry)
    }

    pub fn with(mut self, kind: SourceKind, source: Arc<dyn ListingSource>) -> Self {
        self.sources.insert(kind, source);
        self
    }

    /// Look up the source for a profile's key
    pub fn resolve(&self, key: &str) -> Result<Arc<dyn ListingSource>, ConfigError> {
        let kind: SourceKind = key.parse()?;
        self.sources
            .get(&kind)
            .cloned()
            .ok_or_else(|| ConfigError::SourceUnavailable(kind.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Listing;
    use crate::scrapers::SearchParams;
    use async_trait::async_trait;

    struct Empty;

    #[async_trait]
    impl ListingSource for Empty {
        async fn scrape(&self, _params: &SearchParams) -> Result<Vec<Listing>, SourceError> {
            Ok(Vec::new())
        }

        fn source_name(&self) -> &'static str {
            "Empty"
        }
    }

    #[test]
    fn resolves_registered_kinds_only() {
        let registry = SourceRegistry::new().with(SourceKind::Flatfox, Arc::new(Empty));

        assert_eq!(registry.resolve("flatfox").unwrap().source_name(), "Empty");
        assert!(matches!(
            registry.resolve("homegate"),
            Err(ConfigError::SourceUnavailable(_))
        ));
        assert!(matches!(
            registry.resolve("immoscout"),
            Err(ConfigError::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn standard_registry_has_every_kind() {
        let registry =
            SourceRegistry::standard(&SourceOptions::default(), Arc::new(RateLimiter::unlimited()))
                .unwrap();
        for kind in SourceKind::ALL {
            assert!(registry.resolve(kind.key()).is_ok());
        }
    }
}
