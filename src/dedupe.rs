use std::collections::HashSet;

use crate::error::StoreError;
use crate::models::{Listing, Profile};
use crate::store::ListingStore;

/// New-listings delta of a scrape against what a profile has already seen.
/// Holds no state of its own, so asking twice gives the same answer until
/// the listings are marked seen. A URL repeated within one scrape is kept
/// only at its first position.
#[derive(Debug, Clone, Copy)]
pub struct DedupeEngine<'a> {
    store: &'a ListingStore,
}

impl<'a> DedupeEngine<'a> {
    pub fn new(store: &'a ListingStore) -> Self {
        Self { store }
    }

    pub async fn new_listings(
        &self,
        profile: &Profile,
        scraped: &[Listing],
    ) -> Result<Vec<Listing>, StoreError> {
        let unseen = self.store.filter_unseen(&profile.name, scraped).await?;

        let mut urls = HashSet::new();
        Ok(unseen
            .into_iter()
            .filter(|l| !l.has_identity() || urls.insert(l.url.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::types::SearchParams;

    fn profile(name: &str) -> Profile {
        Profile {
            name: name.to_string(),
            source_key: "flatfox".to_string(),
            params: SearchParams::new(),
            notify_target: None,
        }
    }

    #[tokio::test]
    async fn delta_is_scoped_to_profile_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = ListingStore::open(dir.path().join("d.sqlite3")).await.unwrap();
        store.init().await.unwrap();
        let engine = DedupeEngine::new(&store);

        let scraped = vec![Listing::new("a"), Listing::new("b")];
        store.mark_seen("zurich", &scraped[..1]).await.unwrap();

        let fresh = engine.new_listings(&profile("zurich"), &scraped).await.unwrap();
        assert_eq!(fresh, vec![Listing::new("b")]);
        assert_eq!(
            engine.new_listings(&profile("zurich"), &scraped).await.unwrap(),
            fresh
        );
        assert_eq!(
            engine.new_listings(&profile("winterthur"), &scraped).await.unwrap(),
            scraped
        );
    }

    #[tokio::test]
    async fn repeated_url_in_one_scrape_counts_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ListingStore::open(dir.path().join("d.sqlite3")).await.unwrap();
        store.init().await.unwrap();

        let scraped = vec![
            Listing::new("a").with_title("promoted"),
            Listing::new("b"),
            Listing::new("a").with_title("regular"),
            Listing::new(""),
            Listing::new(""),
        ];
        let fresh = DedupeEngine::new(&store)
            .new_listings(&profile("zurich"), &scraped)
            .await
            .unwrap();

        let urls: Vec<&str> = fresh.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(urls, vec!["a", "b", "", ""]);
        assert_eq!(fresh[0].title.as_deref(), Some("promoted"));
    }
}
