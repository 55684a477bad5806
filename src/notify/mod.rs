pub mod whatsapp;

pub use whatsapp::WhatsAppNotifier;

use async_trait::async_trait;

use crate::error::NotifyError;
use crate::models::{Listing, Scalar};

/// Delivers one message to one destination
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, message: &str, destination: &str) -> Result<(), NotifyError>;
}

const PLACEHOLDER: &str = "—";

fn or_placeholder(value: Option<&Scalar>) -> String {
    value
        .filter(|v| !v.is_blank())
        .map(Scalar::to_string)
        .unwrap_or_else(|| PLACEHOLDER.to_string())
}

/// Chat message announcing a new listing
pub fn format_message(listing: &Listing) -> String {
    let title = listing.title.as_deref().unwrap_or("Neues Inserat");
    let price = or_placeholder(listing.price.as_ref());
    let location = listing
        .location
        .as_deref()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or(PLACEHOLDER);
    let rooms = or_placeholder(listing.rooms.as_ref());

    format!(
        "{}\n\n💰 {}\n📍 {}\n🛏️ {} Zimmer\n🔗 {}",
        title, price, location, rooms, listing.url
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_all_fields() {
        let listing = Listing::new("https://flatfox.ch/de/wohnung/1/")
            .with_title("4.5 Zimmer-Wohnung, Zürich")
            .with_price("CHF 3'450.–")
            .with_location("Zürich")
            .with_rooms(4.5);

        assert_eq!(
            format_message(&listing),
            "4.5 Zimmer-Wohnung, Zürich\n\n💰 CHF 3'450.–\n📍 Zürich\n🛏️ 4.5 Zimmer\n🔗 https://flatfox.ch/de/wohnung/1/"
        );
    }

    #[test]
    fn missing_fields_become_dashes() {
        let listing = Listing::new("https://x/2").with_title("Studio").with_rooms("");

        assert_eq!(
            format_message(&listing),
            "Studio\n\n💰 —\n📍 —\n🛏️ — Zimmer\n🔗 https://x/2"
        );
    }
}
