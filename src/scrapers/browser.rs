use anyhow::{Context, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::error::SourceError;

const SETTLE_TIME: Duration = Duration::from_secs(2);

const ACCEPT_COOKIES_JS: &str = r#"
    const button = document.querySelector(
        'button[id*="accept"], button[id*="onetrust-accept"], button[data-testid*="accept"]'
    ) || Array.from(document.querySelectorAll('button')).find(
        b => /^\s*(alle\s+)?(akzeptieren|accept)/i.test(b.textContent || '')
    );
    if (button) button.click();
"#;

/// Headless Chrome for sources that only render their data client-side
pub struct ChromeSession {
    browser: Browser,
}

impl ChromeSession {
    pub fn launch(headless: bool) -> Result<Self> {
        info!("Launching headless Chrome...");

        let options = LaunchOptions::default_builder()
            .headless(headless)
            .build()
            .context("Failed to build launch options")?;

        let browser = Browser::new(options).context("Failed to launch Chrome browser")?;

        Ok(Self { browser })
    }

    /// Open `url` in a new tab, accept cookies and let scripts settle
    pub fn open(&self, url: &str) -> Result<Arc<Tab>> {
        let tab = self.browser.new_tab()?;
        debug!("Opening {}", url);

        tab.navigate_to(url)?;
        tab.wait_until_navigated()?;

        let _ = tab.evaluate(ACCEPT_COOKIES_JS, false);
        thread::sleep(SETTLE_TIME);

        Ok(tab)
    }

    /// Evaluate a script that yields a string, `None` for any other value
    pub fn evaluate_string(tab: &Tab, script: &str) -> Result<Option<String>> {
        let result = tab.evaluate(script, false)?;
        Ok(result
            .value
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    pub fn html(tab: &Tab) -> Result<String> {
        Ok(Self::evaluate_string(tab, "document.documentElement.outerHTML")?.unwrap_or_default())
    }
}

/// headless_chrome reports through anyhow; keep the whole chain
pub(crate) fn browser_error(e: anyhow::Error) -> SourceError {
    SourceError::Browser(format!("{:#}", e))
}

/// Run a browser job on the blocking pool. The job gets a runtime handle so
/// it can still wait on async pacing.
pub(crate) async fn run_blocking<T, F>(job: F) -> Result<T, SourceError>
where
    T: Send + 'static,
    F: FnOnce(Handle) -> Result<T, SourceError> + Send + 'static,
{
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || job(handle))
        .await
        .map_err(|e| SourceError::Browser(format!("browser task failed: {}", e)))?
}
