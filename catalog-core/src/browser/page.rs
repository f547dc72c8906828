use std::time::Duration;

use async_trait::async_trait;

use super::error::BrowserResult;
use super::locator::Locator;

/// Response of a fetch issued from inside the page, so the session cookies apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// The page operations the login and export flows drive.
///
/// Implemented by [`super::automation::BrowserContext`] over Chromium, and by
/// scripted fakes in tests.
#[async_trait(?Send)]
pub trait PortalPage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> BrowserResult<()>;

    /// Returns whether an element matching `locator` becomes visible within `timeout`.
    /// A lookup that simply finds nothing is `Ok(false)`.
    async fn is_visible(&mut self, locator: &Locator, timeout: Duration) -> BrowserResult<bool>;

    async fn click(&mut self, locator: &Locator) -> BrowserResult<()>;

    /// Replaces the value of the matched input with `value`.
    async fn fill(&mut self, locator: &Locator, value: &str) -> BrowserResult<()>;

    /// Presses Enter in the focused element.
    async fn press_enter(&mut self) -> BrowserResult<()>;

    /// Waits until the document is loaded and network activity has stopped.
    async fn wait_for_settle(&mut self, timeout: Duration) -> BrowserResult<()>;

    async fn current_url(&mut self) -> BrowserResult<String>;

    async fn fetch(&mut self, url: &str, timeout: Duration) -> BrowserResult<FetchResponse>;

    /// PNG screenshot of the full page.
    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>>;
}
