use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, CredentialsSection, SiteSection, TimeoutsSection};

use super::actions::{click_first, fill_first};
use super::diagnostics::DiagnosticsRecorder;
use super::error::{BrowserError, BrowserResult};
use super::metrics::SessionMetrics;
use super::page::PortalPage;
use super::selectors::{SelectorCatalog, SelectorRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    NotStarted,
    Navigated,
    ConsentHandled,
    CredentialsEntered,
    Submitted,
    VerificationPending,
    LoggedIn,
    LoginFailed,
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoginState::NotStarted => "not_started",
            LoginState::Navigated => "navigated",
            LoginState::ConsentHandled => "consent_handled",
            LoginState::CredentialsEntered => "credentials_entered",
            LoginState::Submitted => "submitted",
            LoginState::VerificationPending => "verification_pending",
            LoginState::LoggedIn => "logged_in",
            LoginState::LoginFailed => "login_failed",
        };
        f.write_str(label)
    }
}

/// The two independent login signals. Login is accepted when either fires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationSignals {
    pub url: String,
    pub url_matched: bool,
    /// Account indicator selector that was visible, if any.
    pub indicator: Option<String>,
}

impl VerificationSignals {
    pub fn logged_in(&self) -> bool {
        self.url_matched || self.indicator.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginReport {
    pub consent_dismissed: bool,
    pub submitted_with: Option<String>,
    pub signals: VerificationSignals,
    pub transitions: Vec<LoginState>,
}

/// URL half of login verification: we left the login page and landed on an
/// account area or the bare site root.
pub fn url_signals_login(url: &str, site: &SiteSection) -> bool {
    if url.contains(site.login_path_segment.as_str()) {
        return false;
    }
    let account_area = site
        .account_path_segments
        .iter()
        .filter(|segment| !segment.is_empty())
        .any(|segment| url.contains(segment.as_str()));
    account_area || url.trim_end_matches('/') == site.base_url.trim_end_matches('/')
}

/// Drives the portal login form from a blank page to a verified session.
#[derive(Debug, Clone)]
pub struct LoginFlow<'a> {
    site: &'a SiteSection,
    credentials: &'a CredentialsSection,
    timeouts: &'a TimeoutsSection,
    selectors: &'a SelectorCatalog,
    diagnostics: &'a DiagnosticsRecorder,
    metrics: Option<Arc<Mutex<SessionMetrics>>>,
}

#[derive(Debug, Default)]
struct Progress {
    consent_dismissed: bool,
    submitted_with: Option<String>,
    signals: Option<VerificationSignals>,
    transitions: Vec<LoginState>,
}

impl<'a> LoginFlow<'a> {
    pub fn new(
        config: &'a AgentConfig,
        selectors: &'a SelectorCatalog,
        diagnostics: &'a DiagnosticsRecorder,
    ) -> Self {
        Self {
            site: &config.site,
            credentials: &config.credentials,
            timeouts: &config.timeouts,
            selectors,
            diagnostics,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Mutex<SessionMetrics>>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run<P>(&self, page: &mut P) -> BrowserResult<LoginReport>
    where
        P: PortalPage + ?Sized,
    {
        let result = self.drive(page).await;
        self.record(|metrics| metrics.record_login(result.is_ok()));
        match result {
            Ok(report) => {
                info!(
                    url = %report.signals.url,
                    url_matched = report.signals.url_matched,
                    indicator = report.signals.indicator.as_deref().unwrap_or("-"),
                    "login verified"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, "login failed");
                self.diagnostics.capture(page, &err).await;
                Err(err)
            }
        }
    }

    async fn drive<P>(&self, page: &mut P) -> BrowserResult<LoginReport>
    where
        P: PortalPage + ?Sized,
    {
        let mut progress = Progress::default();
        let mut state = LoginState::NotStarted;
        loop {
            progress.transitions.push(state);
            let next = match state {
                LoginState::NotStarted => {
                    page.goto(&self.site.login_url, self.timeouts.navigation())
                        .await?;
                    LoginState::Navigated
                }
                LoginState::Navigated => {
                    let outcome = click_first(
                        page,
                        self.selectors.get(SelectorRole::CookieAccept),
                        self.timeouts.visibility_probe(),
                    )
                    .await;
                    if outcome.performed() {
                        progress.consent_dismissed = true;
                        sleep(self.timeouts.consent_settle()).await;
                    } else {
                        debug!("no cookie banner found");
                    }
                    LoginState::ConsentHandled
                }
                LoginState::ConsentHandled => {
                    self.fill_required(page, SelectorRole::Email, &self.credentials.username)
                        .await?;
                    self.fill_required(page, SelectorRole::Password, &self.credentials.password)
                        .await?;
                    LoginState::CredentialsEntered
                }
                LoginState::CredentialsEntered => {
                    let outcome = click_first(
                        page,
                        self.selectors.get(SelectorRole::Submit),
                        self.timeouts.visibility_probe(),
                    )
                    .await;
                    if let Some(selector) = outcome.selector() {
                        progress.submitted_with = Some(selector.to_string());
                    } else {
                        debug!("no submit control found, pressing Enter");
                        if let Err(err) = page.press_enter().await {
                            warn!(error = %err, "Enter fallback failed");
                        }
                        progress.submitted_with = Some("enter".to_string());
                    }
                    LoginState::Submitted
                }
                LoginState::Submitted => {
                    if let Err(err) = page.wait_for_settle(self.timeouts.settle()).await {
                        warn!(error = %err, "page did not settle after submit");
                    }
                    LoginState::VerificationPending
                }
                LoginState::VerificationPending => {
                    let signals = self.verify(page).await;
                    let next = if signals.logged_in() {
                        LoginState::LoggedIn
                    } else {
                        LoginState::LoginFailed
                    };
                    progress.signals = Some(signals);
                    next
                }
                LoginState::LoggedIn => {
                    return Ok(LoginReport {
                        consent_dismissed: progress.consent_dismissed,
                        submitted_with: progress.submitted_with,
                        signals: progress.signals.unwrap_or_default(),
                        transitions: progress.transitions,
                    });
                }
                LoginState::LoginFailed => {
                    let url = progress
                        .signals
                        .map(|signals| signals.url)
                        .unwrap_or_default();
                    return Err(BrowserError::LoginFailed { url });
                }
            };
            debug!(from = %state, to = %next, "login transition");
            state = next;
        }
    }

    async fn fill_required<P>(
        &self,
        page: &mut P,
        role: SelectorRole,
        value: &str,
    ) -> BrowserResult<()>
    where
        P: PortalPage + ?Sized,
    {
        let outcome = fill_first(
            page,
            self.selectors.get(role),
            value,
            self.timeouts.visibility_probe(),
        )
        .await;
        if outcome.performed() {
            Ok(())
        } else {
            Err(BrowserError::MissingField(role))
        }
    }

    async fn verify<P>(&self, page: &mut P) -> VerificationSignals
    where
        P: PortalPage + ?Sized,
    {
        let url = match page.current_url().await {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "cannot read current url");
                String::new()
            }
        };
        let url_matched = !url.is_empty() && url_signals_login(&url, self.site);
        let mut indicator = None;
        if !url_matched {
            for locator in self.selectors.get(SelectorRole::LoggedIn) {
                match page
                    .is_visible(locator, self.timeouts.visibility_probe())
                    .await
                {
                    Ok(true) => {
                        indicator = Some(locator.as_str().to_string());
                        break;
                    }
                    Ok(false) => {}
                    Err(err) => debug!(selector = %locator, error = %err, "indicator probe failed"),
                }
            }
        }
        VerificationSignals {
            url,
            url_matched,
            indicator,
        }
    }

    fn record<F>(&self, f: F)
    where
        F: FnOnce(&mut SessionMetrics),
    {
        if let Some(metrics) = &self.metrics {
            if let Ok(mut guard) = metrics.lock() {
                f(&mut guard);
            }
        }
    }
}
