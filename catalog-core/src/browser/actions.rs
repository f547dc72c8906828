use std::time::Duration;

use tracing::{debug, info};

use super::locator::Locator;
use super::page::PortalPage;

/// Result of acting on the first visible candidate of a selector list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Performed { selector: String },
    NotFound,
}

impl ActionOutcome {
    pub fn performed(&self) -> bool {
        matches!(self, ActionOutcome::Performed { .. })
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            ActionOutcome::Performed { selector } => Some(selector),
            ActionOutcome::NotFound => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Action<'a> {
    Click,
    Fill(&'a str),
}

impl Action<'_> {
    fn label(&self) -> &'static str {
        match self {
            Action::Click => "click",
            Action::Fill(_) => "fill",
        }
    }
}

/// Clicks the first candidate that becomes visible within `probe`.
///
/// Candidates are tried in order. A probe or click error on one candidate only
/// moves on to the next; nothing is raised to the caller.
pub async fn click_first<P>(page: &mut P, candidates: &[Locator], probe: Duration) -> ActionOutcome
where
    P: PortalPage + ?Sized,
{
    act_first(page, candidates, probe, Action::Click).await
}

/// Fills the first visible candidate with `value`, same ordering rules as [`click_first`].
pub async fn fill_first<P>(
    page: &mut P,
    candidates: &[Locator],
    value: &str,
    probe: Duration,
) -> ActionOutcome
where
    P: PortalPage + ?Sized,
{
    act_first(page, candidates, probe, Action::Fill(value)).await
}

async fn act_first<P>(
    page: &mut P,
    candidates: &[Locator],
    probe: Duration,
    action: Action<'_>,
) -> ActionOutcome
where
    P: PortalPage + ?Sized,
{
    for locator in candidates {
        match page.is_visible(locator, probe).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(selector = %locator, action = action.label(), "candidate not visible");
                continue;
            }
            Err(err) => {
                debug!(selector = %locator, error = %err, "candidate probe failed");
                continue;
            }
        }

        let result = match action {
            Action::Click => page.click(locator).await,
            Action::Fill(value) => page.fill(locator, value).await,
        };
        match result {
            Ok(()) => {
                info!(selector = %locator, action = action.label(), "selector matched");
                return ActionOutcome::Performed {
                    selector: locator.as_str().to_string(),
                };
            }
            Err(err) => {
                debug!(
                    selector = %locator,
                    action = action.label(),
                    error = %err,
                    "candidate action failed"
                );
            }
        }
    }
    ActionOutcome::NotFound
}
