use std::fmt;

use serde::Serialize;

use crate::config::SelectorSection;

use super::locator::Locator;

/// The UI roles the portal login flow needs to locate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorRole {
    CookieAccept,
    Email,
    Password,
    Submit,
    LoggedIn,
}

impl SelectorRole {
    pub const ALL: [SelectorRole; 5] = [
        SelectorRole::CookieAccept,
        SelectorRole::Email,
        SelectorRole::Password,
        SelectorRole::Submit,
        SelectorRole::LoggedIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorRole::CookieAccept => "cookie-accept",
            SelectorRole::Email => "email",
            SelectorRole::Password => "password",
            SelectorRole::Submit => "submit",
            SelectorRole::LoggedIn => "logged-in",
        }
    }
}

impl fmt::Display for SelectorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const COOKIE_ACCEPT: &[&str] = &[
    "#onetrust-accept-btn-handler",
    "button#accept-cookies",
    "[data-testid=\"cookie-accept\"]",
    "button:has-text(\"Accept all\")",
    "button:has-text(\"Accept\")",
    "button:has-text(\"Agree\")",
    "text=Accept cookies",
];

const EMAIL: &[&str] = &[
    "input[type=\"email\"]",
    "input[name=\"email\"]",
    "input[name=\"username\"]",
    "input#email",
    "input#username",
    "input[autocomplete=\"username\"]",
];

const PASSWORD: &[&str] = &[
    "input[type=\"password\"]",
    "input[name=\"password\"]",
    "input#password",
    "input[autocomplete=\"current-password\"]",
];

const SUBMIT: &[&str] = &[
    "button[type=\"submit\"]",
    "input[type=\"submit\"]",
    "button:has-text(\"Log in\")",
    "button:has-text(\"Sign in\")",
    "button:has-text(\"Login\")",
];

const LOGGED_IN: &[&str] = &[
    "a[href*=\"logout\"]",
    "a[href*=\"sign-out\"]",
    "button:has-text(\"Log out\")",
    "[data-testid=\"account-menu\"]",
    ".account-menu",
    "text=My account",
];

/// Ordered candidate locators for each role. Order is priority: earlier entries win.
///
/// Built-in candidates cover common portal markup; a `[selectors]` table in the
/// config replaces the list for any role it names.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorCatalog {
    cookie_accept: Vec<Locator>,
    email: Vec<Locator>,
    password: Vec<Locator>,
    submit: Vec<Locator>,
    logged_in: Vec<Locator>,
}

impl Default for SelectorCatalog {
    fn default() -> Self {
        Self {
            cookie_accept: parse_all(COOKIE_ACCEPT.iter().copied()),
            email: parse_all(EMAIL.iter().copied()),
            password: parse_all(PASSWORD.iter().copied()),
            submit: parse_all(SUBMIT.iter().copied()),
            logged_in: parse_all(LOGGED_IN.iter().copied()),
        }
    }
}

impl SelectorCatalog {
    pub fn from_config(section: &SelectorSection) -> Self {
        let mut catalog = Self::default();
        let overrides = [
            (SelectorRole::CookieAccept, &section.cookie_accept),
            (SelectorRole::Email, &section.email),
            (SelectorRole::Password, &section.password),
            (SelectorRole::Submit, &section.submit),
            (SelectorRole::LoggedIn, &section.logged_in),
        ];
        for (role, candidates) in overrides {
            if let Some(candidates) = candidates {
                let parsed = parse_all(candidates.iter().map(String::as_str));
                if !parsed.is_empty() {
                    *catalog.slot_mut(role) = parsed;
                }
            }
        }
        catalog
    }

    pub fn get(&self, role: SelectorRole) -> &[Locator] {
        match role {
            SelectorRole::CookieAccept => &self.cookie_accept,
            SelectorRole::Email => &self.email,
            SelectorRole::Password => &self.password,
            SelectorRole::Submit => &self.submit,
            SelectorRole::LoggedIn => &self.logged_in,
        }
    }

    fn slot_mut(&mut self, role: SelectorRole) -> &mut Vec<Locator> {
        match role {
            SelectorRole::CookieAccept => &mut self.cookie_accept,
            SelectorRole::Email => &mut self.email,
            SelectorRole::Password => &mut self.password,
            SelectorRole::Submit => &mut self.submit,
            SelectorRole::LoggedIn => &mut self.logged_in,
        }
    }
}

fn parse_all<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<Locator> {
    raw.map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(Locator::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_role_has_defaults() {
        let catalog = SelectorCatalog::default();
        for role in SelectorRole::ALL {
            assert!(!catalog.get(role).is_empty(), "{role} has no candidates");
        }
        assert_eq!(
            catalog.get(SelectorRole::Password)[0].as_str(),
            "input[type=\"password\"]"
        );
    }

    #[test]
    fn overrides_replace_only_named_roles() {
        let section = SelectorSection {
            email: Some(vec!["#login-email".into(), "  ".into()]),
            submit: Some(vec![]),
            ..SelectorSection::default()
        };
        let catalog = SelectorCatalog::from_config(&section);
        let email: Vec<_> = catalog
            .get(SelectorRole::Email)
            .iter()
            .map(Locator::as_str)
            .collect();
        assert_eq!(email, vec!["#login-email"]);
        assert_eq!(
            catalog.get(SelectorRole::Submit),
            SelectorCatalog::default().get(SelectorRole::Submit)
        );
        assert_eq!(
            catalog.get(SelectorRole::Password),
            SelectorCatalog::default().get(SelectorRole::Password)
        );
    }
}
