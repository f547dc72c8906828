use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    pub site: SiteSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub chromium: ChromiumSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub retry: RetrySections,
    #[serde(default)]
    pub diagnostics: DiagnosticsSection,
    #[serde(default)]
    pub selectors: SelectorSection,
    pub delivery: DeliverySection,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("site.base_url", &self.site.base_url),
            ("site.login_url", &self.site.login_url),
            ("site.export_url", &self.site.export_url),
        ] {
            url::Url::parse(value)
                .map_err(|err| ConfigError::invalid(field, format!("{value}: {err}")))?;
        }
        if self.site.login_path_segment.is_empty() {
            return Err(ConfigError::invalid(
                "site.login_path_segment",
                "must not be empty",
            ));
        }
        self.retry.login.validate("retry.login")?;
        self.retry.download.validate("retry.download")?;
        if self.timeouts.visibility_probe_ms == 0 {
            return Err(ConfigError::invalid(
                "timeouts.visibility_probe_ms",
                "must be greater than zero",
            ));
        }
        self.delivery.validate()
    }

    /// Fails when the credential pair is incomplete. Checked before a fetch, not at load time,
    /// because credentials are usually injected from the environment after parsing.
    pub fn require_credentials(&self) -> Result<()> {
        if self.credentials.username.trim().is_empty() {
            return Err(ConfigError::invalid("credentials.username", "missing"));
        }
        if self.credentials.password.is_empty() {
            return Err(ConfigError::invalid("credentials.password", "missing"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteSection {
    pub base_url: String,
    pub login_url: String,
    pub export_url: String,
    #[serde(default = "default_login_segment")]
    pub login_path_segment: String,
    #[serde(default = "default_account_segments")]
    pub account_path_segments: Vec<String>,
}

fn default_login_segment() -> String {
    "/login".to_string()
}

fn default_account_segments() -> Vec<String> {
    vec![
        "/account".to_string(),
        "/dashboard".to_string(),
        "/my-account".to_string(),
    ]
}

#[derive(Clone, Default, Deserialize)]
pub struct CredentialsSection {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl CredentialsSection {
    pub fn with_overrides(mut self, username: Option<String>, password: Option<String>) -> Self {
        if let Some(username) = username.filter(|value| !value.trim().is_empty()) {
            self.username = username;
        }
        if let Some(password) = password.filter(|value| !value.is_empty()) {
            self.password = password;
        }
        self
    }
}

impl fmt::Debug for CredentialsSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsSection")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub user_agents: Vec<String>,
    pub viewport: [u32; 2],
    pub lang: Option<String>,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: false,
            disable_gpu: true,
            user_agents: Vec::new(),
            viewport: [1366, 768],
            lang: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub visibility_probe_ms: u64,
    pub navigation_ms: u64,
    pub settle_ms: u64,
    pub export_fetch_ms: u64,
    pub consent_settle_ms: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            visibility_probe_ms: 1_000,
            navigation_ms: 30_000,
            settle_ms: 30_000,
            export_fetch_ms: 60_000,
            consent_settle_ms: 500,
        }
    }
}

impl TimeoutsSection {
    pub fn visibility_probe(&self) -> Duration {
        Duration::from_millis(self.visibility_probe_ms)
    }

    pub fn navigation(&self) -> Duration {
        Duration::from_millis(self.navigation_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn export_fetch(&self) -> Duration {
        Duration::from_millis(self.export_fetch_ms)
    }

    pub fn consent_settle(&self) -> Duration {
        Duration::from_millis(self.consent_settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetrySection {
    fn validate(&self, field: &str) -> Result<()> {
        if self.retries > 10 {
            return Err(ConfigError::invalid(
                format!("{field}.retries"),
                "must be at most 10",
            ));
        }
        if self.retries > 0 && self.base_delay_ms == 0 {
            return Err(ConfigError::invalid(
                format!("{field}.base_delay_ms"),
                "must be greater than zero when retries are enabled",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::invalid(
                format!("{field}.max_delay_ms"),
                "must not be smaller than base_delay_ms",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySections {
    pub login: RetrySection,
    pub download: RetrySection,
}

impl Default for RetrySections {
    fn default() -> Self {
        Self {
            login: RetrySection {
                retries: 2,
                base_delay_ms: 2_000,
                max_delay_ms: 10_000,
            },
            download: RetrySection {
                retries: 2,
                base_delay_ms: 3_000,
                max_delay_ms: 15_000,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSection {
    pub verbose: bool,
    pub screenshot_dir: PathBuf,
    pub failure_log: PathBuf,
    pub ledger_db: PathBuf,
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self {
            verbose: false,
            screenshot_dir: PathBuf::from("data/diagnostics"),
            failure_log: PathBuf::from("data/logs/failures.log"),
            ledger_db: PathBuf::from("data/ledger.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectorSection {
    pub cookie_accept: Option<Vec<String>>,
    pub email: Option<Vec<String>>,
    pub password: Option<Vec<String>>,
    pub submit: Option<Vec<String>>,
    pub logged_in: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryTarget {
    Local,
    Http,
    Object,
}

impl fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeliveryTarget::Local => "local",
            DeliveryTarget::Http => "http",
            DeliveryTarget::Object => "object",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    pub target: DeliveryTarget,
    #[serde(default = "default_keep_history")]
    pub keep_history: usize,
    pub local: Option<LocalDeliverySection>,
    pub http: Option<HttpDeliverySection>,
    pub object: Option<ObjectDeliverySection>,
}

fn default_keep_history() -> usize {
    7
}

impl DeliverySection {
    fn validate(&self) -> Result<()> {
        if self.keep_history == 0 {
            return Err(ConfigError::invalid(
                "delivery.keep_history",
                "must keep at least the copy written by the current run",
            ));
        }
        match self.target {
            DeliveryTarget::Local if self.local.is_none() => Err(ConfigError::invalid(
                "delivery.local",
                "section required for target = local",
            )),
            DeliveryTarget::Http => {
                let http = self.http.as_ref().ok_or_else(|| {
                    ConfigError::invalid("delivery.http", "section required for target = http")
                })?;
                url::Url::parse(&http.upload_url).map_err(|err| {
                    ConfigError::invalid("delivery.http.upload_url", err.to_string())
                })?;
                Ok(())
            }
            DeliveryTarget::Object => {
                let object = self.object.as_ref().ok_or_else(|| {
                    ConfigError::invalid(
                        "delivery.object",
                        "section required for target = object",
                    )
                })?;
                if !object.remote.contains(':') {
                    return Err(ConfigError::invalid(
                        "delivery.object.remote",
                        "expected an rclone remote such as `s3:bucket`",
                    ));
                }
                Ok(())
            }
            DeliveryTarget::Local => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalDeliverySection {
    pub dir: PathBuf,
    #[serde(default = "default_canonical_name")]
    pub canonical_name: String,
}

#[derive(Clone, Deserialize)]
pub struct HttpDeliverySection {
    pub upload_url: String,
    #[serde(default = "default_field_name")]
    pub field_name: String,
    #[serde(default = "default_canonical_name")]
    pub file_name: String,
    /// Name of the environment variable holding the bearer token; resolved by the caller.
    pub token_env: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_upload_timeout")]
    pub timeout_seconds: u64,
}

impl fmt::Debug for HttpDeliverySection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDeliverySection")
            .field("upload_url", &self.upload_url)
            .field("field_name", &self.field_name)
            .field("file_name", &self.file_name)
            .field("token_env", &self.token_env)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

fn default_field_name() -> String {
    "file".to_string()
}

fn default_upload_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectDeliverySection {
    #[serde(default = "default_rclone")]
    pub rclone_path: PathBuf,
    pub remote: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_canonical_name")]
    pub canonical_name: String,
}

fn default_rclone() -> PathBuf {
    PathBuf::from("rclone")
}

fn default_canonical_name() -> String {
    "catalog.csv".to_string()
}

pub fn load_agent_config<P: AsRef<Path>>(path: P) -> Result<AgentConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[site]
base_url = "https://portal.example.com/"
login_url = "https://portal.example.com/login"
export_url = "https://portal.example.com/export/products.csv"

[delivery]
target = "local"

[delivery.local]
dir = "out"
"#;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/catalog.toml");
        let config = load_agent_config(path).expect("fixture config should parse");
        config.validate().expect("fixture config should validate");
        assert_eq!(config.delivery.target, DeliveryTarget::Local);
        assert!(config.chromium.user_agents.len() >= 2);
        assert_eq!(config.site.login_path_segment, "/login");
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config: AgentConfig = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.timeouts.visibility_probe_ms, 1_000);
        assert_eq!(config.timeouts.export_fetch_ms, 60_000);
        assert_eq!(config.retry.login.retries, 2);
        assert_eq!(config.delivery.keep_history, 7);
        assert_eq!(
            config.delivery.local.as_ref().unwrap().canonical_name,
            "catalog.csv"
        );
        assert!(config.selectors.email.is_none());
    }

    #[test]
    fn validate_rejects_bad_urls_and_missing_sections() {
        let mut config: AgentConfig = toml::from_str(MINIMAL).unwrap();
        config.site.export_url = "not a url".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "site.export_url"
        ));

        let mut config: AgentConfig = toml::from_str(MINIMAL).unwrap();
        config.delivery.target = DeliveryTarget::Object;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_history_retention() {
        let mut config: AgentConfig = toml::from_str(MINIMAL).unwrap();
        config.delivery.keep_history = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "delivery.keep_history"
        ));

        config.delivery.keep_history = 1;
        config.validate().unwrap();
    }

    #[test]
    fn credentials_are_overridden_and_redacted() {
        let mut config: AgentConfig = toml::from_str(MINIMAL).unwrap();
        assert!(config.require_credentials().is_err());
        config.credentials = config
            .credentials
            .clone()
            .with_overrides(Some("buyer@example.com".into()), Some("s3cret".into()));
        config.require_credentials().unwrap();
        let rendered = format!("{:?}", config.credentials);
        assert!(rendered.contains("buyer@example.com"));
        assert!(!rendered.contains("s3cret"));
    }
}
