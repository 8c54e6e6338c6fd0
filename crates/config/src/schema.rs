/// Config schema types for the gskills CLI.
use std::{fmt, str::FromStr};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::{
    error::{Error, Result},
    validate,
};

pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
pub const DEFAULT_LINK_DIR: &str = ".opencode/skills";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GskillsConfig {
    /// Token used for GitHub API requests. Optional for public repositories.
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub github_token: Option<Secret<String>>,
    /// HTTP(S) proxy URL for all remote requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    pub api_base_url: String,
    /// Directory, relative to a project root, where skills are linked.
    pub link_dir: String,
    pub request_timeout_secs: u64,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
}

impl Default for GskillsConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            proxy: None,
            api_base_url: DEFAULT_API_BASE_URL.into(),
            link_dir: DEFAULT_LINK_DIR.into(),
            request_timeout_secs: 30,
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl GskillsConfig {
    /// Read a settable key. The token is never returned in clear text.
    pub fn get(&self, key: ConfigKey) -> Option<String> {
        match key {
            ConfigKey::GithubToken => self.github_token.as_ref().map(|_| "***".to_string()),
            ConfigKey::Proxy => self.proxy.clone(),
        }
    }

    /// Set a settable key. An empty value clears it.
    pub fn set(&mut self, key: ConfigKey, value: &str) {
        let value = value.trim();
        match key {
            ConfigKey::GithubToken => {
                self.github_token = (!value.is_empty()).then(|| Secret::new(value.to_string()));
            },
            ConfigKey::Proxy => {
                self.proxy = (!value.is_empty()).then(|| value.to_string());
            },
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.github_token
            .as_ref()
            .map(|t| t.expose_secret().as_str())
    }
}

/// Worker pool sizes, one per pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Directory listings / downloads in flight per materialization.
    pub materialize: usize,
    pub update_checks: usize,
    pub update_apply: usize,
    pub tidy: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            materialize: 3,
            update_checks: 5,
            update_apply: 3,
            tidy: 10,
        }
    }
}

/// Rate-limit retry settings for the remote client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_backoff_secs: 16,
        }
    }
}

/// Keys that `gskills config set` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    GithubToken,
    Proxy,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 2] = [ConfigKey::GithubToken, ConfigKey::Proxy];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GithubToken => "github_token",
            Self::Proxy => "proxy",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "github_token" => Ok(Self::GithubToken),
            "proxy" => Ok(Self::Proxy),
            other => {
                let names: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                Err(Error::UnknownKey {
                    key: other.to_string(),
                    suggestion: validate::suggest(other, &names, 3).map(str::to_string),
                })
            },
        }
    }
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
