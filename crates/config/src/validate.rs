//! Configuration validation.
//!
//! Reports values that would make the remote client or the worker pools
//! misbehave, before any network or filesystem work starts.

use crate::schema::{DEFAULT_API_BASE_URL, GskillsConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "concurrency.tidy"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.count(Severity::Error) > 0
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Check a loaded configuration for unusable values.
#[must_use]
pub fn validate(config: &GskillsConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    let pools = [
        ("concurrency.materialize", config.concurrency.materialize),
        ("concurrency.update_checks", config.concurrency.update_checks),
        ("concurrency.update_apply", config.concurrency.update_apply),
        ("concurrency.tidy", config.concurrency.tidy),
    ];
    for (path, size) in pools {
        if size == 0 {
            result.push(Severity::Error, path, "worker pool size must be at least 1");
        }
    }

    if config.retry.max_attempts == 0 {
        result.push(
            Severity::Error,
            "retry.max_attempts",
            "at least one attempt is required",
        );
    }

    if let Some(proxy) = config.proxy.as_deref()
        && let Err(e) = url::Url::parse(proxy)
    {
        result.push(Severity::Error, "proxy", format!("invalid proxy URL '{proxy}': {e}"));
    }

    match url::Url::parse(&config.api_base_url) {
        Ok(u) if u.scheme() != "https" => result.push(
            Severity::Warning,
            "api_base_url",
            format!(
                "'{}' is not https (default is {DEFAULT_API_BASE_URL}); the token is sent in clear text",
                config.api_base_url
            ),
        ),
        Ok(_) => {},
        Err(e) => result.push(
            Severity::Error,
            "api_base_url",
            format!("invalid URL '{}': {e}", config.api_base_url),
        ),
    }

    if config.link_dir.trim().is_empty() || std::path::Path::new(&config.link_dir).is_absolute()
    {
        result.push(
            Severity::Error,
            "link_dir",
            "must be a non-empty path relative to the project root",
        );
    }

    result
}

// ── Levenshtein distance ────────────────────────────────────────────────────

/// Edit distance over chars, one DP row at a time.
fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitute = diagonal + usize::from(ca != *cb);
            diagonal = row[j + 1];
            row[j + 1] = substitute.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    row[b.len()]
}

/// Find the best match for `needle` among `candidates`. Returns `Some(best)`
/// if the distance is <= `max_distance`.
pub(crate) fn suggest<'a>(
    needle: &str,
    candidates: &[&'a str],
    max_distance: usize,
) -> Option<&'a str> {
    candidates
        .iter()
        .map(|&c| (c, levenshtein(needle, c)))
        .filter(|&(_, d)| d > 0 && d <= max_distance)
        .min_by_key(|&(_, d)| d)
        .map(|(c, _)| c)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("proxy", "proxy"), 0);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("proxi", "proxy"), 1);
        assert_eq!(levenshtein("prxy", "proxy"), 1);
    }

    #[test]
    fn suggest_ignores_exact_and_far_matches() {
        let keys = ["github_token", "proxy"];
        assert_eq!(suggest("proxyy", &keys, 3), Some("proxy"));
        assert_eq!(suggest("proxy", &keys, 3), None);
        assert_eq!(suggest("zzzzzzzzz", &keys, 3), None);
    }

    #[test]
    fn default_config_is_clean() {
        let result = validate(&GskillsConfig::default());
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn zero_pool_is_error() {
        let mut cfg = GskillsConfig::default();
        cfg.concurrency.tidy = 0;
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].path, "concurrency.tidy");
    }

    #[test]
    fn bad_proxy_is_error() {
        let cfg = GskillsConfig {
            proxy: Some("not a url".into()),
            ..GskillsConfig::default()
        };
        let result = validate(&cfg);
        assert_eq!(result.count(Severity::Error), 1);
        assert_eq!(result.diagnostics[0].path, "proxy");
    }

    #[test]
    fn plain_http_api_is_warning() {
        let cfg = GskillsConfig {
            api_base_url: "http://ghe.internal/api/v3".into(),
            ..GskillsConfig::default()
        };
        let result = validate(&cfg);
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[test]
    fn absolute_link_dir_is_error() {
        let cfg = GskillsConfig {
            link_dir: "/etc/skills".into(),
            ..GskillsConfig::default()
        };
        assert!(validate(&cfg).has_errors());
    }
}
