use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of [`Error`], stable for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Empty identifiers, malformed source references.
    InvalidInput,
    /// Bundle absent from the registry, or remote path absent.
    NotFound,
    /// Rate-limit retries were exhausted.
    RateLimited,
    /// Network failure or unexpected HTTP status.
    Transport,
    /// Malformed remote payload or registry file.
    Parse,
    Filesystem,
    /// A record expected to exist in the registry is missing.
    RegistryConsistency,
    /// Target already exists (link path, overlapping store path).
    Conflict,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("rate limit still exceeded after {attempts} attempts: {url}")]
    RateLimited { url: String, attempts: u32 },

    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("failed to {operation} {}: {source}", path.display())]
    Filesystem {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry record '{id}' not found")]
    RecordMissing { id: String },

    #[error("{message}")]
    Conflict { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} '{subject}': {source}")]
    Context {
        operation: &'static str,
        subject: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    #[must_use]
    pub fn parse(what: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn fs(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Attach the operation and the bundle (or path) it was acting on.
    #[must_use]
    pub fn context(self, operation: &'static str, subject: impl Into<String>) -> Self {
        Self::Context {
            operation,
            subject: subject.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Http { .. } | Self::Transport { .. } => ErrorKind::Transport,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Filesystem { .. } => ErrorKind::Filesystem,
            Self::RecordMissing { .. } => ErrorKind::RegistryConsistency,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Context { source, .. } => source.kind(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_kind() {
        let err = Error::not_found("skill 'demo'").context("update", "demo");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "update 'demo': skill 'demo' not found");
    }

    #[test]
    fn nested_context_reaches_innermost_kind() {
        let err = Error::Cancelled
            .context("materialize", "a/b")
            .context("install", "demo");
        assert!(err.is_cancelled());
    }

    #[test]
    fn http_and_transport_share_kind() {
        let err = Error::Http {
            url: "https://api.github.com/x".into(),
            status: 500,
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn filesystem_message_names_operation_and_path() {
        let err = Error::fs(
            "create directory",
            "/tmp/x",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.kind(), ErrorKind::Filesystem);
        assert!(err.to_string().starts_with("failed to create directory /tmp/x"));
    }
}
