use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("unexpected response from {url}: {reason}")]
    Parse { url: String, reason: String },
    #[error("picture {0} not found")]
    NotFound(String),
    #[error("no content length reported for {0}")]
    SizeUnknown(String),
    #[error("byte ranges not honored for {0}")]
    PartialContentUnsupported(String),
    #[error("cancelled")]
    Cancelled,
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no picture loaded to save")]
    NothingToSave,
}

/// Discriminant of [`FetchError`], carried on error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SourceUnavailable,
    Parse,
    NotFound,
    SizeUnknown,
    PartialContentUnsupported,
    Cancelled,
    Io,
    NothingToSave,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            FetchError::Parse { .. } => ErrorKind::Parse,
            FetchError::NotFound(_) => ErrorKind::NotFound,
            FetchError::SizeUnknown(_) => ErrorKind::SizeUnknown,
            FetchError::PartialContentUnsupported(_) => ErrorKind::PartialContentUnsupported,
            FetchError::Cancelled => ErrorKind::Cancelled,
            FetchError::Io { .. } => ErrorKind::Io,
            FetchError::NothingToSave => ErrorKind::NothingToSave,
        }
    }

    /// Capability failures have a fallback path and are not shown to the user.
    pub fn is_capability(&self) -> bool {
        matches!(
            self,
            FetchError::SizeUnknown(_) | FetchError::PartialContentUnsupported(_)
        )
    }

    pub(crate) fn timed_out(what: &str, after: std::time::Duration) -> Self {
        FetchError::SourceUnavailable(format!("{what} timed out after {}s", after.as_secs()))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::SourceUnavailable(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, FetchError>;
