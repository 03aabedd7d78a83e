//! Error taxonomy for the serving path and the configuration pipeline.

use std::fmt;

/// Errors returned to callers of [`crate::QuotaService::allow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowError {
    /// No named, dynamic or default bucket matched the request.
    NoBucket { namespace: String, bucket: String },
    /// The namespace's dynamic bucket cap is exhausted.
    TooManyBuckets { namespace: String, bucket: String },
    /// The request exceeds the bucket's per-request token cap.
    TooManyTokensRequested {
        namespace: String,
        bucket: String,
        requested: u64,
        max: u64,
    },
    /// The reservation could not be granted within the allowed wait.
    Timeout { namespace: String, bucket: String },
    /// The service has no live container (not started, or stopped).
    NotRunning,
}

impl fmt::Display for AllowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBucket { namespace, bucket } => {
                write!(f, "no such bucket {}:{}", namespace, bucket)
            }
            Self::TooManyBuckets { namespace, bucket } => {
                write!(f, "cannot create dynamic bucket {}:{}", namespace, bucket)
            }
            Self::TooManyTokensRequested { namespace, bucket, requested, max } => {
                write!(
                    f,
                    "too many tokens requested on {}:{} (requested {}, max {})",
                    namespace, bucket, requested, max
                )
            }
            Self::Timeout { namespace, bucket } => {
                write!(f, "timed out waiting on {}:{}", namespace, bucket)
            }
            Self::NotRunning => write!(f, "quota service is not running"),
        }
    }
}

impl std::error::Error for AllowError {}

impl AllowError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_no_bucket(&self) -> bool {
        matches!(self, Self::NoBucket { .. })
    }

    pub fn is_too_many_buckets(&self) -> bool {
        matches!(self, Self::TooManyBuckets { .. })
    }
}

/// Errors surfaced by [`crate::config::ConfigPersister`] implementations.
#[derive(Debug)]
pub enum PersistError {
    /// Nothing has been persisted yet.
    NoConfig,
    /// Underlying I/O failure.
    Io(std::io::Error),
    /// The store rejected a write based on a stale version.
    Conflict { submitted: u64, current: u64 },
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConfig => write!(f, "no configuration has been persisted"),
            Self::Io(e) => write!(f, "persistence I/O failure: {}", e),
            Self::Conflict { submitted, current } => {
                write!(f, "stale version {} rejected (store holds {})", submitted, current)
            }
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors from configuration mutations and reloads.
#[derive(Debug)]
pub enum ConfigError {
    /// Referential or range-check failure; nothing was changed.
    Invalid(String),
    /// The persister failed; no local state change.
    PersistenceFailed(PersistError),
    /// The persister rejected a stale version.
    VersionConflict { submitted: u64, current: u64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(reason) => write!(f, "invalid configuration: {}", reason),
            Self::PersistenceFailed(e) => write!(f, "configuration not persisted: {}", e),
            Self::VersionConflict { submitted, current } => {
                write!(
                    f,
                    "configuration version conflict (submitted {}, current {})",
                    submitted, current
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PersistenceFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl ConfigError {
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}
