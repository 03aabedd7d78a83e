//! Structured events describing every serving-path decision.

use std::fmt;
use std::time::Duration;

use serde_json::json;

/// A single decision or lifecycle change.
///
/// Payloads carry the namespace, bucket name and whether the bucket was
/// dynamically materialized, plus kind-specific fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Tokens were granted, after serving `wait`.
    TokensServed {
        namespace: String,
        bucket: String,
        dynamic: bool,
        tokens: u64,
        wait: Duration,
    },
    /// The reservation would have exceeded the allowed wait.
    TimedOut { namespace: String, bucket: String, dynamic: bool, tokens: u64 },
    /// The request exceeded the bucket's per-request cap.
    TooManyTokensRequested { namespace: String, bucket: String, dynamic: bool, tokens: u64 },
    /// Resolution failed. `attempted_dynamic_creation` distinguishes a
    /// cap-exhausted create from a plain miss.
    BucketMissed { namespace: String, bucket: String, attempted_dynamic_creation: bool },
    /// A dynamic bucket was materialized.
    BucketCreated { namespace: String, bucket: String, dynamic: bool },
    /// A bucket was destroyed (idle eviction or container drain).
    BucketRemoved { namespace: String, bucket: String, dynamic: bool },
    /// A new configuration version was installed.
    ConfigUpdated { version: u64 },
}

impl Event {
    /// Namespace the event concerns, if any.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::TokensServed { namespace, .. }
            | Self::TimedOut { namespace, .. }
            | Self::TooManyTokensRequested { namespace, .. }
            | Self::BucketMissed { namespace, .. }
            | Self::BucketCreated { namespace, .. }
            | Self::BucketRemoved { namespace, .. } => Some(namespace),
            Self::ConfigUpdated { .. } => None,
        }
    }

    /// Bucket the event concerns, if any.
    pub fn bucket(&self) -> Option<&str> {
        match self {
            Self::TokensServed { bucket, .. }
            | Self::TimedOut { bucket, .. }
            | Self::TooManyTokensRequested { bucket, .. }
            | Self::BucketMissed { bucket, .. }
            | Self::BucketCreated { bucket, .. }
            | Self::BucketRemoved { bucket, .. } => Some(bucket),
            Self::ConfigUpdated { .. } => None,
        }
    }

    /// JSON rendering for external sinks.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::TokensServed { namespace, bucket, dynamic, tokens, wait } => json!({
                "kind": "tokens_served",
                "namespace": namespace,
                "bucket": bucket,
                "dynamic": dynamic,
                "tokens": tokens,
                "wait_millis": wait.as_millis() as u64,
            }),
            Self::TimedOut { namespace, bucket, dynamic, tokens } => json!({
                "kind": "timed_out",
                "namespace": namespace,
                "bucket": bucket,
                "dynamic": dynamic,
                "tokens": tokens,
            }),
            Self::TooManyTokensRequested { namespace, bucket, dynamic, tokens } => json!({
                "kind": "too_many_tokens_requested",
                "namespace": namespace,
                "bucket": bucket,
                "dynamic": dynamic,
                "tokens": tokens,
            }),
            Self::BucketMissed { namespace, bucket, attempted_dynamic_creation } => json!({
                "kind": "bucket_missed",
                "namespace": namespace,
                "bucket": bucket,
                "attempted_dynamic_creation": attempted_dynamic_creation,
            }),
            Self::BucketCreated { namespace, bucket, dynamic } => json!({
                "kind": "bucket_created",
                "namespace": namespace,
                "bucket": bucket,
                "dynamic": dynamic,
            }),
            Self::BucketRemoved { namespace, bucket, dynamic } => json!({
                "kind": "bucket_removed",
                "namespace": namespace,
                "bucket": bucket,
                "dynamic": dynamic,
            }),
            Self::ConfigUpdated { version } => json!({
                "kind": "config_updated",
                "version": version,
            }),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokensServed { namespace, bucket, tokens, wait, .. } => {
                write!(f, "served {} tokens from {}:{} after {:?}", tokens, namespace, bucket, wait)
            }
            Self::TimedOut { namespace, bucket, tokens, .. } => {
                write!(f, "timed out requesting {} tokens from {}:{}", tokens, namespace, bucket)
            }
            Self::TooManyTokensRequested { namespace, bucket, tokens, .. } => {
                write!(f, "rejected oversized request of {} tokens on {}:{}", tokens, namespace, bucket)
            }
            Self::BucketMissed { namespace, bucket, attempted_dynamic_creation } => {
                if *attempted_dynamic_creation {
                    write!(f, "dynamic bucket creation failed for {}:{}", namespace, bucket)
                } else {
                    write!(f, "no bucket matched {}:{}", namespace, bucket)
                }
            }
            Self::BucketCreated { namespace, bucket, .. } => {
                write!(f, "bucket created {}:{}", namespace, bucket)
            }
            Self::BucketRemoved { namespace, bucket, .. } => {
                write!(f, "bucket removed {}:{}", namespace, bucket)
            }
            Self::ConfigUpdated { version } => {
                write!(f, "configuration updated to version {}", version)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_rendering_tags_the_kind() {
        let event = Event::TokensServed {
            namespace: "api".into(),
            bucket: "search".into(),
            dynamic: false,
            tokens: 3,
            wait: Duration::from_millis(40),
        };
        let value = event.to_json();
        assert_eq!(value["kind"], "tokens_served");
        assert_eq!(value["wait_millis"], 40);
    }

    #[test]
    fn accessors_cover_config_updates() {
        let event = Event::ConfigUpdated { version: 9 };
        assert_eq!(event.namespace(), None);
        assert_eq!(event.bucket(), None);
        assert!(event.to_string().contains('9'));
    }

    #[test]
    fn miss_display_distinguishes_failed_creation() {
        let miss = Event::BucketMissed {
            namespace: "api".into(),
            bucket: "burst".into(),
            attempted_dynamic_creation: true,
        };
        assert!(miss.to_string().contains("creation failed"));
    }
}
