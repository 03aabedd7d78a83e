//! Configuration model for the quota service.
//!
//! The persisted form is JSON with a stable field set. Fields that are
//! not part of this schema are preserved verbatim across
//! read-modify-write cycles so that newer writers can coexist with
//! older readers.
//!
//! Zero is a meaningful value for `wait_timeout_millis` (non-blocking),
//! `max_idle_millis` (never idle-evict) and `max_tokens_per_request`
//! (unbounded), so those fields are optional in the schema: an absent
//! field inherits from the global defaults, an explicit zero keeps its
//! documented meaning. For `size`, `fill_rate` and `max_debt_millis`
//! zero simply means "unset".

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub mod persister;
pub mod pipeline;

pub use persister::{ConfigPersister, DiskPersister, MemoryPersister};
pub use pipeline::ConfigPipeline;

/// Reserved bucket name denoting a namespace's default bucket.
pub const DEFAULT_BUCKET_NAME: &str = "__default__";

/// Built-in fallbacks applied when `global_defaults` leaves a field
/// unset.
pub const DEFAULT_BUCKET_SIZE: u64 = 100;
pub const DEFAULT_FILL_RATE: u64 = 50;
pub const DEFAULT_WAIT_TIMEOUT_MILLIS: u64 = 1000;
pub const DEFAULT_MAX_DEBT_MILLIS: u64 = 10_000;

/// Fill rates above one token per nanosecond collapse the accrual
/// period to zero and are rejected.
pub const MAX_FILL_RATE: u64 = 1_000_000_000;

/// Per-bucket rate parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Token capacity; bounds burst size.
    pub size: u64,
    /// Tokens accrued per second.
    pub fill_rate: u64,
    /// How long a caller may be blocked. Zero means non-blocking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_timeout_millis: Option<u64>,
    /// Idle eviction horizon for dynamic buckets. Zero means never.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle_millis: Option<u64>,
    /// Bound on how far into the future reservations may extend.
    pub max_debt_millis: u64,
    /// Per-request token cap. Zero means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_request: Option<u64>,
    /// Fields this version does not understand, preserved on rewrite.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl BucketConfig {
    /// A config with every field at its built-in default.
    pub fn with_defaults() -> Self {
        Self {
            size: DEFAULT_BUCKET_SIZE,
            fill_rate: DEFAULT_FILL_RATE,
            wait_timeout_millis: Some(DEFAULT_WAIT_TIMEOUT_MILLIS),
            max_idle_millis: Some(0),
            max_debt_millis: DEFAULT_MAX_DEBT_MILLIS,
            max_tokens_per_request: Some(0),
            unknown: BTreeMap::new(),
        }
    }

    /// Resolved blocking budget for callers of this bucket.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_millis.unwrap_or(DEFAULT_WAIT_TIMEOUT_MILLIS))
    }

    /// Resolved idle-eviction horizon; `None` means never evict.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.max_idle_millis.unwrap_or(0) {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    /// Resolved reservation-depth bound.
    pub fn max_debt(&self) -> Duration {
        Duration::from_millis(self.max_debt_millis)
    }

    /// Resolved per-request cap; `None` means unbounded.
    pub fn request_cap(&self) -> Option<u64> {
        match self.max_tokens_per_request.unwrap_or(0) {
            0 => None,
            cap => Some(cap),
        }
    }

    fn inherit_from(&mut self, defaults: &BucketConfig) {
        if self.size == 0 {
            self.size = defaults.size;
        }
        if self.fill_rate == 0 {
            self.fill_rate = defaults.fill_rate;
        }
        if self.wait_timeout_millis.is_none() {
            self.wait_timeout_millis = defaults.wait_timeout_millis;
        }
        if self.max_idle_millis.is_none() {
            self.max_idle_millis = defaults.max_idle_millis;
        }
        if self.max_debt_millis == 0 {
            self.max_debt_millis = defaults.max_debt_millis;
        }
        if self.max_tokens_per_request.is_none() {
            self.max_tokens_per_request = defaults.max_tokens_per_request;
        }
    }
}

/// A grouping of buckets sharing a template, default and caps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub name: String,
    /// Cap on materialized dynamic buckets. Zero means no cap.
    pub max_dynamic_buckets: u64,
    /// Template for buckets materialized on first access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_bucket_template: Option<BucketConfig>,
    /// Fall-through bucket for names that match nothing else.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_bucket: Option<BucketConfig>,
    /// Named buckets, keyed by bucket name.
    pub buckets: BTreeMap<String, BucketConfig>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl NamespaceConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }
}

/// Versioned root of the quota configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Strictly increasing across successful mutations.
    pub version: u64,
    /// Who last mutated this config.
    pub user: String,
    /// Unix seconds of the last mutation.
    pub date: i64,
    /// Inheritance source for unset bucket fields.
    pub global_defaults: BucketConfig,
    /// Namespaces keyed by name.
    pub namespaces: BTreeMap<String, NamespaceConfig>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl ServiceConfig {
    /// An empty config carrying the built-in global defaults.
    pub fn with_defaults() -> Self {
        Self {
            version: 1,
            global_defaults: BucketConfig::with_defaults(),
            ..Self::default()
        }
    }

    pub fn namespace(&self, name: &str) -> Option<&NamespaceConfig> {
        self.namespaces.get(name)
    }

    pub fn namespace_mut(&mut self, name: &str) -> Option<&mut NamespaceConfig> {
        self.namespaces.get_mut(name)
    }

    /// Serialize to the persisted JSON form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Parse the persisted JSON form.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Resolve unset fields throughout a config.
///
/// Applied at load time and again before every persist, so that both
/// locally mutated and externally edited configs observe the same
/// resolution. Also normalizes namespace `name` fields left empty when
/// the namespace was addressed only by its map key.
pub fn apply_defaults(cfg: &mut ServiceConfig) {
    let gd = &mut cfg.global_defaults;
    if gd.size == 0 {
        gd.size = DEFAULT_BUCKET_SIZE;
    }
    if gd.fill_rate == 0 {
        gd.fill_rate = DEFAULT_FILL_RATE;
    }
    if gd.wait_timeout_millis.is_none() {
        gd.wait_timeout_millis = Some(DEFAULT_WAIT_TIMEOUT_MILLIS);
    }
    if gd.max_idle_millis.is_none() {
        gd.max_idle_millis = Some(0);
    }
    if gd.max_debt_millis == 0 {
        gd.max_debt_millis = DEFAULT_MAX_DEBT_MILLIS;
    }
    if gd.max_tokens_per_request.is_none() {
        gd.max_tokens_per_request = Some(0);
    }

    let defaults = cfg.global_defaults.clone();
    for (key, ns) in cfg.namespaces.iter_mut() {
        if ns.name.is_empty() {
            ns.name = key.clone();
        }
        if let Some(template) = ns.dynamic_bucket_template.as_mut() {
            template.inherit_from(&defaults);
        }
        if let Some(default_bucket) = ns.default_bucket.as_mut() {
            default_bucket.inherit_from(&defaults);
        }
        for bucket in ns.buckets.values_mut() {
            bucket.inherit_from(&defaults);
        }
    }
}

/// Well-formedness and range checks, run after [`apply_defaults`].
pub fn validate(cfg: &ServiceConfig) -> Result<(), ConfigError> {
    check_bucket("global defaults", &cfg.global_defaults)?;
    for (key, ns) in &cfg.namespaces {
        if key != &ns.name {
            return Err(ConfigError::Invalid(format!(
                "namespace keyed {:?} declares name {:?}",
                key, ns.name
            )));
        }
        check_name("namespace", key)?;
        if let Some(template) = &ns.dynamic_bucket_template {
            check_bucket(&format!("{}: dynamic bucket template", key), template)?;
        }
        if let Some(default_bucket) = &ns.default_bucket {
            check_bucket(&format!("{}:{}", key, DEFAULT_BUCKET_NAME), default_bucket)?;
        }
        for (bucket_name, bucket) in &ns.buckets {
            if bucket_name == DEFAULT_BUCKET_NAME {
                return Err(ConfigError::Invalid(format!(
                    "{}: {:?} is reserved for the default bucket",
                    key, DEFAULT_BUCKET_NAME
                )));
            }
            check_name("bucket", bucket_name)?;
            check_bucket(&format!("{}:{}", key, bucket_name), bucket)?;
        }
    }
    Ok(())
}

fn check_name(kind: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Invalid(format!("{} name must not be empty", kind)));
    }
    let ok = name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !ok {
        return Err(ConfigError::Invalid(format!(
            "{} name {:?} contains characters outside [A-Za-z0-9_.-]",
            kind, name
        )));
    }
    Ok(())
}

fn check_bucket(context: &str, bucket: &BucketConfig) -> Result<(), ConfigError> {
    if bucket.size == 0 {
        return Err(ConfigError::Invalid(format!("{}: size must be at least 1", context)));
    }
    if bucket.fill_rate == 0 {
        return Err(ConfigError::Invalid(format!("{}: fill_rate must be at least 1", context)));
    }
    if bucket.fill_rate > MAX_FILL_RATE {
        return Err(ConfigError::Invalid(format!(
            "{}: fill_rate {} exceeds {} tokens/sec",
            context, bucket.fill_rate, MAX_FILL_RATE
        )));
    }
    Ok(())
}
