//! Metric registry and sample stream
//!
//! Metrics are registered once during init and referred to by shared handle
//! afterwards. Observations travel as [`Sample`]s over an unbounded channel
//! owned by the running VU; every sample carries a reference to a shared
//! [`TagSet`] rather than its own copy.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

static METRIC_NAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[\p{L}\p{N}\._ !\?/&#\(\)<>%-]{1,128}$").ok());

/// Check whether `name` may be used as a metric name
pub fn is_valid_metric_name(name: &str) -> bool {
    METRIC_NAME
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Cumulative sum
    Counter,
    /// Last value wins
    Gauge,
    /// Distribution of values
    Trend,
    /// Ratio of non-zero values
    Rate,
}

/// A registered metric
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct Metric {
    name: String,
    metric_type: MetricType,
}

impl Metric {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }
}

/// Ordered, immutable-once-shared set of tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this set with one more tag
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One observation of a metric
#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: Arc<Metric>,
    pub tags: Arc<TagSet>,
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// Metric registry errors
#[derive(Debug, Error, PartialEq)]
pub enum MetricsError {
    #[error("metrics can only be registered in the init environment")]
    MissingEnvironment,
    #[error("invalid metric name '{0}'")]
    InvalidName(String),
    #[error("metric '{name}' already registered as {existing:?}, requested {requested:?}")]
    TypeMismatch {
        name: String,
        existing: MetricType,
        requested: MetricType,
    },
}

/// Registry of named metrics plus the root tag set
#[derive(Debug, Default)]
pub struct Registry {
    metrics: Mutex<HashMap<String, Arc<Metric>>>,
    root_tags: Arc<TagSet>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root_tags(root_tags: TagSet) -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
            root_tags: Arc::new(root_tags),
        }
    }

    /// Register a metric, or fetch it if it already exists with the same type
    pub fn new_metric(
        &self,
        name: &str,
        metric_type: MetricType,
    ) -> Result<Arc<Metric>, MetricsError> {
        if !is_valid_metric_name(name) {
            return Err(MetricsError::InvalidName(name.to_string()));
        }

        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = metrics.get(name) {
            if existing.metric_type != metric_type {
                return Err(MetricsError::TypeMismatch {
                    name: name.to_string(),
                    existing: existing.metric_type,
                    requested: metric_type,
                });
            }
            return Ok(existing.clone());
        }

        let metric = Arc::new(Metric {
            name: name.to_string(),
            metric_type,
        });
        metrics.insert(name.to_string(), metric.clone());
        Ok(metric)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Metric>> {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Shared tag set every sample starts from
    pub fn root_tag_set(&self) -> Arc<TagSet> {
        self.root_tags.clone()
    }
}

/// Send `sample` unless the run is over. Returns whether it was sent.
pub fn push_if_not_done(
    ctx: &CancellationToken,
    sink: &UnboundedSender<Sample>,
    sample: Sample,
) -> bool {
    if ctx.is_cancelled() {
        return false;
    }
    sink.send(sample).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_metric_name_validation() {
        assert!(is_valid_metric_name("mqtt_sent_bytes"));
        assert!(is_valid_metric_name("latency (p95) <ms>"));
        assert!(is_valid_metric_name("température"));
        assert!(!is_valid_metric_name(""));
        assert!(!is_valid_metric_name("bad\nname"));
        assert!(!is_valid_metric_name(&"x".repeat(129)));
        assert!(is_valid_metric_name(&"x".repeat(128)));
    }

    #[test]
    fn test_register_returns_same_handle() {
        let registry = Registry::new();
        let first = registry.new_metric("sent", MetricType::Counter).unwrap();
        let second = registry.new_metric("sent", MetricType::Counter).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "sent");
        assert_eq!(first.metric_type(), MetricType::Counter);
        assert!(registry.get("sent").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_register_type_mismatch() {
        let registry = Registry::new();
        registry.new_metric("sent", MetricType::Counter).unwrap();

        let result = registry.new_metric("sent", MetricType::Gauge);
        assert_eq!(
            result,
            Err(MetricsError::TypeMismatch {
                name: "sent".to_string(),
                existing: MetricType::Counter,
                requested: MetricType::Gauge,
            })
        );
    }

    #[test]
    fn test_register_invalid_name() {
        let registry = Registry::new();
        assert_eq!(
            registry.new_metric("", MetricType::Trend),
            Err(MetricsError::InvalidName(String::new()))
        );
    }

    #[test]
    fn test_root_tag_set_is_shared() {
        let registry = Registry::with_root_tags(TagSet::new().with("scenario", "default"));
        let a = registry.root_tag_set();
        let b = registry.root_tag_set();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.get("scenario"), Some("default"));
        assert_eq!(a.len(), 1);
    }

    fn sample(registry: &Registry) -> Sample {
        Sample {
            metric: registry.new_metric("sent", MetricType::Counter).unwrap(),
            tags: registry.root_tag_set(),
            time: Utc::now(),
            value: 1.0,
        }
    }

    #[test]
    fn test_push_if_not_done() {
        let registry = Registry::new();
        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(push_if_not_done(&ctx, &tx, sample(&registry)));
        assert_eq!(rx.try_recv().unwrap().value, 1.0);

        ctx.cancel();
        assert!(!push_if_not_done(&ctx, &tx, sample(&registry)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_push_to_closed_sink() {
        let registry = Registry::new();
        let ctx = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        assert!(!push_if_not_done(&ctx, &tx, sample(&registry)));
    }
}
