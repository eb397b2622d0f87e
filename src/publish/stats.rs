//! Metrics recorded for published messages

use crate::config::MetricsSection;
use crate::error::{PublishError, PublishResult};
use crate::observability::metrics::{
    push_if_not_done, Metric, MetricType, MetricsError, Sample, TagSet,
};
use crate::vu::Vu;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Metric handles registered for the publisher, plus the tags every sample shares
#[derive(Debug, Clone)]
pub struct MqttMetrics {
    pub sent_bytes: Arc<Metric>,
    /// Registered for the subscribe side; the publisher never records it
    pub received_bytes: Arc<Metric>,
    pub sent_messages: Arc<Metric>,
    /// Registered for the subscribe side; the publisher never records it
    pub received_messages: Arc<Metric>,
    pub sent_dates: Arc<Metric>,
    pub tags: Arc<TagSet>,
}

impl MqttMetrics {
    /// Register the publisher's metrics. Only possible during init.
    pub fn register(vu: &Vu, labels: &MetricsSection) -> Result<Self, MetricsError> {
        let registry = vu
            .init_env()
            .ok_or(MetricsError::MissingEnvironment)?
            .registry();

        Ok(Self {
            sent_bytes: registry.new_metric(&labels.sent_bytes, MetricType::Counter)?,
            received_bytes: registry.new_metric(&labels.received_bytes, MetricType::Counter)?,
            sent_messages: registry.new_metric(&labels.sent_messages, MetricType::Counter)?,
            received_messages: registry
                .new_metric(&labels.received_messages, MetricType::Counter)?,
            sent_dates: registry.new_metric(&labels.sent_dates, MetricType::Gauge)?,
            tags: registry.root_tag_set(),
        })
    }

    /// Record one sent message of `payload_len` bytes.
    ///
    /// Pushes the message count, byte count and send time with one timestamp
    /// and the shared tag set. Samples are silently skipped once the run
    /// context is cancelled; a VU without state or context is
    /// [`PublishError::StateUnavailable`].
    pub fn push_sent(&self, vu: &Vu, payload_len: usize) -> PublishResult<()> {
        let now = Utc::now();
        let state = vu.state().ok_or(PublishError::StateUnavailable)?;
        let ctx = vu.context().ok_or(PublishError::StateUnavailable)?;

        let observations = [
            (&self.sent_messages, 1.0),
            (&self.sent_bytes, payload_len as f64),
            (&self.sent_dates, now.timestamp_millis() as f64),
        ];

        for (metric, value) in observations {
            let sample = Sample {
                metric: metric.clone(),
                tags: self.tags.clone(),
                time: now,
                value,
            };
            if !push_if_not_done(&ctx, &state.samples, sample) {
                debug!(metric = metric.name(), "Run is over, sample skipped");
            }
        }
        Ok(())
    }
}
