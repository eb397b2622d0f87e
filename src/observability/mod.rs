//! Observability: structured logging and the metric registry

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{
    is_valid_metric_name, push_if_not_done, Metric, MetricType, MetricsError, Registry, Sample,
    TagSet,
};

// Span macros for structured logging
pub use logging::{connection_span, publish_span};
