pub mod logger;
pub mod metrics;

pub use logger::{init_tracing, AccessLogEntry, AccessLogger};
pub use metrics::MetricsCollector;
