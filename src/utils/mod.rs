//! # Utility Modules
//!
//! Supporting utilities shared by the transport and RPC layers.
//!
//! ## Components
//! - **Logging**: Subscriber setup driven by `LoggingConfig`
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Deadline wrappers for async and blocking calls
//! - **Worker Pool**: Fixed-size thread pool for inbound RPC dispatch

pub mod logging;
pub mod metrics;
pub mod timeout;
pub mod worker_pool;

pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
pub use worker_pool::WorkerPool;
