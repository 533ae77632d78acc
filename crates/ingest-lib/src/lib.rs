//! Rate-limited market data ingestion library
//!
//! This crate provides the core functionality for:
//! - Quota-gated upstream requests with retry and cooldown
//! - Chunked batch loading into a persistence sink
//! - Periodic health supervision with suppressed alerting
//! - Usage snapshots, HTTP publishing and observability

pub mod batch;
pub mod error;
pub mod health;
pub mod limiter;
pub mod loader;
pub mod models;
pub mod observability;
pub mod publisher;
pub mod sink;

pub use error::{IngestError, Result, TransportError};
pub use health::{AggregateHealth, HealthCheckResult, HealthStatus, OverallStatus, ReadinessResponse};
pub use models::*;
pub use observability::{IngestMetrics, StructuredLogger};
