//! Observability infrastructure.
//!
//! Provides:
//! - Structured logging via tracing
//! - OpenTelemetry metrics for delivery, replay and fan-out

pub mod metrics;
pub mod tracing;
