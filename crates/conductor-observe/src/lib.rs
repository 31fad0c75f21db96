//! Observability setup for Conductor: tracing subscriber with optional
//! OpenTelemetry span export.

pub mod tracing_setup;
