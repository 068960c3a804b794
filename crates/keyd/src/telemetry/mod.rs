//! Logging and tracing setup for the daemon.
//!
//! Logs are JSON lines on stdout. Spans can additionally be exported over
//! OTLP/gRPC to a collector when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//!
//! # Telemetry invariants
//!
//! - **No key material** may appear in any span attribute or log field. Keys
//!   are identified by feature and sequence only.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`), and
//!   `RUST_LOG` overrides it.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
