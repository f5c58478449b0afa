//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields
//!       (connection_id, peer_addr, entrypoint, cert, source, error)
//!
//! logging.rs installs the subscriber:
//!     → EnvFilter (RUST_LOG, else configured level)
//!     → pretty or JSON formatter on stdout
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection ids flow through every connection-level event

pub mod logging;

pub use logging::init_logging;
