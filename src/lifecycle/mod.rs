//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validated config → certificate providers (first poll inline)
//!     → entrypoints bound, handlers installed → accept loops spawned
//!
//! Shutdown (shutdown.rs):
//!     Signal received → entrypoints shut down (grace period)
//!     → providers cancelled, deletions pushed → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: certificates first, then listeners
//! - Ordered shutdown: stop accept, drain, then certificates
//! - Shutdown has timeout: handlers are told to give up after the deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use signals::shutdown_signal;
pub use startup::{start, Hotline, StartupError};
