//! Health-driven service activation.
//!
//! # Data Flow
//! ```text
//! Periodic timer (gate.rs HealthGate::run)
//!     → check.rs HealthCheck::check
//!     → state.rs tracker (consecutive successes/failures)
//!     → on transition: swap the gate's SwitchableHandler
//!           Healthy   → active handler
//!           Unhealthy → standby handler (RejectHandler by default)
//! ```
//!
//! # Design Decisions
//! - State transitions require consecutive successes/failures
//! - A gate starts on standby and has to earn its first activation
//! - Servers hold the gate's switch, so flipping never touches the accept loop

pub mod check;
pub mod gate;
pub mod state;

pub use check::{HealthCheck, HttpCheck, TcpCheck};
pub use gate::HealthGate;
pub use state::{HealthState, HealthTracker};
