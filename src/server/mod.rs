//! Server subsystem.
//!
//! # Data Flow
//! ```text
//! "[scheme://]host:port"
//!     → registry.rs (scheme → listener builder)
//!     → tcp.rs (Server: accept loop, TLS sniffing, shutdown callbacks)
//!     → entrypoint.rs (name + middleware chain + TLS mode + Server)
//!     → manager.rs (entrypoints by name)
//! ```
//!
//! # Design Decisions
//! - Servers are started once and stopped once; stop is idempotent
//! - Shutdown callbacks run last registered first

pub mod entrypoint;
pub mod error;
pub mod manager;
pub mod registry;
pub mod tcp;

pub use entrypoint::{EntryPoint, EntryPointBuilder};
pub use error::{EntryPointError, ServerError};
pub use manager::EntryPointManager;
pub use registry::{BuildRequest, ProtocolRegistry};
pub use tcp::{Server, ServerState};
