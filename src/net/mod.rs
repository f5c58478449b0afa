//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP/Unix connection
//!     → listener.rs (bound socket, connection limits, closable accept)
//!     → connection.rs (connection id, active connection tracking)
//!     → conn.rs (uniform Conn handed to handlers)
//!     → sniff.rs (optional: peek first byte, TLS or plaintext)
//!     → Hand off to Handler::on_connection
//!
//! Sniff States:
//!     Unsniffed → Handshaking → Tls
//!               → Plain
//!               → Failed (cached error)
//! ```
//!
//! # Design Decisions
//! - Closing a listener drops the OS socket right away
//! - TLS mode is re-read for every accepted connection
//! - Sniffing is lazy: nothing is read until the handler reads or writes

pub mod addr;
pub mod conn;
pub mod connection;
pub mod listener;
pub mod sniff;
pub mod tls;

pub use addr::{Addr, ListenAddr};
pub use conn::{Conn, Stream};
pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{Acceptor, Listener, TcpAcceptor};
#[cfg(unix)]
pub use listener::UnixAcceptor;
pub use sniff::{SniffError, SniffStream};
pub use tls::TlsMode;
