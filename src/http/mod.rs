//! HTTP serving on top of the connection layer.
//!
//! # Data Flow
//! ```text
//! Server accept loop (TCP, TLS sniffed)
//!     → server.rs HttpHandler::on_connection
//!     → ForwardingListener queue
//!     → axum::serve (HTTP/1.1, HTTP/2)
//!     → Router
//! ```

pub mod server;

pub use server::HttpHandler;
