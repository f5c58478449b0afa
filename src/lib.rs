//! Hotline: pluggable TCP/HTTP listeners with live-swappable handlers,
//! TLS sniffing and dynamic certificate management.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                       HOTLINE                         │
//!                 │                                                       │
//!   Client ───────┼─▶ net::listener ─▶ server::tcp ─▶ net::sniff ─────┐   │
//!                 │   (accept, limits)  (accept loop)  (TLS or plain)  │   │
//!                 │                                                    ▼   │
//!                 │            handler::middleware (composed chain)        │
//!                 │                           │                            │
//!                 │                           ▼                            │
//!                 │  handler::switchable / health::gate ─▶ terminal        │
//!                 │                                  (FnHandler, http)     │
//!                 │                                                       │
//!                 │  tls::provider ─▶ tls::manager ─▶ tls::store           │
//!                 │  (file/url poll)   (name → cert)   (per-entrypoint)    │
//!                 │                         ▲                             │
//!                 │                         └── rustls SNI lookup          │
//!                 │                                                       │
//!                 │  config · observability · lifecycle                   │
//!                 └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod handler;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;
pub mod tls;

pub use config::HotlineConfig;
pub use handler::{Handler, SharedHandler};
pub use lifecycle::Hotline;
pub use server::{EntryPoint, EntryPointManager, Server};
pub use tls::CertManager;
