//! Errors of the accept loop, listeners and entrypoint composition.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::handler::MiddlewareError;
use crate::net::addr::AddrParseError;

/// Error type for listener and server operations.
///
/// Clonable so one terminal error can be handed to
/// [`Handler::on_server_exit`](crate::handler::Handler::on_server_exit) and
/// cached by listeners that replay it.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// The listener was closed; expected during shutdown.
    #[error("listener closed")]
    ListenerClosed,

    /// Failed to bind the listening socket.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Accepting a connection failed.
    #[error("failed to accept: {0}")]
    Accept(#[source] Arc<io::Error>),

    /// `start` was called on a server that is already running or stopped.
    #[error("server already started")]
    AlreadyStarted,
}

impl ServerError {
    pub fn accept(err: io::Error) -> Self {
        ServerError::Accept(Arc::new(err))
    }

    pub fn bind(address: impl Into<String>, err: io::Error) -> Self {
        ServerError::Bind {
            address: address.into(),
            source: Arc::new(err),
        }
    }

    /// True for accept errors worth retrying: per-connection failures and
    /// descriptor exhaustion. The accept loop keeps running on these.
    pub fn is_transient(&self) -> bool {
        match self {
            ServerError::Accept(err) => is_transient_io(err),
            _ => false,
        }
    }

    /// How long the accept loop pauses before retrying a transient error.
    pub(crate) fn retry_delay(&self) -> Duration {
        match self {
            ServerError::Accept(err) if is_fd_exhaustion(err) => Duration::from_millis(50),
            _ => Duration::ZERO,
        }
    }

    pub fn is_listener_closed(&self) -> bool {
        matches!(self, ServerError::ListenerClosed)
    }
}

/// Error type for building and registering entrypoints.
#[derive(Debug, Error)]
pub enum EntryPointError {
    #[error("entrypoint name must not be empty")]
    EmptyName,

    #[error("entrypoint {0:?} has no handler")]
    MissingHandler(String),

    #[error("entrypoint {0:?} is already registered")]
    Duplicate(String),

    #[error("protocol {0:?} is already registered")]
    DuplicateProtocol(String),

    #[error("no protocol registered for scheme {0:?}")]
    UnknownProtocol(String),

    #[error("invalid listen address: {0}")]
    Address(#[from] AddrParseError),

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_fd_exhaustion(err)
}

// EMFILE / ENFILE
fn is_fd_exhaustion(err: &io::Error) -> bool {
    cfg!(unix) && matches!(err.raw_os_error(), Some(23) | Some(24))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_accept_errors() {
        let reset = ServerError::accept(io::Error::from(io::ErrorKind::ConnectionAborted));
        assert!(reset.is_transient());
        assert_eq!(reset.retry_delay(), Duration::ZERO);

        let fatal = ServerError::accept(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!fatal.is_transient());

        assert!(!ServerError::ListenerClosed.is_transient());
        assert!(ServerError::ListenerClosed.is_listener_closed());
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_backs_off() {
        let emfile = ServerError::accept(io::Error::from_raw_os_error(24));
        assert!(emfile.is_transient());
        assert!(emfile.retry_delay() > Duration::ZERO);
    }
}
