//! Error types for listener acquisition, serving, and reloads.
//!
//! Acquisition errors are fatal at startup. Reload errors are local to one
//! restart attempt and never take down the serving process.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that prevent the process from obtaining its listener.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Binding a fresh socket failed (address in use, permission denied, ...).
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The inherited descriptor is missing or unusable.
    #[error("inherited fd {fd} is unusable: {reason}")]
    Inherit {
        fd: RawFd,
        #[source]
        reason: InheritFailure,
    },
}

/// Why an inherited descriptor was rejected.
#[derive(Debug, Error)]
pub enum InheritFailure {
    #[error("descriptor is not open: {0}")]
    NotOpen(#[source] io::Error),

    #[error("descriptor is not a socket")]
    NotSocket,

    #[error("socket is not a stream socket")]
    NotStream,

    #[error("socket is not listening")]
    NotListening,

    #[error("failed to adopt socket: {0}")]
    Adopt(#[source] io::Error),
}

/// Errors from a single restart attempt.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// The current listener cannot hand out an OS descriptor.
    #[error("listener cannot be inherited: {0}")]
    NotInheritable(&'static str),

    /// Duplicating the listener descriptor failed.
    #[error("failed to export listener descriptor: {0}")]
    Export(#[source] io::Error),

    /// The successor process could not be started.
    #[error("failed to spawn successor {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why [`ServerRuntime::serve`](crate::ServerRuntime::serve) returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServeError {
    /// The listener was closed by shutdown. This is the normal way out.
    #[error("listener closed")]
    ListenerClosed,

    /// Another `serve` call is already running the accept loop.
    #[error("runtime is already serving")]
    AlreadyServing,
}

impl ServeError {
    /// Whether this is the expected end of a graceful shutdown.
    pub fn is_listener_closed(&self) -> bool {
        matches!(self, ServeError::ListenerClosed)
    }
}
