//! # handoff
//!
//! Zero-downtime restart for a server that owns a single listening socket.
//!
//! ## Overview
//!
//! A restart hands the live listening socket from the running process to its
//! replacement instead of closing and re-binding it:
//! 1. The running process duplicates its listener descriptor and spawns a new
//!    copy of itself with that descriptor attached at fd 3 and `--graceful`
//!    on the command line
//! 2. The new process adopts fd 3 and immediately accepts on it
//! 3. The old process stops accepting and drains in-flight connections
//! 4. After drain (or timeout), the old process closes its copy and exits
//!
//! Both processes briefly accept on the same socket. The kernel hands every
//! pending connection to exactly one of them, so nothing is dropped.
//!
//! ## Signal Conventions
//!
//! - `SIGINT` / `SIGTERM`: graceful shutdown (drain connections, then exit)
//! - `SIGUSR2`: graceful restart (spawn successor with the inherited socket,
//!   then drain and exit)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("handoff requires a Unix platform (Linux or macOS)");

mod error;
mod listener;
mod reload;
mod runtime;
mod signals;

pub use error::{AcquireError, InheritFailure, ReloadError, ServeError};
pub use listener::{acquire, AcquireMode, ListenHandle, INHERITED_FD};
pub use reload::{Reloader, Successor, GRACEFUL_FLAG};
pub use runtime::{Connection, ConnectionHandler, DrainOutcome, Phase, ServerRuntime};
pub use signals::{
    ControlSignal, CoordinatorExit, CoordinatorState, SignalCoordinator, SignalQueue,
    SIGNAL_QUEUE_CAPACITY,
};
