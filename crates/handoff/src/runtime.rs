//! Server runtime: accept loop, connection tracking, and graceful stop.
//!
//! The runtime owns the listener. `serve` runs the accept loop; `shutdown`
//! moves the phase Serving → Draining → Stopped: it stops the accept loop,
//! closes the listener, then waits for tracked connections (or the deadline).
//!
//! Uses `CancellationToken` to stop the accept loop and `ConnectionGuard`
//! for drain tracking.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ReloadError, ServeError};
use crate::listener::ListenHandle;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Lifecycle phase of the runtime. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Accepting and handling connections.
    Serving,
    /// No longer accepting; the listener is closed once the accept loop lets
    /// go of it, and in-flight connections are finishing.
    Draining,
    /// Drain finished or timed out.
    Stopped,
}

/// Result of a [`ServerRuntime::shutdown`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight connection finished before the deadline.
    Drained,
    /// The deadline passed with connections still running. They are left alone.
    TimedOut { remaining: usize },
    /// An earlier call already performed the shutdown.
    AlreadyStopped,
}

/// One accepted connection handed to a [`ConnectionHandler`].
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    draining: CancellationToken,
}

impl Connection {
    /// Token cancelled when the runtime starts draining.
    ///
    /// Protocol-aware handlers use it to finish the current request and close
    /// idle keep-alive connections instead of waiting for the deadline.
    pub fn draining(&self) -> CancellationToken {
        self.draining.clone()
    }
}

/// Per-connection request handling, opaque to the runtime.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, conn: Connection) -> impl Future<Output = ()> + Send;
}

impl<F, Fut> ConnectionHandler for F
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, conn: Connection) -> impl Future<Output = ()> + Send {
        self(conn)
    }
}

/// Tracks an in-flight connection for drain coordination.
///
/// The drain waits for all `ConnectionGuard`s to drop.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// The process-wide server state: phase, listener, and live connections.
pub struct ServerRuntime {
    listener: Mutex<Option<Arc<ListenHandle>>>,
    local_addr: SocketAddr,
    phase: watch::Sender<Phase>,

    /// Cancelled when the accept loop should stop.
    stop_accepting: CancellationToken,

    /// True while an accept loop holds the listener.
    accepting: watch::Sender<bool>,

    connection_count: Arc<AtomicUsize>,
    drain_notify: Arc<Notify>,
}

impl ServerRuntime {
    /// Take ownership of `listener` in the Serving phase.
    pub fn new(listener: ListenHandle) -> Self {
        let local_addr = listener.local_addr();
        Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            phase: watch::Sender::new(Phase::Serving),
            stop_accepting: CancellationToken::new(),
            accepting: watch::Sender::new(false),
            connection_count: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Address the listener was bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections whose handlers are still running.
    pub fn active_connections(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Capability query: the live, descriptor-backed listener, if this
    /// runtime still has one to hand to a successor.
    pub fn inheritable_listener(&self) -> Result<Arc<ListenHandle>, ReloadError> {
        if self.phase() != Phase::Serving {
            return Err(ReloadError::NotInheritable("runtime is no longer serving"));
        }
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(ReloadError::NotInheritable("listener already closed"))
    }

    fn connection_guard(&self) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            counter: Arc::clone(&self.connection_count),
            notify: Arc::clone(&self.drain_notify),
        }
    }

    /// Run the accept loop until shutdown.
    ///
    /// Every accepted connection runs `handler` on its own task. Returns
    /// [`ServeError::ListenerClosed`] once shutdown has finished and the
    /// listener is closed.
    pub async fn serve<H: ConnectionHandler>(&self, handler: H) -> ServeError {
        // Claim the accept slot before looking at the phase, so a concurrent
        // shutdown either sees us accepting or we see it draining.
        let already = self.accepting.send_replace(true);
        if already {
            return ServeError::AlreadyServing;
        }

        let listener = match self.inheritable_listener() {
            Ok(listener) => listener,
            Err(_) => {
                self.accepting.send_replace(false);
                return ServeError::ListenerClosed;
            }
        };

        let handler = Arc::new(handler);
        info!(addr = %self.local_addr, "Accepting connections");
        self.accept_loop(&listener, &handler).await;

        drop(listener);
        self.accepting.send_replace(false);
        debug!("Accept loop released the listener");

        let mut phase = self.subscribe();
        let _ = phase.wait_for(|p| *p == Phase::Stopped).await;
        ServeError::ListenerClosed
    }

    async fn accept_loop<H: ConnectionHandler>(&self, listener: &ListenHandle, handler: &Arc<H>) {
        let mut backoff = ACCEPT_BACKOFF_MIN;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop_accepting.cancelled() => return,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    debug!(peer = %peer, "Accepted connection");

                    let guard = self.connection_guard();
                    let handler = Arc::clone(handler);
                    let conn = Connection {
                        stream,
                        peer,
                        draining: self.stop_accepting.clone(),
                    };
                    tokio::spawn(async move {
                        handler.handle(conn).await;
                        drop(guard);
                    });
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Connection failed before accept completed, retrying");
                }
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Accept failed, retrying"
                    );
                    tokio::select! {
                        _ = self.stop_accepting.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
            }
        }
    }

    /// Stop accepting, close the listener, then drain.
    ///
    /// The listener is closed as soon as the accept loop has let go of it, so
    /// new clients are refused instead of queueing on a socket nobody accepts
    /// on. A successor started by a reload holds its own copy and keeps
    /// serving. Waits at most `deadline` for in-flight connections; those still
    /// running afterwards are not aborted. Calling this again performs no
    /// transition; it waits for the first call to finish and returns
    /// [`DrainOutcome::AlreadyStopped`].
    pub async fn shutdown(&self, deadline: Duration) -> DrainOutcome {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Serving {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        });
        if !started {
            let mut phase = self.subscribe();
            let _ = phase.wait_for(|p| *p == Phase::Stopped).await;
            return DrainOutcome::AlreadyStopped;
        }

        info!(addr = %self.local_addr, "Stopping accept loop");
        self.stop_accepting.cancel();

        let mut accepting = self.accepting.subscribe();
        let _ = accepting.wait_for(|running| !*running).await;

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(listener);
        info!(addr = %self.local_addr, "Listener closed");

        let outcome = self.drain(deadline).await;

        self.phase.send_replace(Phase::Stopped);
        outcome
    }

    async fn drain(&self, deadline: Duration) -> DrainOutcome {
        let active = self.active_connections();
        if active == 0 {
            info!("No active connections, drain complete");
            return DrainOutcome::Drained;
        }

        info!(
            active_connections = active,
            timeout_ms = deadline.as_millis() as u64,
            "Draining active connections"
        );

        tokio::select! {
            _ = self.wait_for_drain() => {
                info!("All connections drained cleanly");
                DrainOutcome::Drained
            }
            _ = tokio::time::sleep(deadline) => {
                let remaining = self.active_connections();
                warn!(
                    remaining_connections = remaining,
                    timeout_ms = deadline.as_millis() as u64,
                    "Drain deadline expired, closing listener with connections still running"
                );
                DrainOutcome::TimedOut { remaining }
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drain_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.connection_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Errors that concern a single incoming connection, not the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}
