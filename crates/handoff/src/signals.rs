//! Signal coordination.
//!
//! OS signals are bridged into a bounded queue of [`ControlSignal`]s and
//! consumed one at a time by a single [`SignalCoordinator`]:
//! - `SIGINT` / `SIGTERM` → stop accepting, drain, stop
//! - `SIGUSR2` → spawn successor; on success drain and stop, on failure keep serving
//!
//! The coordinator is the only component that asks the runtime to shut down.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reload::Reloader;
use crate::runtime::{DrainOutcome, ServerRuntime};

/// Queue depth. Large enough that a rapid double signal is never dropped.
pub const SIGNAL_QUEUE_CAPACITY: usize = 10;

/// A control request, usually translated from an OS signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGINT: graceful shutdown.
    Interrupt,
    /// SIGTERM: graceful shutdown.
    Terminate,
    /// SIGUSR2: graceful restart.
    Reload,
}

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Listening,
    Stopped,
}

/// Why [`SignalCoordinator::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorExit {
    /// A termination signal shut the runtime down.
    Terminated {
        signal: ControlSignal,
        drain: DrainOutcome,
    },
    /// A successor was started and this runtime has retired.
    Restarted {
        successor_pid: Option<u32>,
        drain: DrainOutcome,
    },
    /// The queue closed, or the coordinator had already stopped. The runtime
    /// was not touched.
    Detached,
}

/// Bounded queue of control signals plus the optional OS signal bridge feeding it.
pub struct SignalQueue {
    rx: mpsc::Receiver<ControlSignal>,
    bridge: CancellationToken,
    /// Whether SIGINT/SIGTERM handlers were installed for this queue.
    os_backed: bool,
}

impl SignalQueue {
    /// A queue fed only through the returned sender.
    pub fn channel() -> (mpsc::Sender<ControlSignal>, Self) {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        (
            tx,
            Self {
                rx,
                bridge: CancellationToken::new(),
                os_backed: false,
            },
        )
    }

    /// A queue fed by SIGINT, SIGTERM, and SIGUSR2.
    ///
    /// Handlers are installed before this returns, so install the queue
    /// before doing anything slow at startup.
    pub fn os_signals() -> io::Result<Self> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;

        let (tx, mut queue) = Self::channel();
        queue.os_backed = true;
        let bridge = queue.bridge.clone();

        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = bridge.cancelled() => break,
                    Some(()) = sigint.recv() => ControlSignal::Interrupt,
                    Some(()) = sigterm.recv() => ControlSignal::Terminate,
                    Some(()) = sigusr2.recv() => ControlSignal::Reload,
                    else => break,
                };
                debug!(?signal, "OS signal received");

                tokio::select! {
                    _ = bridge.cancelled() => break,
                    sent = tx.send(signal) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Signal bridge stopped");
        });

        info!("Listening for SIGINT, SIGTERM (shutdown) and SIGUSR2 (restart)");
        Ok(queue)
    }

    /// Next queued signal, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ControlSignal> {
        self.rx.recv().await
    }

    /// Stop the OS bridge and refuse further signals.
    ///
    /// For an OS-backed queue, SIGINT and SIGTERM get their default action
    /// back, so a second termination signal kills a process that is stuck
    /// draining. SIGUSR2 stays caught and is ignored from here on. This is
    /// final for the process: a later [`SignalQueue::os_signals`] does not
    /// reinstall the termination handlers.
    pub fn deregister(&mut self) {
        self.bridge.cancel();
        self.rx.close();

        if std::mem::take(&mut self.os_backed) {
            for signal in [libc::SIGINT, libc::SIGTERM] {
                if let Err(e) = restore_default_action(signal) {
                    warn!(signal, error = %e, "Failed to restore default signal action");
                }
            }
            debug!("SIGINT and SIGTERM restored to their default action");
        }
    }
}

/// Reset `signal` to `SIG_DFL`.
fn restore_default_action(signal: libc::c_int) -> io::Result<()> {
    // SAFETY: a zeroed sigaction with SIG_DFL and an empty mask is a valid
    // argument, and no old action is requested.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl Drop for SignalQueue {
    fn drop(&mut self) {
        self.bridge.cancel();
    }
}

/// The single control loop that turns signals into runtime transitions.
pub struct SignalCoordinator {
    queue: SignalQueue,
    runtime: Arc<ServerRuntime>,
    reloader: Reloader,
    drain_timeout: Duration,
    state: CoordinatorState,
    failed_reloads: usize,
}

impl SignalCoordinator {
    pub fn new(
        queue: SignalQueue,
        runtime: Arc<ServerRuntime>,
        reloader: Reloader,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            runtime,
            reloader,
            drain_timeout,
            state: CoordinatorState::Listening,
            failed_reloads: 0,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Reload attempts that failed while the runtime kept serving.
    pub fn failed_reloads(&self) -> usize {
        self.failed_reloads
    }

    /// Process signals until one of them stops the coordinator.
    pub async fn run(&mut self) -> CoordinatorExit {
        if self.state == CoordinatorState::Stopped {
            return CoordinatorExit::Detached;
        }

        while let Some(signal) = self.queue.recv().await {
            info!(?signal, "Control signal received");

            match signal {
                ControlSignal::Interrupt | ControlSignal::Terminate => {
                    self.queue.deregister();
                    let drain = self.runtime.shutdown(self.drain_timeout).await;
                    self.state = CoordinatorState::Stopped;
                    info!(?drain, "Graceful shutdown complete");
                    return CoordinatorExit::Terminated { signal, drain };
                }
                ControlSignal::Reload => match self.reloader.reload(&self.runtime) {
                    Ok(successor) => {
                        let successor_pid = successor.pid();
                        successor.monitor();

                        info!(successor_pid = ?successor_pid, "Successor started, retiring this process");
                        self.queue.deregister();
                        let drain = self.runtime.shutdown(self.drain_timeout).await;
                        self.state = CoordinatorState::Stopped;
                        info!(?drain, "Predecessor drained");
                        return CoordinatorExit::Restarted {
                            successor_pid,
                            drain,
                        };
                    }
                    Err(e) => {
                        self.failed_reloads += 1;
                        error!(
                            error = %e,
                            failed_reloads = self.failed_reloads,
                            "Graceful restart failed, continuing to serve"
                        );
                    }
                },
            }
        }

        warn!("Signal queue closed, coordinator detached");
        CoordinatorExit::Detached
    }
}
