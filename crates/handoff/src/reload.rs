//! Successor spawning with listener descriptor passing.
//!
//! A reload duplicates the live listener descriptor, starts a new copy of
//! the executable with `--graceful`, and places the duplicate at fd 3 in the
//! child. The child is started, not awaited: adopting the socket is the
//! successor's job. The caller decides when the current runtime drains.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::error::ReloadError;
use crate::listener::INHERITED_FD;
use crate::runtime::ServerRuntime;

/// Flag telling the successor to adopt its listener from fd 3.
pub const GRACEFUL_FLAG: &str = "--graceful";

/// Knows how to start the next process image.
#[derive(Debug, Clone)]
pub struct Reloader {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Reloader {
    /// Spawn `program` as the successor. [`GRACEFUL_FLAG`] is always appended.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Add arguments passed before [`GRACEFUL_FLAG`].
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Re-run the current process with its own arguments.
    ///
    /// Uses `argv[0]` rather than the resolved executable path so a binary
    /// replaced on disk is picked up by the successor. Falls back to
    /// [`std::env::current_exe`] when `argv[0]` is missing.
    pub fn for_current_process() -> io::Result<Self> {
        match Self::from_argv(std::env::args_os()) {
            Some(reloader) => Ok(reloader),
            None => Ok(Self::new(std::env::current_exe()?)
                .args(std::env::args_os().skip(1).filter(|a| a != GRACEFUL_FLAG))),
        }
    }

    fn from_argv(argv: impl IntoIterator<Item = OsString>) -> Option<Self> {
        let mut argv = argv.into_iter();
        let program = argv.next().filter(|p| !p.is_empty())?;
        Some(Self::new(program).args(argv.filter(|a| a != GRACEFUL_FLAG)))
    }

    /// Program the successor runs.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Full successor argument list, flag included.
    pub fn successor_args(&self) -> impl Iterator<Item = &OsStr> {
        self.args
            .iter()
            .map(OsString::as_os_str)
            .chain(std::iter::once(OsStr::new(GRACEFUL_FLAG)))
    }

    /// Start a successor that inherits `runtime`'s listener.
    ///
    /// Returns once the child process exists. Fails without side effects on
    /// the runtime: the caller keeps serving if this returns an error.
    pub fn reload(&self, runtime: &ServerRuntime) -> Result<Successor, ReloadError> {
        let listener = runtime.inheritable_listener()?;
        let exported = listener.export().map_err(ReloadError::Export)?;
        drop(listener);

        let source_fd = exported.as_raw_fd();
        info!(
            program = %self.program.display(),
            args = ?self.successor_args().collect::<Vec<_>>(),
            source_fd,
            target_fd = INHERITED_FD,
            addr = %runtime.local_addr(),
            "Spawning successor"
        );

        let mut command = Command::new(&self.program);
        command
            .args(self.successor_args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: the closure runs between fork and exec and only calls dup2,
        // which is async-signal-safe.
        unsafe {
            command.pre_exec(move || attach_inherited(source_fd));
        }

        let child = command.spawn().map_err(|source| {
            error!(program = %self.program.display(), error = %source, "Failed to spawn successor");
            ReloadError::Spawn {
                program: self.program.clone(),
                source,
            }
        })?;

        // The child has its own copy at fd 3 now.
        drop(exported);

        info!(pid = ?child.id(), "Successor started");
        Ok(Successor { child })
    }
}

/// Place `source` at the inherited slot. dup2 leaves the target without
/// CLOEXEC, so it survives exec; the CLOEXEC source does not.
fn attach_inherited(source: RawFd) -> io::Result<()> {
    if unsafe { libc::dup2(source, INHERITED_FD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A started successor process.
#[derive(Debug)]
pub struct Successor {
    child: Child,
}

impl Successor {
    /// OS process id, if the child has not been reaped yet.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the successor to exit.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Log the successor's exit status from a background task.
    ///
    /// Only reports if the successor exits while this process is still alive,
    /// which usually means it failed to start serving.
    pub fn monitor(mut self) {
        let pid = self.pid();
        tokio::spawn(async move {
            match self.child.wait().await {
                Ok(status) if status.success() => info!(pid = ?pid, %status, "Successor exited"),
                Ok(status) => warn!(pid = ?pid, %status, "Successor exited with failure"),
                Err(e) => error!(pid = ?pid, error = %e, "Failed to wait for successor"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{acquire, AcquireMode};
    use crate::runtime::Phase;
    use std::time::Duration;

    async fn fresh_runtime() -> ServerRuntime {
        let handle = acquire(AcquireMode::Fresh, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        ServerRuntime::new(handle)
    }

    #[test]
    fn test_successor_args_end_with_graceful_flag() {
        let reloader = Reloader::new("/usr/bin/server").args(["--addr", ":9999"]);
        let args: Vec<&OsStr> = reloader.successor_args().collect();
        assert_eq!(args, ["--addr", ":9999", GRACEFUL_FLAG]);
        assert_eq!(reloader.program(), Path::new("/usr/bin/server"));
    }

    /// A process that was itself a successor does not pass the flag twice.
    #[test]
    fn test_from_argv_strips_previous_graceful_flag() {
        let argv = ["./server", "--addr", ":9999", GRACEFUL_FLAG].map(OsString::from);
        let reloader = Reloader::from_argv(argv).unwrap();
        assert_eq!(reloader.program(), Path::new("./server"));
        let args: Vec<&OsStr> = reloader.successor_args().collect();
        assert_eq!(args, ["--addr", ":9999", GRACEFUL_FLAG]);
    }

    #[test]
    fn test_from_argv_requires_program() {
        assert!(Reloader::from_argv(Vec::<OsString>::new()).is_none());
        assert!(Reloader::from_argv([OsString::new()]).is_none());
    }

    /// Spawn failure is reported and leaves the runtime serving.
    #[tokio::test]
    async fn test_spawn_failure_keeps_runtime_serving() {
        let runtime = fresh_runtime().await;
        let reloader = Reloader::new("/nonexistent/handoff-successor");

        let err = reloader.reload(&runtime).unwrap_err();
        assert!(matches!(err, ReloadError::Spawn { .. }));
        assert_eq!(runtime.phase(), Phase::Serving);
        assert!(runtime.inheritable_listener().is_ok());
    }

    #[tokio::test]
    async fn test_reload_after_shutdown_is_not_inheritable() {
        let runtime = fresh_runtime().await;
        runtime.shutdown(Duration::from_secs(1)).await;

        let err = Reloader::new("/bin/sh").reload(&runtime).unwrap_err();
        assert!(matches!(err, ReloadError::NotInheritable(_)));
    }

    /// The successor finds a socket at fd 3.
    #[tokio::test]
    async fn test_successor_receives_socket_at_fd_3() {
        let runtime = fresh_runtime().await;
        let reloader = Reloader::new("/bin/sh").args(["-c", "test -S /dev/fd/3"]);

        let mut successor = reloader.reload(&runtime).unwrap();
        assert!(successor.pid().is_some());

        let status = tokio::time::timeout(Duration::from_secs(10), successor.wait())
            .await
            .expect("successor did not exit")
            .unwrap();
        assert!(status.success(), "fd 3 was not a socket in the successor");

        // Reloading never touches the runtime's own state.
        assert_eq!(runtime.phase(), Phase::Serving);
    }

    #[test]
    fn test_attach_inherited_rejects_bad_source() {
        let err = attach_inherited(9999).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
