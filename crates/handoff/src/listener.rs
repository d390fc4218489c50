//! Listener acquisition: bind fresh, or adopt the socket a parent passed at fd 3.
//!
//! The inherited path never rebinds. It validates that fd 3 is an open,
//! listening stream socket and wraps it; anything else is a parent process
//! bug and fails startup.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::error::{AcquireError, InheritFailure};

/// Descriptor slot where a successor expects its inherited listener.
pub const INHERITED_FD: RawFd = 3;

/// Exported descriptors are duplicated at or above this number so they never
/// collide with the inherited slot or stdio while a child is being set up.
const EXPORT_FD_FLOOR: RawFd = 100;

/// How the process obtains its listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Bind a new socket to the configured address.
    Fresh,
    /// Adopt the socket passed by the parent process at [`INHERITED_FD`].
    Inherited,
}

impl AcquireMode {
    /// Map the `--graceful` command-line flag to a mode.
    pub fn from_graceful_flag(graceful: bool) -> Self {
        if graceful {
            AcquireMode::Inherited
        } else {
            AcquireMode::Fresh
        }
    }
}

/// A listening TCP socket plus where it came from.
#[derive(Debug)]
pub struct ListenHandle {
    listener: TcpListener,
    local_addr: SocketAddr,
    origin: AcquireMode,
}

/// Obtain the process listener.
///
/// In [`AcquireMode::Inherited`] the `addr` is only used to warn when the
/// inherited socket is bound somewhere else; the inherited address wins.
pub async fn acquire(mode: AcquireMode, addr: SocketAddr) -> Result<ListenHandle, AcquireError> {
    match mode {
        AcquireMode::Fresh => {
            info!(addr = %addr, "Listening on a new socket");
            ListenHandle::bind(addr).await
        }
        AcquireMode::Inherited => {
            info!(fd = INHERITED_FD, "Listening on inherited file descriptor");
            let handle = adopt_inherited(INHERITED_FD)?;
            if handle.local_addr != addr {
                warn!(
                    configured = %addr,
                    inherited = %handle.local_addr,
                    "Inherited listener is bound to a different address than configured"
                );
            }
            Ok(handle)
        }
    }
}

/// Adopt a descriptor slot this process does not own yet.
///
/// The descriptor is only taken over after validation, and only closed once
/// adoption succeeds; on any failure it is left open.
fn adopt_inherited(fd: RawFd) -> Result<ListenHandle, AcquireError> {
    validate_listener(fd).map_err(|reason| AcquireError::Inherit { fd, reason })?;

    // SAFETY: fd is open and a listening stream socket (validated above), and
    // the inherited slot is reserved for us by the parent process.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    ListenHandle::adopt(owned, AcquireMode::Inherited).map_err(|(owned, err)| {
        // Release without closing: the slot stays as the parent left it.
        let _ = owned.into_raw_fd();
        err
    })
}

impl ListenHandle {
    /// Bind a fresh listener.
    pub async fn bind(addr: SocketAddr) -> Result<Self, AcquireError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| AcquireError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| AcquireError::Bind { addr, source })?;

        info!(addr = %local_addr, fd = listener.as_raw_fd(), "Bound listener");
        Ok(Self {
            listener,
            local_addr,
            origin: AcquireMode::Fresh,
        })
    }

    /// Build a handle from a descriptor received from another process or
    /// from [`ListenHandle::export`].
    ///
    /// Fails outside a Tokio runtime. On failure `fd` is closed.
    pub fn from_inherited(fd: OwnedFd) -> Result<Self, AcquireError> {
        let raw = fd.as_raw_fd();
        validate_listener(raw).map_err(|reason| AcquireError::Inherit { fd: raw, reason })?;
        Self::adopt(fd, AcquireMode::Inherited).map_err(|(_, err)| err)
    }

    /// Wrap a validated listening descriptor. On failure the descriptor is
    /// handed back, still open.
    fn adopt(fd: OwnedFd, origin: AcquireMode) -> Result<Self, (OwnedFd, AcquireError)> {
        let raw = fd.as_raw_fd();
        let failed = |fd: OwnedFd, e: io::Error| {
            let err = AcquireError::Inherit {
                fd: raw,
                reason: InheritFailure::Adopt(e),
            };
            (fd, err)
        };

        if let Err(e) = tokio::runtime::Handle::try_current() {
            return Err(failed(fd, io::Error::other(e)));
        }

        // Inherited descriptors arrive without CLOEXEC. Restore it so unrelated
        // children never pick up a copy of the listener.
        if let Err(e) = set_cloexec(raw) {
            return Err(failed(fd, e));
        }

        // The reactor gets a duplicate, so a failed registration never closes `fd`.
        let std_listener = std::net::TcpListener::from(fd);
        let registered = std_listener
            .set_nonblocking(true)
            .and_then(|()| std_listener.try_clone())
            .and_then(TcpListener::from_std)
            .and_then(|listener| Ok((listener.local_addr()?, listener)));

        match registered {
            Ok((local_addr, listener)) => {
                info!(
                    fd = listener.as_raw_fd(),
                    inherited_fd = raw,
                    addr = %local_addr,
                    "Inherited listener from parent process"
                );
                Ok(Self {
                    listener,
                    local_addr,
                    origin,
                })
            }
            Err(e) => Err(failed(std_listener.into(), e)),
        }
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether this handle was bound fresh or inherited.
    pub fn origin(&self) -> AcquireMode {
        self.origin
    }

    /// Accept the next pending connection.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Duplicate the socket descriptor for handing to another process.
    ///
    /// The duplicate has CLOEXEC set; the spawner decides where (and whether)
    /// it survives into a child.
    pub fn export(&self) -> io::Result<OwnedFd> {
        let fd = unsafe {
            libc::fcntl(
                self.listener.as_raw_fd(),
                libc::F_DUPFD_CLOEXEC,
                EXPORT_FD_FLOOR,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl AsRawFd for ListenHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl AsFd for ListenHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

/// Check that `fd` is an open, listening stream socket.
fn validate_listener(fd: RawFd) -> Result<(), InheritFailure> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(InheritFailure::NotOpen(io::Error::last_os_error()));
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return Err(InheritFailure::NotSocket);
    }

    let kind = socket_option(fd, libc::SO_TYPE).map_err(InheritFailure::Adopt)?;
    if kind != libc::SOCK_STREAM {
        return Err(InheritFailure::NotStream);
    }

    let listening = socket_option(fd, libc::SO_ACCEPTCONN).map_err(InheritFailure::Adopt)?;
    if listening == 0 {
        return Err(InheritFailure::NotListening);
    }

    Ok(())
}

fn socket_option(fd: RawFd, name: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
