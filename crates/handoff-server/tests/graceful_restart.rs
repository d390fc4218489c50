//! End-to-End Restart Tests
//!
//! These tests drive the real `handoff-server` binary:
//! - `SIGUSR2` hands the listening socket to a successor without a refused request
//! - `SIGTERM` drains and exits cleanly, refusing new clients while it drains
//! - a second `SIGTERM` during the drain kills the process
//! - `--graceful` without an inherited socket fails startup
//!
//! Run with: `cargo test -p handoff-server --test graceful_restart`

use std::io;
use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

const HELLO_BODY: &str = "hello world233333";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Kills every tracked pid on drop so a failed assertion never leaks servers.
#[derive(Default)]
struct Reaper {
    pids: Vec<u32>,
}

impl Reaper {
    fn track(&mut self, pid: u32) {
        self.pids.push(pid);
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        for pid in &self.pids {
            unsafe { libc::kill(*pid as libc::pid_t, libc::SIGKILL) };
        }
    }
}

struct HelloResponse {
    pid: u32,
    body: String,
}

fn free_addr() -> SocketAddr {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap()
}

fn send_signal(pid: u32, signal: libc::c_int) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    assert_eq!(rc, 0, "kill({pid}, {signal}) failed: {}", io::Error::last_os_error());
}

fn spawn_server(args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_handoff-server"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT")
        .env("HANDOFF_LOG_LEVEL", "warn")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn handoff-server")
}

async fn get_hello(addr: SocketAddr) -> io::Result<HelloResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;

    let text = String::from_utf8_lossy(&raw);
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, format!("{msg}: {text:?}"));

    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| invalid("incomplete response"))?;
    if !head.starts_with("HTTP/1.1 200") {
        return Err(invalid("unexpected status"));
    }
    let pid = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("x-handoff-pid"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .ok_or_else(|| invalid("missing pid header"))?;

    Ok(HelloResponse {
        pid,
        body: body.to_string(),
    })
}

async fn wait_for_hello(addr: SocketAddr) -> HelloResponse {
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    loop {
        match get_hello(addr).await {
            Ok(response) => return response,
            Err(e) if Instant::now() >= deadline => {
                panic!("server at {addr} never answered: {e}")
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

/// Open a connection that never sends a request, keeping the drain busy.
async fn hold_idle_connection(addr: SocketAddr) -> TcpStream {
    let idle = TcpStream::connect(addr).await.unwrap();
    // Give the server time to accept it before any signal arrives.
    tokio::time::sleep(Duration::from_millis(200)).await;
    idle
}

async fn wait_for_refused(addr: SocketAddr) {
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    while TcpStream::connect(addr).await.is_ok() {
        assert!(Instant::now() < deadline, "{addr} still accepting connections");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_sigusr2_hands_listener_to_successor() {
    let addr = free_addr();
    let addr_arg = addr.to_string();
    let mut reaper = Reaper::default();

    let mut server = spawn_server(&["--addr", &addr_arg, "--drain-timeout-secs", "5"]);
    let first_pid = server.id().expect("server has a pid");

    let first = wait_for_hello(addr).await;
    assert_eq!(first.body, HELLO_BODY);
    assert_eq!(first.pid, first_pid);

    send_signal(first_pid, libc::SIGUSR2);

    // Every request during the handoff must be answered, by either process.
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    let successor_pid = loop {
        let response = get_hello(addr)
            .await
            .expect("request failed during handoff");
        assert_eq!(response.body, HELLO_BODY);
        if response.pid != first_pid {
            break response.pid;
        }
        assert!(Instant::now() < deadline, "successor never answered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    reaper.track(successor_pid);

    let status = tokio::time::timeout(DEFAULT_TIMEOUT, server.wait())
        .await
        .expect("predecessor did not exit within its drain deadline")
        .unwrap();
    assert!(status.success(), "predecessor exited with {status}");

    let after = get_hello(addr).await.expect("successor stopped answering");
    assert_eq!(after.pid, successor_pid);
    assert_eq!(after.body, HELLO_BODY);

    send_signal(successor_pid, libc::SIGTERM);
    wait_for_refused(addr).await;
}

#[tokio::test]
async fn test_sigterm_drains_and_exits_cleanly() {
    let addr = free_addr();
    let addr_arg = addr.to_string();

    let mut server = spawn_server(&["--addr", &addr_arg, "--drain-timeout-secs", "5"]);
    let pid = server.id().expect("server has a pid");

    let response = wait_for_hello(addr).await;
    assert_eq!(response.pid, pid);

    send_signal(pid, libc::SIGTERM);

    let status = tokio::time::timeout(DEFAULT_TIMEOUT, server.wait())
        .await
        .expect("server did not exit after SIGTERM")
        .unwrap();
    assert!(status.success(), "server exited with {status}");
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_sigterm_refuses_new_connections_while_draining() {
    let addr = free_addr();
    let addr_arg = addr.to_string();

    let mut server = spawn_server(&["--addr", &addr_arg, "--drain-timeout-secs", "20"]);
    let pid = server.id().expect("server has a pid");
    wait_for_hello(addr).await;
    let _idle = hold_idle_connection(addr).await;

    send_signal(pid, libc::SIGTERM);

    let started = Instant::now();
    let refused = loop {
        match TcpStream::connect(addr).await {
            Ok(_) => {
                assert!(
                    started.elapsed() < Duration::from_secs(2),
                    "listener stayed open during drain"
                );
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => break e,
        }
    };
    assert_eq!(refused.kind(), io::ErrorKind::ConnectionRefused);
    assert!(
        server.try_wait().unwrap().is_none(),
        "server exited before the idle connection drained"
    );

    let status = tokio::time::timeout(DEFAULT_TIMEOUT, server.wait())
        .await
        .expect("server did not finish draining")
        .unwrap();
    assert!(status.success(), "server exited with {status}");
}

/// The first SIGTERM drains; a second one is not swallowed by the drain.
#[tokio::test]
async fn test_second_sigterm_during_drain_kills_process() {
    let addr = free_addr();
    let addr_arg = addr.to_string();

    let mut server = spawn_server(&["--addr", &addr_arg, "--drain-timeout-secs", "20"]);
    let pid = server.id().expect("server has a pid");
    wait_for_hello(addr).await;
    let _idle = hold_idle_connection(addr).await;

    send_signal(pid, libc::SIGTERM);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.try_wait().unwrap().is_none(), "first SIGTERM did not drain");

    send_signal(pid, libc::SIGTERM);
    let status = tokio::time::timeout(Duration::from_secs(2), server.wait())
        .await
        .expect("second SIGTERM was ignored while draining")
        .unwrap();
    assert_eq!(status.signal(), Some(libc::SIGTERM));
}

/// Inherited mode with nothing listening at fd 3 is fatal and binds nothing.
#[tokio::test]
async fn test_graceful_without_inherited_socket_fails_startup() {
    let addr = free_addr();
    let addr_arg = addr.to_string();

    let mut server = spawn_server(&["--graceful", "--addr", &addr_arg]);

    let status = tokio::time::timeout(DEFAULT_TIMEOUT, server.wait())
        .await
        .expect("server did not exit")
        .unwrap();
    assert!(!status.success());
    assert!(TcpStream::connect(addr).await.is_err());
}
