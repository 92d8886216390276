//! Datagram RPC client — bounded-timeout calls with retry on timeout only.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};

use fathom_core::rpc::{Frame, PROC_CONNECT, PROC_DISCONNECT, RPC_MAX_FRAME};

#[derive(Debug, thiserror::Error)]
enum CallError {
    #[error("no reply within the deadline")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One RPC connection to a server. Calls are serialized; replies are matched
/// by sequence number, so a late reply from a timed-out attempt still
/// satisfies the retry that follows it.
pub(crate) struct RpcClient {
    socket: UdpSocket,
    session: u32,
    seq: AtomicU32,
    timeout: Duration,
    n_exec: u32,
    call_lock: tokio::sync::Mutex<()>,
}

impl RpcClient {
    /// Connect and obtain a session token. The whole exchange is attempted
    /// up to `n_exec` times; only timeouts are retried.
    pub async fn connect(host: &str, port: u16, timeout: Duration, n_exec: u32) -> Result<Self> {
        let server = lookup_host((host, port))
            .await
            .with_context(|| format!("cannot resolve '{host}:{port}'"))?
            .next()
            .with_context(|| format!("'{host}:{port}' resolved to nothing"))?;

        for attempt in 1..=n_exec {
            match Self::try_connect(server, timeout, n_exec).await {
                Ok(client) => return Ok(client),
                Err(e) if e.is::<CallTimedOut>() => {
                    tracing::warn!(%server, attempt, "connect attempt timed out");
                }
                Err(e) => return Err(e),
            }
        }
        bail!("no answer from '{host}:{port}' after {n_exec} attempts");
    }

    async fn try_connect(server: SocketAddr, timeout: Duration, n_exec: u32) -> Result<Self> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal address")
        } else {
            "[::]:0".parse().expect("literal address")
        };
        let socket = UdpSocket::bind(bind_addr).await.context("cannot bind rpc socket")?;
        socket.connect(server).await.context("cannot connect rpc socket")?;

        let request = Frame::request(0, 0, PROC_CONNECT);
        let bytes = request.encode().context("encode connect frame")?;
        socket.send(&bytes).await.context("send connect frame")?;

        let reply = match wait_reply(&socket, 0, PROC_CONNECT, timeout).await {
            Ok(reply) => reply,
            Err(CallError::Timeout) => return Err(CallTimedOut.into()),
            Err(CallError::Io(e)) => return Err(e).context("connect recv failed"),
        };

        if reply.session == 0 {
            bail!("server refused the connection");
        }

        Ok(Self {
            socket,
            session: reply.session,
            seq: AtomicU32::new(1),
            timeout,
            n_exec,
            call_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The transport's own endpoint, `udp://host:port`.
    pub fn self_address(&self) -> String {
        match self.socket.local_addr() {
            Ok(SocketAddr::V4(v4)) => format!("udp://{}:{}", v4.ip(), v4.port()),
            Ok(SocketAddr::V6(v6)) => format!("udp://[{}]:{}", v6.ip(), v6.port()),
            Err(_) => String::new(),
        }
    }

    /// Execute one procedure. Retries, on timeout only, up to `n_exec`
    /// attempts with the same sequence number.
    pub async fn call(&self, proc: u32, build: impl FnOnce(&mut Frame)) -> Result<Frame> {
        let _guard = self.call_lock.lock().await;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut request = Frame::request(self.session, seq, proc);
        build(&mut request);
        let bytes = request.encode().context("encode rpc frame")?;

        for attempt in 1..=self.n_exec {
            self.socket.send(&bytes).await.context("send rpc frame")?;

            match wait_reply(&self.socket, seq, proc, self.timeout).await {
                Ok(reply) => return Ok(reply),
                Err(CallError::Timeout) => {
                    tracing::warn!(proc, attempt, "rpc call timed out");
                }
                Err(CallError::Io(e)) => return Err(e).context("rpc recv failed"),
            }
        }
        bail!("rpc procedure {proc} timed out after {} attempts", self.n_exec);
    }

    /// Best-effort goodbye; the server also reaps us by idle timeout.
    pub async fn disconnect(&self) {
        let request = Frame::request(self.session, self.seq.fetch_add(1, Ordering::Relaxed), PROC_DISCONNECT);
        if let Ok(bytes) = request.encode() {
            let _ = self.socket.send(&bytes).await;
        }
    }
}

/// Marker for a timed-out connect attempt, so the retry loop can tell it
/// apart from hard transport failures.
#[derive(Debug, thiserror::Error)]
#[error("connect timed out")]
struct CallTimedOut;

async fn wait_reply(
    socket: &UdpSocket,
    seq: u32,
    proc: u32,
    timeout: Duration,
) -> std::result::Result<Frame, CallError> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; RPC_MAX_FRAME];

    loop {
        let received = match timeout_at(deadline, socket.recv(&mut buf)).await {
            Err(_) => return Err(CallError::Timeout),
            Ok(Err(e)) => return Err(CallError::Io(e)),
            Ok(Ok(n)) => n,
        };

        match Frame::decode(&buf[..received]) {
            Ok(frame) if frame.reply && frame.seq == seq && frame.proc == proc => {
                return Ok(frame);
            }
            Ok(frame) => {
                tracing::trace!(seq = frame.seq, proc = frame.proc, "stale reply ignored");
            }
            Err(e) => {
                tracing::trace!(error = %e, "undecodable datagram on rpc socket");
            }
        }
    }
}
