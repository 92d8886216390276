//! NMEA over UDP.
//!
//! Every datagram is a candidate block: if at least one embedded sentence
//! passes its checksum, the whole datagram is published with its receive
//! timestamp; otherwise it is dropped and the slab returns to the pool.
//! Reconfiguration uses the same park/resume handoff as the UART engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use fathom_core::message::monotonic_micros;
use fathom_core::pool::SlicePool;

use crate::sentence::{block_has_valid_sentence, MAX_MSG_SIZE};
use crate::{BlockSubscriber, BlockView, PooledBlock, INGEST_BUFFERS};

const WORKER_WAIT: Duration = Duration::from_millis(100);
const PARK_POLL: Duration = Duration::from_millis(10);

/// UDP ports below this are never listened on; they disable the port.
const MIN_LISTEN_PORT: u16 = 1024;

pub struct UdpIngest {
    shared: Arc<UdpShared>,
    tasks: Vec<JoinHandle<()>>,
}

struct UdpShared {
    name: String,
    terminate: AtomicBool,
    configure: AtomicBool,
    parked: AtomicBool,
    /// Swapped only while the receiver is parked.
    socket: Mutex<Option<UdpSocket>>,
    pool: SlicePool,
    subscribers: RwLock<Vec<BlockSubscriber>>,
}

impl UdpIngest {
    /// Start the workers unbound; use [`UdpIngest::set_address`] to listen.
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(UdpShared {
            name: name.to_owned(),
            terminate: AtomicBool::new(false),
            configure: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            socket: Mutex::new(None),
            pool: SlicePool::new(INGEST_BUFFERS, MAX_MSG_SIZE),
            subscribers: RwLock::new(Vec::new()),
        });

        let (tx, rx) = mpsc::channel(INGEST_BUFFERS);
        let tasks = vec![
            tokio::spawn(receiver_loop(shared.clone(), tx)),
            tokio::spawn(emitter_loop(shared.clone(), rx)),
        ];

        Self { shared, tasks }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn subscribe(&self, subscriber: impl Fn(BlockView<'_>) + Send + Sync + 'static) {
        self.shared
            .subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(Box::new(subscriber));
    }

    /// Bind to `ip:port`, or detach with `None` / a port below 1024.
    pub async fn set_address(&self, ip: Option<&str>, port: u16) -> Result<()> {
        let shared = &self.shared;

        while shared
            .configure
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tokio::time::sleep(PARK_POLL).await;
        }
        while !shared.parked.load(Ordering::Acquire) {
            tokio::time::sleep(PARK_POLL).await;
        }

        let result = self.install_socket(ip, port);

        shared.parked.store(false, Ordering::Release);
        shared.configure.store(false, Ordering::Release);
        result
    }

    fn install_socket(&self, ip: Option<&str>, port: u16) -> Result<()> {
        let mut slot = self.shared.socket.lock().expect("socket lock poisoned");
        *slot = None;

        let ip = match ip {
            Some(ip) if port >= MIN_LISTEN_PORT => ip,
            _ => return Ok(()),
        };

        let socket = std::net::UdpSocket::bind((ip, port))
            .with_context(|| format!("cannot bind nmea udp socket on {ip}:{port}"))?;
        socket.set_nonblocking(true).context("cannot make nmea udp socket nonblocking")?;
        let socket = UdpSocket::from_std(socket).context("cannot adopt nmea udp socket")?;

        tracing::info!(port = %self.shared.name, ip, udp_port = port, "nmea udp bound");
        *slot = Some(socket);
        Ok(())
    }

    pub async fn shutdown(mut self) {
        self.shared.terminate.store(true, Ordering::Release);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for UdpIngest {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::Release);
    }
}

async fn receiver_loop(shared: Arc<UdpShared>, tx: mpsc::Sender<PooledBlock>) {
    let mut socket: Option<UdpSocket> = None;
    let mut scratch = vec![0u8; MAX_MSG_SIZE];
    let mut held: Option<Box<[u8]>> = None;

    while !shared.terminate.load(Ordering::Acquire) {
        if shared.configure.load(Ordering::Acquire) {
            socket = None;
            shared.parked.store(true, Ordering::Release);
            tokio::time::sleep(WORKER_WAIT).await;
            continue;
        }

        if socket.is_none() {
            socket = shared.socket.lock().expect("socket lock poisoned").take();
            if socket.is_none() {
                tokio::time::sleep(WORKER_WAIT).await;
                continue;
            }
        }
        let sock = socket.as_ref().expect("socket present");

        if held.is_none() {
            held = shared.pool.pop();
            if held.is_none() {
                tracing::warn!(port = %shared.name, "block pool exhausted, datagram dropped");
                let _ = timeout(WORKER_WAIT, sock.recv_from(&mut scratch)).await;
                continue;
            }
        }

        let slab = held.as_mut().expect("slab just acquired");
        let received = match timeout(WORKER_WAIT, sock.recv_from(&mut slab[..])).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                tracing::warn!(port = %shared.name, error = %e, "nmea udp recv failed");
                continue;
            }
            Ok(Ok((n, _))) => n,
        };
        if received == 0 {
            continue;
        }

        if !block_has_valid_sentence(&slab[..received]) {
            tracing::debug!(port = %shared.name, len = received, "datagram without valid nmea");
            continue;
        }

        let queued = PooledBlock {
            slab: held.take().expect("slab present"),
            len: received,
            time: monotonic_micros(),
        };
        if let Err(e) = tx.try_send(queued) {
            let queued = match e {
                mpsc::error::TrySendError::Full(b) => b,
                mpsc::error::TrySendError::Closed(b) => b,
            };
            shared.pool.push(queued.slab);
        }
    }

    if let Some(slab) = held.take() {
        shared.pool.push(slab);
    }
}

async fn emitter_loop(shared: Arc<UdpShared>, mut rx: mpsc::Receiver<PooledBlock>) {
    while !shared.terminate.load(Ordering::Acquire) {
        let block = match timeout(WORKER_WAIT, rx.recv()).await {
            Err(_) => continue,
            Ok(None) => return,
            Ok(Some(block)) => block,
        };

        let view = BlockView {
            time: block.time,
            port: &shared.name,
            data: &block.slab[..block.len],
        };
        for subscriber in shared.subscribers.read().expect("subscriber lock poisoned").iter() {
            subscriber(view);
        }

        shared.pool.push(block.slab);
    }
}
