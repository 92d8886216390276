//! Sonar transport client.
//!
//! Construction dials the RPC transport, checks the wire version, downloads
//! the parameter schema, and opens the data receive path: a receiver task
//! that parks validated datagrams in pool slabs, and an emitter task that
//! reassembles them into messages for the subscribers. Data only flows after
//! [`SonarClient::set_master`] succeeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use flate2::read::ZlibDecoder;
use std::io::Read as _;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use fathom_core::config::ClientConfig;
use fathom_core::message::MessageView;
use fathom_core::params::SchemaData;
use fathom_core::pool::SlicePool;
use fathom_core::rpc::{
    ParamValue, MAX_DATA_PORT, MIN_DATA_PORT, PROC_GET, PROC_GET_SCHEMA, PROC_SET,
    PROC_SET_MASTER, PROC_VERSION, SLOT_MAGIC, SLOT_MASTER_HOST, SLOT_MASTER_PORT,
    SLOT_SCHEMA_DATA, SLOT_SCHEMA_ID, SLOT_SCHEMA_SIZE, SLOT_VERSION, STATUS_OK,
};
use fathom_core::wire::{self, PacketView, PACKET_MAX_SIZE};

use crate::endpoint;
use crate::queue::{PacketQueue, Pick, QueuedPacket};
use crate::reassembly::Reassembler;
use crate::rpc_client::RpcClient;

const WORKER_WAIT: Duration = Duration::from_millis(100);

type Subscriber = Box<dyn Fn(MessageView<'_>) + Send + Sync>;

pub struct SonarClient {
    rpc: Arc<RpcClient>,
    schema: SchemaData,
    receiver_host: String,
    receiver_port: u16,
    shared: Arc<ClientShared>,
    tasks: Vec<JoinHandle<()>>,
}

struct ClientShared {
    pool: SlicePool,
    queue: PacketQueue,
    subscribers: RwLock<Vec<Subscriber>>,
    terminate: AtomicBool,
    n_buffers: usize,
}

impl SonarClient {
    /// Dial a sonar server and bring up the receive path.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let rpc = Arc::new(
            RpcClient::connect(&config.host, config.port, config.timeout(), config.n_exec)
                .await
                .with_context(|| format!("cannot reach sonar at {}:{}", config.host, config.port))?,
        );

        // The server must speak exactly our wire revision.
        let reply = rpc.call(PROC_VERSION, |_| {}).await.context("version exchange failed")?;
        let magic = reply.get_u32(SLOT_MAGIC).context("version reply lacks magic")?;
        let version = reply.get_u32(SLOT_VERSION).context("version reply lacks version")?;
        if magic != wire::MAGIC || version != wire::WIRE_VERSION {
            bail!("server speaks magic 0x{magic:08x} version {version}, not ours");
        }

        let schema = fetch_schema(&rpc).await.context("schema download failed")?;

        // Receive socket on our RPC-facing address, random high port.
        let receiver_host = endpoint::host_of(&rpc.self_address())
            .context("cannot derive receiver host from rpc endpoint")?;
        let (socket, receiver_port) = bind_receiver(&receiver_host)
            .await
            .context("cannot bind data receive socket")?;

        let shared = Arc::new(ClientShared {
            pool: SlicePool::new(config.n_buffers, PACKET_MAX_SIZE),
            queue: PacketQueue::new(),
            subscribers: RwLock::new(Vec::new()),
            terminate: AtomicBool::new(false),
            n_buffers: config.n_buffers,
        });

        let tasks = vec![
            tokio::spawn(receiver_loop(shared.clone(), socket)),
            tokio::spawn(emitter_loop(shared.clone())),
        ];

        tracing::info!(
            host = %receiver_host,
            port = receiver_port,
            "sonar client connected"
        );

        Ok(Self { rpc, schema, receiver_host, receiver_port, shared, tasks })
    }

    /// The downloaded parameter schema.
    pub fn schema(&self) -> &SchemaData {
        &self.schema
    }

    /// Where the server will send data once we take the master role.
    pub fn receiver_endpoint(&self) -> (&str, u16) {
        (&self.receiver_host, self.receiver_port)
    }

    /// Register a message subscriber. Callbacks run on the emitter task and
    /// must not retain the borrowed payload.
    pub fn subscribe(&self, subscriber: impl Fn(MessageView<'_>) + Send + Sync + 'static) {
        self.shared
            .subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(Box::new(subscriber));
    }

    /// Claim the master role, advertising our receive endpoint. Returns
    /// false when another client holds the role or the call failed.
    pub async fn set_master(&self) -> bool {
        let host = self.receiver_host.clone();
        let port = self.receiver_port;
        let reply = self
            .rpc
            .call(PROC_SET_MASTER, |frame| {
                frame.set_str(SLOT_MASTER_HOST, &host);
                frame.set_u32(SLOT_MASTER_PORT, port as u32);
            })
            .await;

        match reply {
            Ok(reply) if reply.status() == STATUS_OK => true,
            Ok(_) => {
                tracing::warn!("set_master refused by server");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "set_master failed");
                false
            }
        }
    }

    /// Write parameters. False on any failure, including store rejection.
    pub async fn set(&self, params: &[(&str, ParamValue)]) -> bool {
        if params.is_empty() {
            return false;
        }
        let reply = self
            .rpc
            .call(PROC_SET, |frame| {
                for (i, (name, value)) in params.iter().enumerate() {
                    if frame.set_param(i, name, value).is_err() {
                        tracing::warn!("too many parameters in one set call");
                        return;
                    }
                }
            })
            .await;

        match reply {
            Ok(reply) if reply.status() == STATUS_OK => true,
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "set failed");
                false
            }
        }
    }

    /// Read parameters; unset keys come back as [`ParamValue::Null`].
    pub async fn get(&self, names: &[&str]) -> Option<Vec<ParamValue>> {
        if names.is_empty() {
            return None;
        }
        let reply = self
            .rpc
            .call(PROC_GET, |frame| {
                for (i, name) in names.iter().enumerate() {
                    if frame.set_param(i, name, &ParamValue::Null).is_err() {
                        tracing::warn!("too many parameters in one get call");
                        return;
                    }
                }
            })
            .await;

        let reply = match reply {
            Ok(reply) if reply.status() == STATUS_OK => reply,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "get failed");
                return None;
            }
        };

        let mut values = Vec::with_capacity(names.len());
        for i in 0..names.len() {
            match reply.param_value(i) {
                Ok(value) => values.push(value),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed get reply");
                    return None;
                }
            }
        }
        Some(values)
    }

    /// Stop the workers, say goodbye to the server, and release the sockets.
    pub async fn shutdown(mut self) {
        self.shared.terminate.store(true, Ordering::Release);
        self.shared.queue.wake();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.rpc.disconnect().await;
    }
}

impl Drop for SonarClient {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::Release);
        self.shared.queue.wake();
    }
}

// ── Construction helpers ──────────────────────────────────────────────────────

async fn fetch_schema(rpc: &RpcClient) -> Result<SchemaData> {
    let reply = rpc.call(PROC_GET_SCHEMA, |_| {}).await?;
    if reply.status() != STATUS_OK {
        bail!("server reported schema failure");
    }

    let compressed = reply.get_bytes(SLOT_SCHEMA_DATA).context("schema reply lacks data")?;
    let size = reply.get_u32(SLOT_SCHEMA_SIZE).context("schema reply lacks size")? as usize;
    let id = reply.get_str(SLOT_SCHEMA_ID).context("schema reply lacks id")?;

    let mut data = Vec::with_capacity(size);
    ZlibDecoder::new(compressed).read_to_end(&mut data).context("schema inflate failed")?;
    if data.len() != size {
        bail!("schema inflated to {} bytes, header said {size}", data.len());
    }

    Ok(SchemaData {
        data: String::from_utf8(data).context("schema is not UTF-8")?,
        id: id.to_owned(),
    })
}

/// Bind the data receive socket on a random port in the advertised range,
/// retrying while the picked port is taken.
async fn bind_receiver(host: &str) -> Result<(UdpSocket, u16)> {
    use rand::Rng as _;

    loop {
        let port = rand::thread_rng().gen_range(MIN_DATA_PORT..MAX_DATA_PORT);
        match UdpSocket::bind((host, port)).await {
            Ok(socket) => return Ok((socket, port)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e).with_context(|| format!("cannot bind {host}:{port}")),
        }
    }
}

// ── Workers ───────────────────────────────────────────────────────────────────

/// Pulls datagrams off the socket as fast as possible and parks them in the
/// queue. Structural validation happens here; CRC checking is deferred to
/// the emitter so a slow checksum never backs up the socket.
async fn receiver_loop(shared: Arc<ClientShared>, socket: UdpSocket) {
    let mut scratch = vec![0u8; PACKET_MAX_SIZE];
    let mut held: Option<Box<[u8]>> = None;

    while !shared.terminate.load(Ordering::Acquire) {
        if held.is_none() {
            held = shared.pool.pop();
            if held.is_none() {
                // Pool exhausted: the datagram still has to leave the OS
                // buffer, so read it into scratch and drop it.
                tracing::warn!("receive pool exhausted, dropping datagram");
                if let Ok(Ok((n, _))) = timeout(WORKER_WAIT, socket.recv_from(&mut scratch)).await {
                    tracing::trace!(len = n, "datagram dropped");
                }
                continue;
            }
        }

        let slab = held.as_mut().expect("slab just acquired");
        let received = match timeout(WORKER_WAIT, socket.recv_from(&mut slab[..])).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "data socket recv failed");
                continue;
            }
            Ok(Ok((n, _))) => n,
        };

        let index = match PacketView::parse(&slab[..received]) {
            Ok(view) => view.index,
            Err(e) => {
                tracing::warn!(error = %e, "malformed data packet dropped");
                continue;
            }
        };

        shared.queue.push(QueuedPacket {
            slab: held.take().expect("slab present"),
            len: received,
            index,
        });
    }

    if let Some(slab) = held.take() {
        shared.pool.push(slab);
    }
    for packet in shared.queue.drain() {
        shared.pool.push(packet.slab);
    }
}

/// Orders packets, reassembles messages, publishes them, recycles slabs.
async fn emitter_loop(shared: Arc<ClientShared>) {
    let mut reasm = Reassembler::new();
    let wait_threshold = shared.n_buffers / 4;

    let publish = |view: MessageView<'_>| {
        for subscriber in shared.subscribers.read().expect("subscriber lock poisoned").iter() {
            subscriber(view);
        }
    };

    while !shared.terminate.load(Ordering::Acquire) {
        // Bound the latency of permanent gaps.
        reasm.flush_expired(&mut |view| publish(view));

        if shared.queue.is_empty() {
            let _ = timeout(WORKER_WAIT, shared.queue.pushed()).await;
            if shared.queue.is_empty() {
                continue;
            }
        }

        // Process at most one batch before the next flush sweep.
        let batch = shared.queue.len();
        for _ in 0..batch {
            if shared.terminate.load(Ordering::Acquire) {
                break;
            }

            match shared.queue.pick(reasm.next_index(), wait_threshold) {
                Pick::InOrder(packet) => {
                    reasm.process(&packet.slab[..packet.len], &mut |view| publish(view));
                    shared.pool.push(packet.slab);
                }
                Pick::Skipped(packet) => {
                    tracing::warn!(
                        lost = reasm.next_index(),
                        resumed_at = packet.index,
                        "packet lost, reselecting"
                    );
                    reasm.process(&packet.slab[..packet.len], &mut |view| publish(view));
                    shared.pool.push(packet.slab);
                }
                Pick::Wait => {
                    let _ = timeout(WORKER_WAIT, shared.queue.pushed()).await;
                    break;
                }
                Pick::Empty => break,
            }
        }
    }
}
