//! Sonar transport server.
//!
//! One dispatch task answers RPC procedures, one reaper task expires idle
//! sessions, and the data path splits sonar messages into packets and sends
//! them to the single master client under the rate pacer. There is no send
//! queue: a message that cannot be delivered is dropped.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write as _;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use fathom_core::config::{ServerConfig, TargetSpeed};
use fathom_core::message::DataMessage;
use fathom_core::params::ParamStore;
use fathom_core::rpc::{
    Frame, ParamValue, MAX_DATA_PORT, MAX_PARAMS, MIN_DATA_PORT, PROC_CONNECT, PROC_DISCONNECT,
    PROC_GET, PROC_GET_SCHEMA, PROC_SET, PROC_SET_MASTER, PROC_VERSION, RPC_MAX_FRAME,
    SLOT_MAGIC, SLOT_MASTER_HOST, SLOT_MASTER_PORT, SLOT_SCHEMA_DATA, SLOT_SCHEMA_ID,
    SLOT_SCHEMA_SIZE, SLOT_STATUS, SLOT_VERSION, STATUS_FAIL, STATUS_OK,
};
use fathom_core::wire::{self, encode_packet, message_parts, MAX_PART, PACKET_MAX_SIZE};

use crate::pacer::RatePacer;
use crate::session::{allocate_token, new_session_table, SessionInfo, SessionTable};

pub struct SonarServer {
    inner: Arc<ServerInner>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

struct ServerInner {
    store: Arc<dyn ParamStore>,
    rpc_socket: Arc<UdpSocket>,
    data_socket: UdpSocket,
    sessions: SessionTable,
    /// Session token of the master client, 0 when unbound.
    master: AtomicU32,
    /// Where data packets go while a master is bound.
    sink: RwLock<Option<SocketAddr>>,
    /// Transport sequence number of the next data packet.
    index: AtomicU32,
    send_state: tokio::sync::Mutex<SendState>,
    idle_timeout: Duration,
}

struct SendState {
    pacer: RatePacer,
    buf: Vec<u8>,
}

impl SonarServer {
    /// Bind the RPC and data sockets and start the dispatch and reaper tasks.
    pub async fn start(store: Arc<dyn ParamStore>, config: &ServerConfig) -> Result<Self> {
        config.validate()?;

        let rpc_socket = UdpSocket::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("cannot bind rpc socket on {}:{}", config.host, config.port))?;
        let data_socket = UdpSocket::bind((config.host.as_str(), 0))
            .await
            .context("cannot bind data socket")?;

        let local = rpc_socket.local_addr().context("rpc socket has no local address")?;
        tracing::info!(%local, "sonar server listening");

        let inner = Arc::new(ServerInner {
            store,
            rpc_socket: Arc::new(rpc_socket),
            data_socket,
            sessions: new_session_table(),
            master: AtomicU32::new(0),
            sink: RwLock::new(None),
            index: AtomicU32::new(0),
            send_state: tokio::sync::Mutex::new(SendState {
                pacer: RatePacer::new(config.target_speed),
                buf: vec![0u8; PACKET_MAX_SIZE],
            }),
            idle_timeout: config.idle_timeout(),
        });

        let (shutdown, _) = broadcast::channel(1);
        let tasks = vec![
            tokio::spawn(dispatch_loop(inner.clone(), shutdown.subscribe())),
            tokio::spawn(reaper_loop(inner.clone(), shutdown.subscribe())),
        ];

        Ok(Self { inner, shutdown, tasks })
    }

    /// The RPC endpoint clients should dial.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.rpc_socket.local_addr().context("rpc socket has no local address")
    }

    pub fn has_master(&self) -> bool {
        self.inner.master.load(Ordering::Acquire) != 0
    }

    pub async fn set_target_speed(&self, speed: TargetSpeed) {
        self.inner.send_state.lock().await.pacer.set_target(speed);
    }

    /// Push one sonar message to the master client.
    ///
    /// Splits the payload into packets, stamps each with the next transport
    /// index, and paces the sends. Without a bound master, and on any send
    /// error, the message (or its remainder) is dropped.
    pub async fn send_data(&self, msg: &DataMessage) {
        let inner = &*self.inner;
        if inner.master.load(Ordering::Acquire) == 0 {
            return;
        }
        let sink = match *inner.sink.read().expect("sink lock poisoned") {
            Some(addr) => addr,
            None => return,
        };

        let mut state = inner.send_state.lock().await;
        let SendState { pacer, buf } = &mut *state;
        pacer.start_burst();

        for (offset, part_size) in message_parts(msg.data.len()) {
            let index = inner.index.load(Ordering::Relaxed);
            let len = encode_packet(buf, index, msg, offset, part_size);
            inner.index.store(index.wrapping_add(1), Ordering::Relaxed);

            if let Err(e) = inner.data_socket.send_to(&buf[..len], sink).await {
                tracing::debug!(error = %e, %sink, "data send failed, message dropped");
                return;
            }
            pacer.sent(len).await;
        }
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for SonarServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

async fn dispatch_loop(inner: Arc<ServerInner>, mut shutdown: broadcast::Receiver<()>) {
    let mut buf = vec![0u8; RPC_MAX_FRAME];

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("rpc dispatch shutting down");
                return;
            }

            result = inner.rpc_socket.recv_from(&mut buf) => {
                let (len, peer) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "rpc recv_from failed");
                        continue;
                    }
                };

                let request = match Frame::decode(&buf[..len]) {
                    Ok(frame) if !frame.reply => frame,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "undecodable rpc datagram");
                        continue;
                    }
                };

                if let Some(reply) = handle_request(&inner, &request, peer) {
                    send_reply(&inner, &reply, peer).await;
                }
            }
        }
    }
}

fn handle_request(inner: &Arc<ServerInner>, request: &Frame, peer: SocketAddr) -> Option<Frame> {
    if request.proc == PROC_CONNECT {
        let token = allocate_token(&inner.sessions);
        inner.sessions.insert(token, SessionInfo { addr: peer, last_seen: Instant::now() });
        tracing::info!(%peer, session = token, "client connected");

        let mut reply = Frame::reply_to(request);
        reply.session = token;
        return Some(reply);
    }

    // Everything else requires a live session.
    match inner.sessions.get_mut(&request.session) {
        Some(mut session) => session.last_seen = Instant::now(),
        None => {
            tracing::debug!(%peer, session = request.session, "call on unknown session");
            return None;
        }
    }

    match request.proc {
        PROC_DISCONNECT => {
            inner.sessions.remove(&request.session);
            release_master(inner, request.session);
            tracing::info!(session = request.session, "client disconnected");
            None
        }
        PROC_VERSION => {
            let mut reply = Frame::reply_to(request);
            reply.set_u32(SLOT_MAGIC, wire::MAGIC);
            reply.set_u32(SLOT_VERSION, wire::WIRE_VERSION);
            Some(reply)
        }
        PROC_GET_SCHEMA => Some(handle_get_schema(inner, request)),
        PROC_SET_MASTER => Some(handle_set_master(inner, request)),
        PROC_SET => Some(handle_set(inner, request)),
        PROC_GET => Some(handle_get(inner, request)),
        other => {
            tracing::warn!(proc = other, "unknown rpc procedure");
            let mut reply = Frame::reply_to(request);
            reply.set_u32(SLOT_STATUS, STATUS_FAIL);
            Some(reply)
        }
    }
}

fn handle_get_schema(inner: &Arc<ServerInner>, request: &Frame) -> Frame {
    let mut reply = Frame::reply_to(request);
    let schema = inner.store.schema();

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(9));
    let compressed = encoder
        .write_all(schema.data.as_bytes())
        .and_then(|_| encoder.finish());

    match compressed {
        Ok(compressed) if compressed.len() <= MAX_PART => {
            reply.set_bytes(SLOT_SCHEMA_DATA, compressed);
            reply.set_u32(SLOT_SCHEMA_SIZE, schema.data.len() as u32);
            reply.set_str(SLOT_SCHEMA_ID, &schema.id);
            reply.set_u32(SLOT_STATUS, STATUS_OK);
        }
        Ok(compressed) => {
            tracing::warn!(len = compressed.len(), "compressed schema exceeds one part");
            reply.set_u32(SLOT_STATUS, STATUS_FAIL);
        }
        Err(e) => {
            tracing::warn!(error = %e, "schema compression failed");
            reply.set_u32(SLOT_STATUS, STATUS_FAIL);
        }
    }
    reply
}

fn handle_set_master(inner: &Arc<ServerInner>, request: &Frame) -> Frame {
    let mut reply = Frame::reply_to(request);
    reply.set_u32(SLOT_STATUS, STATUS_FAIL);

    let Some(host) = request.get_str(SLOT_MASTER_HOST) else {
        tracing::warn!("set_master without host");
        return reply;
    };
    let Some(port) = request.get_u32(SLOT_MASTER_PORT) else {
        tracing::warn!("set_master without port");
        return reply;
    };
    if port < MIN_DATA_PORT as u32 || port > MAX_DATA_PORT as u32 {
        tracing::warn!(port, "set_master port out of range");
        return reply;
    }

    // Exactly one master at a time.
    if inner
        .master
        .compare_exchange(0, request.session, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        tracing::info!(session = request.session, "set_master refused, role taken");
        return reply;
    }

    let ip: IpAddr = match host.parse() {
        Ok(ip) => ip,
        Err(_) => {
            // Roll the role back; a sink we cannot address is no master.
            inner.master.store(0, Ordering::Release);
            tracing::warn!(host, "set_master host unparseable");
            return reply;
        }
    };

    *inner.sink.write().expect("sink lock poisoned") = Some(SocketAddr::new(ip, port as u16));
    inner.index.store(0, Ordering::Relaxed);
    tracing::info!(session = request.session, %ip, port, "master bound");

    reply.set_u32(SLOT_STATUS, STATUS_OK);
    reply
}

fn handle_set(inner: &Arc<ServerInner>, request: &Frame) -> Frame {
    let mut reply = Frame::reply_to(request);

    let mut params: Vec<(String, ParamValue)> = Vec::new();
    for i in 0..MAX_PARAMS {
        let Some(name) = request.param_name(i) else { break };
        match request.param_value(i) {
            Ok(value) => params.push((name.to_owned(), value)),
            Err(e) => {
                tracing::warn!(param = name, error = %e, "malformed set parameter");
                reply.set_u32(SLOT_STATUS, STATUS_FAIL);
                return reply;
            }
        }
    }

    if params.is_empty() {
        tracing::warn!("set call without parameters");
        reply.set_u32(SLOT_STATUS, STATUS_FAIL);
        return reply;
    }

    let status = match inner.store.set(&params) {
        Ok(()) => STATUS_OK,
        Err(e) => {
            tracing::warn!(error = %e, "parameter store rejected set");
            STATUS_FAIL
        }
    };
    reply.set_u32(SLOT_STATUS, status);
    reply
}

fn handle_get(inner: &Arc<ServerInner>, request: &Frame) -> Frame {
    let mut reply = Frame::reply_to(request);

    let mut names: Vec<String> = Vec::new();
    for i in 0..MAX_PARAMS {
        let Some(name) = request.param_name(i) else { break };
        names.push(name.to_owned());
    }

    if names.is_empty() {
        tracing::warn!("get call without names");
        reply.set_u32(SLOT_STATUS, STATUS_FAIL);
        return reply;
    }

    match inner.store.get(&names) {
        Ok(values) => {
            for (i, value) in values.iter().enumerate() {
                if reply.set_param_value(i, value).is_err() {
                    reply.set_u32(SLOT_STATUS, STATUS_FAIL);
                    return reply;
                }
            }
            reply.set_u32(SLOT_STATUS, STATUS_OK);
        }
        Err(e) => {
            tracing::warn!(error = %e, "parameter store rejected get");
            reply.set_u32(SLOT_STATUS, STATUS_FAIL);
        }
    }
    reply
}

async fn send_reply(inner: &Arc<ServerInner>, reply: &Frame, peer: SocketAddr) {
    match reply.encode() {
        Ok(bytes) => {
            if let Err(e) = inner.rpc_socket.send_to(&bytes, peer).await {
                tracing::warn!(%peer, error = %e, "rpc reply send failed");
            }
        }
        Err(e) => tracing::warn!(%peer, error = %e, "rpc reply encode failed"),
    }
}

/// Clear the master role if `session` holds it.
fn release_master(inner: &Arc<ServerInner>, session: u32) {
    if inner
        .master
        .compare_exchange(session, 0, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        *inner.sink.write().expect("sink lock poisoned") = None;
        tracing::info!(session, "master released");
    }
}

// ── Session reaper ────────────────────────────────────────────────────────────

async fn reaper_loop(inner: Arc<ServerInner>, mut shutdown: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,

            _ = tick.tick() => {
                let expired: Vec<u32> = inner
                    .sessions
                    .iter()
                    .filter(|entry| entry.last_seen.elapsed() > inner.idle_timeout)
                    .map(|entry| *entry.key())
                    .collect();

                for token in expired {
                    inner.sessions.remove(&token);
                    release_master(&inner, token);
                    tracing::info!(session = token, "idle session dropped");
                }
            }
        }
    }
}
