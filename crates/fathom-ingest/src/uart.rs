//! NMEA over a serial line.
//!
//! A receiver task reads the port byte by byte, frames sentences into blocks
//! and parks them in pool slabs; an emitter task publishes the blocks. The
//! receiver owns the port exclusively. Reconfiguration never locks across
//! I/O: [`UartIngest::set_device`] raises the `configure` flag, waits for
//! the receiver to park, swaps the device, and releases it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

use fathom_core::config::UartMode;
use fathom_core::message::monotonic_micros;
use fathom_core::pool::SlicePool;

use crate::sentence::{NmeaFramer, MAX_MSG_SIZE};
use crate::{BlockSubscriber, BlockView, PooledBlock, INGEST_BUFFERS};

const WORKER_WAIT: Duration = Duration::from_millis(100);
const PARK_POLL: Duration = Duration::from_millis(10);

/// Without one accepted sentence for this long, auto mode tries the next
/// baud rate.
const AUTO_BAUD_PATIENCE: Duration = Duration::from_secs(2);

pub struct UartIngest {
    shared: Arc<UartShared>,
    tasks: Vec<JoinHandle<()>>,
}

struct UartShared {
    name: String,
    terminate: AtomicBool,
    configure: AtomicBool,
    parked: AtomicBool,
    skip_broken: AtomicBool,
    /// Swapped only while the receiver is parked; the receiver adopts the
    /// stream when it resumes.
    device: Mutex<DeviceSlot>,
    pool: SlicePool,
    subscribers: RwLock<Vec<BlockSubscriber>>,
}

#[derive(Default)]
struct DeviceSlot {
    stream: Option<SerialStream>,
    mode: UartMode,
}

impl UartIngest {
    /// Start the workers with no device attached; use
    /// [`UartIngest::set_device`] to open a port.
    pub fn new(name: &str, skip_broken: bool) -> Self {
        let shared = Arc::new(UartShared {
            name: name.to_owned(),
            terminate: AtomicBool::new(false),
            configure: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            skip_broken: AtomicBool::new(skip_broken),
            device: Mutex::new(DeviceSlot::default()),
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

    /// Register a block subscriber. Callbacks run on the emitter task.
    pub fn subscribe(&self, subscriber: impl Fn(BlockView<'_>) + Send + Sync + 'static) {
        self.shared
            .subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(Box::new(subscriber));
    }

    /// Toggle dropping of sentences with a bad checksum.
    pub fn set_skip_broken(&self, skip_broken: bool) {
        self.shared.skip_broken.store(skip_broken, Ordering::Release);
    }

    /// Attach a device, change its mode, or detach with `None`/`Disabled`.
    ///
    /// Parks the receiver, swaps the device slot, and resumes. On any open
    /// failure the slot is left empty and the error is surfaced.
    pub async fn set_device(&self, path: Option<&str>, mode: UartMode) -> Result<()> {
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

        let result = self.install_device(path, mode);

        shared.parked.store(false, Ordering::Release);
        shared.configure.store(false, Ordering::Release);
        result
    }

    fn install_device(&self, path: Option<&str>, mode: UartMode) -> Result<()> {
        let mut slot = self.shared.device.lock().expect("device lock poisoned");
        slot.stream = None;
        slot.mode = UartMode::Disabled;

        let path = match (path, mode) {
            (None, _) | (_, UartMode::Disabled) => return Ok(()),
            (Some(path), _) => path,
        };

        // Auto search starts at the head of the cycle; the receiver walks on
        // from there.
        let initial_baud = mode.baud().unwrap_or(4_800);
        let stream = tokio_serial::new(path, initial_baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .with_context(|| format!("cannot open uart device '{path}'"))?;

        if mode == UartMode::Auto {
            self.shared.skip_broken.store(true, Ordering::Release);
        }

        slot.stream = Some(stream);
        slot.mode = mode;
        tracing::info!(port = %self.shared.name, path, ?mode, "uart device attached");
        Ok(())
    }

    pub async fn shutdown(mut self) {
        self.shared.terminate.store(true, Ordering::Release);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for UartIngest {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::Release);
    }
}

/// The next rate in the auto-baud cycle.
fn next_auto_baud(current: UartMode) -> UartMode {
    let cycle = UartMode::AUTO_CYCLE;
    match cycle.iter().position(|m| *m == current) {
        Some(pos) if pos + 1 < cycle.len() => cycle[pos + 1],
        _ => cycle[0],
    }
}

async fn receiver_loop(shared: Arc<UartShared>, tx: mpsc::Sender<PooledBlock>) {
    let mut framer = NmeaFramer::new(shared.skip_broken.load(Ordering::Acquire));
    let mut stream: Option<SerialStream> = None;
    let mut mode = UartMode::Disabled;
    let mut search_baud = UartMode::Disabled;
    let mut last_good = Instant::now();

    while !shared.terminate.load(Ordering::Acquire) {
        if shared.configure.load(Ordering::Acquire) {
            // Close the port and park until reconfiguration finishes.
            stream = None;
            shared.parked.store(true, Ordering::Release);
            tokio::time::sleep(WORKER_WAIT).await;
            continue;
        }

        if stream.is_none() {
            let (new_stream, new_mode) = {
                let mut slot = shared.device.lock().expect("device lock poisoned");
                (slot.stream.take(), slot.mode)
            };
            stream = new_stream;
            mode = new_mode;

            if stream.is_none() {
                tokio::time::sleep(WORKER_WAIT).await;
                continue;
            }
            search_baud = UartMode::Disabled;
            last_good = Instant::now();
        }

        let port = stream.as_mut().expect("stream present");

        if mode == UartMode::Auto && last_good.elapsed() > AUTO_BAUD_PATIENCE {
            search_baud = next_auto_baud(search_baud);
            let baud = search_baud.baud().expect("cycle holds fixed rates");
            if let Err(e) = port.set_baud_rate(baud) {
                tracing::warn!(port = %shared.name, baud, error = %e, "baud switch failed");
            } else {
                tracing::debug!(port = %shared.name, baud, "auto-baud trying next rate");
            }
            let _ = port.clear(ClearBuffer::Input);
            last_good = Instant::now();
        }

        let mut byte = [0u8; 1];
        let received = match timeout(WORKER_WAIT, port.read(&mut byte)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                tracing::warn!(port = %shared.name, error = %e, "uart read failed");
                continue;
            }
            Ok(Ok(n)) => n,
        };
        if received == 0 {
            continue;
        }

        framer.set_skip_broken(shared.skip_broken.load(Ordering::Acquire));
        let out = framer.push_byte(byte[0], monotonic_micros());
        if out.accepted {
            last_good = Instant::now();
        }

        if let Some(block) = out.block {
            let Some(mut slab) = shared.pool.pop() else {
                tracing::warn!(port = %shared.name, "block pool exhausted, block dropped");
                continue;
            };
            slab[..block.data.len()].copy_from_slice(&block.data);
            let queued = PooledBlock { slab, len: block.data.len(), time: block.time };
            if let Err(e) = tx.try_send(queued) {
                let queued = match e {
                    mpsc::error::TrySendError::Full(b) => b,
                    mpsc::error::TrySendError::Closed(b) => b,
                };
                shared.pool.push(queued.slab);
            }
        }
    }
}

async fn emitter_loop(shared: Arc<UartShared>, mut rx: mpsc::Receiver<PooledBlock>) {
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
