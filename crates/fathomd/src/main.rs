//! fathomd — sonar transport daemon.
//!
//! Wires a parameter store behind the RPC server and forwards NMEA ingest
//! blocks onto the data plane as opaque messages. Without a device backend
//! the parameter store is an in-memory tree, which is enough to exercise
//! clients end to end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;

use fathom_core::config::{FathomConfig, UartMode};
use fathom_core::message::DataMessage;
use fathom_core::params::MemoryStore;
use fathom_ingest::{BlockView, UartIngest, UdpIngest};
use fathom_net::SonarServer;

/// Type tag stamped on NMEA blocks forwarded to the data plane. Consumers
/// treat the payload as CRLF-separated sentence text.
const NMEA_DATA_TYPE: u32 = 1;

const DEFAULT_SCHEMA_ID: &str = "fathom-sonar";
const DEFAULT_SCHEMA: &str = r#"<schema id="fathom-sonar">
  <key id="/info/name" type="string"/>
  <key id="/info/serial" type="string"/>
  <key id="/control/enable" type="boolean"/>
  <key id="/control/range" type="double"/>
  <key id="/control/tvg/gain" type="double"/>
  <key id="/sensors/nmea/enable" type="boolean"/>
</schema>
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=debug fathomd
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config().context("configuration rejected")?;
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        target_speed = ?config.server.target_speed,
        "fathomd starting"
    );

    let store = Arc::new(MemoryStore::new(DEFAULT_SCHEMA, DEFAULT_SCHEMA_ID));
    let server = Arc::new(
        SonarServer::start(store, &config.server)
            .await
            .context("cannot start sonar server")?,
    );

    // NMEA blocks cross from the ingest callbacks (synchronous) to the data
    // plane (async) through this channel; the forwarder task drains it.
    let (block_tx, mut block_rx) = tokio::sync::mpsc::channel::<DataMessage>(64);
    let forwarder = {
        let server = server.clone();
        tokio::spawn(async move {
            while let Some(msg) = block_rx.recv().await {
                server.send_data(&msg).await;
            }
        })
    };

    let uart = start_uart(&config, &block_tx).await?;
    let udp = start_udp(&config, &block_tx).await?;
    drop(block_tx);

    tokio::signal::ctrl_c().await.context("signal wait failed")?;
    tracing::info!("shutting down");

    if let Some(uart) = uart {
        uart.shutdown().await;
    }
    if let Some(udp) = udp {
        udp.shutdown().await;
    }
    let _ = forwarder.await;

    if let Some(server) = Arc::into_inner(server) {
        server.shutdown().await;
    }
    Ok(())
}

fn load_config() -> Result<FathomConfig> {
    let mut args = std::env::args().skip(1);
    let mut path: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                path = Some(PathBuf::from(
                    args.next().context("--config needs a path")?,
                ));
            }
            other => anyhow::bail!("unknown argument '{other}' (only --config <path>)"),
        }
    }

    let config = match path {
        Some(path) => FathomConfig::load_from(path)?,
        None => FathomConfig::load()?,
    };
    Ok(config)
}

fn forward_block(tx: &tokio::sync::mpsc::Sender<DataMessage>, source_id: u32, block: BlockView<'_>) {
    let msg = DataMessage {
        time: block.time,
        id: source_id,
        type_tag: NMEA_DATA_TYPE,
        rate: 0.0,
        data: Bytes::copy_from_slice(block.data),
    };
    if tx.try_send(msg).is_err() {
        tracing::debug!(source_id, "data plane backlog, nmea block dropped");
    }
}

async fn start_uart(
    config: &FathomConfig,
    tx: &tokio::sync::mpsc::Sender<DataMessage>,
) -> Result<Option<UartIngest>> {
    let uart_cfg = &config.nmea.uart;
    if uart_cfg.device.is_empty() || uart_cfg.mode == UartMode::Disabled {
        return Ok(None);
    }

    let ingest = UartIngest::new(&uart_cfg.name, uart_cfg.skip_broken);
    ingest
        .set_device(Some(&uart_cfg.device), uart_cfg.mode)
        .await
        .with_context(|| format!("uart ingest on '{}' failed", uart_cfg.device))?;

    let tx = tx.clone();
    let source_id = uart_cfg.source_id;
    ingest.subscribe(move |block| forward_block(&tx, source_id, block));

    Ok(Some(ingest))
}

async fn start_udp(
    config: &FathomConfig,
    tx: &tokio::sync::mpsc::Sender<DataMessage>,
) -> Result<Option<UdpIngest>> {
    let udp_cfg = &config.nmea.udp;
    if udp_cfg.bind.is_empty() || udp_cfg.port < 1024 {
        return Ok(None);
    }

    let ingest = UdpIngest::new(&udp_cfg.name);
    ingest
        .set_address(Some(&udp_cfg.bind), udp_cfg.port)
        .await
        .with_context(|| format!("nmea udp ingest on {}:{} failed", udp_cfg.bind, udp_cfg.port))?;

    let tx = tx.clone();
    let source_id = udp_cfg.source_id;
    ingest.subscribe(move |block| forward_block(&tx, source_id, block));

    Ok(Some(ingest))
}
