//! Shared fixtures: a server on an OS-assigned loopback port and client
//! configs pointed at it.

use std::sync::Arc;
use std::time::Duration;

use fathom_core::config::{ClientConfig, ServerConfig, TargetSpeed};
use fathom_core::params::MemoryStore;
use fathom_net::SonarServer;

pub const TEST_SCHEMA_ID: &str = "fathom-test";
pub const TEST_SCHEMA: &str = r#"<schema id="fathom-test">
  <key id="/info/name" type="string"/>
  <key id="/control/enable" type="boolean"/>
  <key id="/control/range" type="double"/>
</schema>
"#;

pub async fn start_server(target_speed: TargetSpeed) -> SonarServer {
    let store = Arc::new(MemoryStore::new(TEST_SCHEMA, TEST_SCHEMA_ID));
    let config = ServerConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        target_speed,
        ..ServerConfig::default()
    };
    SonarServer::start(store, &config).await.expect("server start")
}

pub fn client_config(server: &SonarServer) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".to_owned(),
        port: server.local_addr().expect("server addr").port(),
        ..ClientConfig::default()
    }
}

/// Poll `probe` every 20 ms until it returns true or `deadline` elapses.
pub async fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    probe()
}
