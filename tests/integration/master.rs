//! Master role exclusivity and release.

use std::time::Duration;

use fathom_core::config::TargetSpeed;
use fathom_net::SonarClient;

use crate::infra::{client_config, start_server, wait_until};

#[tokio::test(flavor = "multi_thread")]
async fn only_one_master_and_the_role_survives_its_holder_only() {
    let server = start_server(TargetSpeed::Local).await;
    let config = client_config(&server);

    let first = SonarClient::connect(&config).await.expect("first connect");
    let second = SonarClient::connect(&config).await.expect("second connect");

    assert!(first.set_master().await, "unclaimed role must be granted");
    assert!(!second.set_master().await, "second claim must be refused");
    assert!(server.has_master());

    // A non-master disconnecting changes nothing.
    second.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.has_master());

    // The master disconnecting releases the role.
    first.shutdown().await;
    assert!(
        wait_until(Duration::from_secs(2), || !server.has_master()).await,
        "master not released after disconnect"
    );

    // And the next claimant gets it.
    let third = SonarClient::connect(&config).await.expect("third connect");
    assert!(third.set_master().await);

    third.shutdown().await;
    server.shutdown().await;
}
