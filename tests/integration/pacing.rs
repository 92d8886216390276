//! Wall-clock pacing of the data plane.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use fathom_core::config::TargetSpeed;
use fathom_core::message::{monotonic_micros, DataMessage};
use fathom_net::SonarClient;

use crate::infra::{client_config, start_server, wait_until};

/// 40 MB at the 10 MB/s target must take right around four seconds, and the
/// receiver must still see every byte arrive in order.
#[tokio::test(flavor = "multi_thread")]
async fn ten_megabyte_target_paces_forty_megabytes_to_four_seconds() {
    let server = start_server(TargetSpeed::M10).await;
    let client = SonarClient::connect(&client_config(&server)).await.expect("connect");

    let received = Arc::new(Mutex::new(0usize));
    {
        let received = received.clone();
        client.subscribe(move |m| *received.lock().unwrap() += m.data.len());
    }
    assert!(client.set_master().await);

    let payload = Bytes::from(vec![0x5Au8; 1_000_000]);
    let started = tokio::time::Instant::now();
    for _ in 0..40 {
        let msg = DataMessage {
            time: monotonic_micros(),
            id: 1,
            type_tag: 1,
            rate: 0.0,
            data: payload.clone(),
        };
        server.send_data(&msg).await;
    }
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(3_800) && elapsed <= Duration::from_millis(4_400),
        "40 MB at 10 MB/s took {elapsed:?}"
    );

    // Loopback rarely drops, so the whole stream should land.
    assert!(
        wait_until(Duration::from_secs(3), || *received.lock().unwrap() >= 40_000_000).await,
        "received only {} bytes",
        received.lock().unwrap()
    );

    client.shutdown().await;
    server.shutdown().await;
}
