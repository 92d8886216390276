//! Parameter RPC: version handshake, schema transfer, typed get/set.

use std::time::Duration;

use fathom_core::config::{ClientConfig, TargetSpeed};
use fathom_core::rpc::ParamValue;
use fathom_net::SonarClient;

use crate::infra::{client_config, start_server, TEST_SCHEMA, TEST_SCHEMA_ID};

#[tokio::test(flavor = "multi_thread")]
async fn connect_downloads_and_inflates_the_schema() {
    let server = start_server(TargetSpeed::Local).await;
    let client = SonarClient::connect(&client_config(&server)).await.expect("connect");

    assert_eq!(client.schema().id, TEST_SCHEMA_ID);
    assert_eq!(client.schema().data, TEST_SCHEMA);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn set_then_get_round_trips_every_type() {
    let server = start_server(TargetSpeed::Local).await;
    let client = SonarClient::connect(&client_config(&server)).await.expect("connect");

    let params: Vec<(&str, ParamValue)> = vec![
        ("/info/name", ParamValue::String("port-array".into())),
        ("/control/enable", ParamValue::Bool(true)),
        ("/control/range", ParamValue::F64(150.5)),
        ("/control/gain", ParamValue::I64(-3)),
        ("/control/offset", ParamValue::Null),
    ];
    assert!(client.set(&params).await);

    let names: Vec<&str> = params.iter().map(|(n, _)| *n).collect();
    let values = client.get(&names).await.expect("get");

    assert_eq!(values.len(), params.len());
    for ((_, sent), got) in params.iter().zip(&values) {
        assert_eq!(sent, got);
        assert_eq!(sent.type_tag(), got.type_tag());
    }

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unset_keys_read_back_as_null() {
    let server = start_server(TargetSpeed::Local).await;
    let client = SonarClient::connect(&client_config(&server)).await.expect("connect");

    let values = client.get(&["/never/written"]).await.expect("get");
    assert_eq!(values, vec![ParamValue::Null]);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connecting_to_a_dead_port_fails() {
    // Reserve a port, then close it so nothing answers there.
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let config = ClientConfig {
        host: "127.0.0.1".to_owned(),
        port,
        timeout_secs: 1.0,
        n_exec: 1,
        ..ClientConfig::default()
    };

    let started = tokio::time::Instant::now();
    let result = SonarClient::connect(&config).await;
    assert!(result.is_err());
    // One attempt with a one-second deadline; failure must not hang.
    assert!(started.elapsed() < Duration::from_secs(5));
}
