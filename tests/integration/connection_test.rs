use std::path::Path;
use std::time::Duration;

use fakedata_relay::broker::{AmqpConnector, BrokerChannel, Connector};
use fakedata_relay::topology::TopologyInitializer;
use fakedata_relay::{Payload, RelayConfig};

fn load_test_config() -> RelayConfig {
    RelayConfig::from_file(Path::new("tests/fixtures/fakedata.json"))
        .expect("Failed to read test config file")
}

#[test]
fn test_fixture_config_is_valid() {
    let config = load_test_config();
    assert!(config.validate().is_ok());
    assert_eq!(config.retry_interval(), Duration::from_secs(1));

    let payload = Payload::load(&config.filename).expect("fixture payload");
    assert!(!payload.is_empty());
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_connection_establishes() {
    let config = load_test_config();
    let connector = AmqpConnector::new(config.amqp_uri(), config.endpoint());

    let connection = connector.dial().await.expect("broker reachable");
    let channel = connector
        .open_channel(&connection)
        .await
        .expect("channel opens");
    assert!(channel.is_open());

    let artifacts = TopologyInitializer::new(config.topology())
        .declare(&channel)
        .await
        .expect("topology declared");
    assert_eq!(artifacts.queue_name, "fakedata.smoke");

    channel
        .publish("", &artifacts.queue_name, b"smoke")
        .await
        .expect("publish confirmed");

    // RabbitMQ answers with 404 NOT_FOUND and closes the channel
    let missing = format!("fakedata.missing.{}", std::process::id());
    let result = channel.publish(&missing, "nowhere", b"smoke").await;
    assert!(result.is_err(), "publish to a missing exchange must fail");

    connector.close(connection).await;
}
