use std::time::Duration;
use tokio::time::sleep;

use fakedata_relay::broker::memory::Outcome;
use fakedata_relay::broker::MemoryBroker;
use fakedata_relay::RelayError;

use crate::support::{start_relay, EXCHANGE, QUEUE, WAIT};

#[tokio::test]
async fn test_relay_waits_for_the_broker_at_startup() {
    let broker = MemoryBroker::new();
    broker.fail_next_dials(3);

    let relay = start_relay(broker).await;
    assert_eq!(relay.broker.dial_attempts(), 4);
    assert!(relay.broker.has_binding(QUEUE, EXCHANGE, "#"));
}

#[tokio::test]
async fn test_relay_recovers_from_a_dropped_connection() {
    let relay = start_relay(MemoryBroker::new()).await;

    relay.broker.fail_next_dials(1);
    relay.broker.drop_connections();
    assert_eq!(relay.broker.open_connections(), 0);

    assert!(relay.broker.wait_for_consumers(QUEUE, 1, WAIT).await);
    assert_eq!(relay.broker.open_connections(), 1);
    assert_eq!(relay.broker.dial_attempts(), 3);

    relay
        .broker
        .publish_query(EXCHANGE, "q", Some("replies/after"), b"query");
    let published = relay.broker.wait_for_published(1, WAIT).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "after");
    assert_eq!(published[0].connection_id, 2);
    assert!(!relay.task.is_finished());
}

#[tokio::test]
async fn test_failed_reply_is_published_exactly_once_after_retry() {
    let relay = start_relay(MemoryBroker::new()).await;
    relay.broker.fail_next_publishes(1);

    relay
        .broker
        .publish_query(EXCHANGE, "q", Some("replies/retried"), b"query");

    let published = relay.broker.wait_for_published(1, WAIT).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "replies");
    assert_eq!(published[0].routing_key, "retried");

    sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.broker.published().len(), 1);
    assert!(!relay.task.is_finished());
}

#[tokio::test]
async fn test_queries_stay_unacked_while_replies_keep_failing() {
    let relay = start_relay(MemoryBroker::new()).await;
    relay.broker.fail_next_publishes(u32::MAX);

    let tags: Vec<u64> = (0..5)
        .flat_map(|n| {
            relay
                .broker
                .publish_query(EXCHANGE, "q", Some(&format!("replies/{}", n)), b"query")
        })
        .collect();
    assert_eq!(tags.len(), 5);

    sleep(Duration::from_millis(100)).await;
    let acked = tags
        .iter()
        .filter(|tag| relay.broker.outcome(**tag) == Some(Outcome::Acked))
        .count();

    // one reply being retried and one waiting in the handoff at most
    assert!(acked <= 2, "acked {} queries with no reply published", acked);
    assert!(relay.broker.published().is_empty());
    assert!(!relay.task.is_finished());
}

#[tokio::test]
async fn test_repeated_connection_loss_is_survived() {
    let relay = start_relay(MemoryBroker::new()).await;

    for round in 0..3 {
        relay.broker.drop_connections();
        assert!(relay.broker.wait_for_consumers(QUEUE, 1, WAIT).await);
        relay
            .broker
            .publish_query(EXCHANGE, "q", Some(&format!("replies/{}", round)), b"query");
        assert_eq!(relay.broker.wait_for_published(round + 1, WAIT).await.len(), round + 1);
    }
    assert_eq!(relay.broker.open_connections(), 1);
}

#[tokio::test]
async fn test_channel_refusal_stops_the_relay() {
    let broker = MemoryBroker::new();
    broker.fail_channel_open(true);

    let relay = fakedata_relay::Relay::new(
        broker,
        fakedata_relay::topology::Topology {
            exchange: EXCHANGE.to_string(),
            queue: QUEUE.to_string(),
            routing_key: "#".to_string(),
        },
        Duration::from_millis(10),
        fakedata_relay::Payload::new(b"x".to_vec()),
    );

    let err = tokio::time::timeout(WAIT, relay.run()).await.unwrap().unwrap_err();
    assert!(matches!(err, RelayError::ChannelOpen(_)));
    assert!(err.is_fatal());
}
