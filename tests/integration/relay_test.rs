use std::time::Duration;
use tokio::time::sleep;

use fakedata_relay::broker::memory::Outcome;
use fakedata_relay::broker::MemoryBroker;

use crate::support::{start_relay, EXCHANGE, PAYLOAD, WAIT};

#[tokio::test]
async fn test_query_is_answered_at_reply_to_address() {
    let relay = start_relay(MemoryBroker::new()).await;

    let tags = relay.broker.publish_query(
        EXCHANGE,
        "users.list",
        Some("replies/fromfakedata"),
        b"{\"count\":1}",
    );
    assert_eq!(tags.len(), 1);

    let published = relay.broker.wait_for_published(1, WAIT).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "replies");
    assert_eq!(published[0].routing_key, "fromfakedata");
    assert_eq!(published[0].content_type, "text/plain");
    assert_eq!(published[0].body, PAYLOAD);

    assert_eq!(relay.broker.wait_for_outcome(tags[0], WAIT).await, Some(Outcome::Acked));
}

#[tokio::test]
async fn test_bare_reply_to_uses_default_exchange() {
    let relay = start_relay(MemoryBroker::new()).await;
    relay
        .broker
        .publish_query(EXCHANGE, "anything", Some("amq.gen-callback"), b"query");

    let published = relay.broker.wait_for_published(1, WAIT).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "");
    assert_eq!(published[0].routing_key, "amq.gen-callback");
}

#[tokio::test]
async fn test_every_query_gets_its_own_reply() {
    let relay = start_relay(MemoryBroker::new()).await;
    for key in ["first", "second", "third"] {
        relay
            .broker
            .publish_query(EXCHANGE, "q", Some(&format!("replies/{}", key)), b"query");
    }

    let published = relay.broker.wait_for_published(3, WAIT).await;
    let keys: Vec<&str> = published.iter().map(|m| m.routing_key.as_str()).collect();
    assert_eq!(keys, ["first", "second", "third"]);
}

#[tokio::test]
async fn test_malformed_reply_to_is_rejected_and_never_answered() {
    let relay = start_relay(MemoryBroker::new()).await;

    let malformed = relay
        .broker
        .publish_query(EXCHANGE, "q", Some("too/many/parts"), b"query");
    let missing = relay.broker.publish_query(EXCHANGE, "q", None, b"query");

    for tag in malformed.into_iter().chain(missing) {
        assert_eq!(
            relay.broker.wait_for_outcome(tag, WAIT).await,
            Some(Outcome::Rejected { requeue: false })
        );
    }

    // a later well-formed query still goes through
    relay
        .broker
        .publish_query(EXCHANGE, "q", Some("replies/ok"), b"query");
    let published = relay.broker.wait_for_published(1, WAIT).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(published.len(), 1);
    assert_eq!(relay.broker.published().len(), 1);
    assert_eq!(published[0].routing_key, "ok");
}
