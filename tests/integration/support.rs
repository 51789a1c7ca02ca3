use std::time::Duration;
use tokio::task::JoinHandle;

use fakedata_relay::broker::MemoryBroker;
use fakedata_relay::topology::Topology;
use fakedata_relay::{Payload, Relay, Result};

pub const EXCHANGE: &str = "queries";
pub const QUEUE: &str = "fakedata.queries";
pub const PAYLOAD: &[u8] = br#"[{"name":"Ada Lovelace","email":"ada@example.com"}]"#;
pub const WAIT: Duration = Duration::from_secs(2);

pub struct RunningRelay {
    pub broker: MemoryBroker,
    pub task: JoinHandle<Result<()>>,
}

impl Drop for RunningRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a relay on `broker` and wait until it consumes the query queue.
pub async fn start_relay(broker: MemoryBroker) -> RunningRelay {
    let topology = Topology {
        exchange: EXCHANGE.to_string(),
        queue: QUEUE.to_string(),
        routing_key: "#".to_string(),
    };
    let relay = Relay::new(
        broker.clone(),
        topology,
        Duration::from_millis(10),
        Payload::new(PAYLOAD.to_vec()),
    );
    let task = tokio::spawn(relay.run());

    assert!(
        broker.wait_for_consumers(QUEUE, 1, WAIT).await,
        "relay never started consuming"
    );
    RunningRelay { broker, task }
}
