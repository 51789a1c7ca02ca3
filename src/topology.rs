// src/topology.rs

use tracing::info;

use crate::broker::BrokerChannel;
use crate::errors::Result;

/// Names of the broker entities queries arrive through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// What the broker actually declared. The queue name differs from the
/// requested one when the broker generates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyArtifacts {
    pub exchange_name: String,
    pub queue_name: String,
}

pub struct TopologyInitializer {
    topology: Topology,
}

impl TopologyInitializer {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    /// Declare the durable topic exchange, the durable queue and the binding
    /// between them. Safe to repeat.
    pub async fn declare<C: BrokerChannel>(&self, channel: &C) -> Result<TopologyArtifacts> {
        let Topology {
            exchange,
            queue,
            routing_key,
        } = &self.topology;

        channel.declare_exchange(exchange).await?;
        let queue_name = channel.declare_queue(queue).await?;
        channel.bind_queue(&queue_name, exchange, routing_key).await?;

        info!(
            exchange = %exchange,
            queue = %queue_name,
            routing_key = %routing_key,
            "created topics and queues"
        );

        Ok(TopologyArtifacts {
            exchange_name: exchange.clone(),
            queue_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Connector, MemoryBroker};
    use crate::errors::RelayError;

    fn queries() -> Topology {
        Topology {
            exchange: "queries".to_string(),
            queue: "fakedata.queries".to_string(),
            routing_key: "#".to_string(),
        }
    }

    #[tokio::test]
    async fn test_declares_exchange_queue_and_binding() {
        let broker = MemoryBroker::new();
        let connection = broker.dial().await.unwrap();
        let channel = broker.open_channel(&connection).await.unwrap();

        let artifacts = TopologyInitializer::new(queries())
            .declare(&channel)
            .await
            .unwrap();

        assert_eq!(artifacts.exchange_name, "queries");
        assert_eq!(artifacts.queue_name, "fakedata.queries");
        assert!(broker.has_exchange("queries"));
        assert!(broker.has_queue("fakedata.queries"));
        assert!(broker.has_binding("fakedata.queries", "queries", "#"));
    }

    #[tokio::test]
    async fn test_declaring_twice_is_idempotent() {
        let broker = MemoryBroker::new();
        let connection = broker.dial().await.unwrap();
        let channel = broker.open_channel(&connection).await.unwrap();
        let initializer = TopologyInitializer::new(queries());

        let first = initializer.declare(&channel).await.unwrap();
        let second = initializer.declare(&channel).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_broker_named_queue_is_reported() {
        let broker = MemoryBroker::new();
        let connection = broker.dial().await.unwrap();
        let channel = broker.open_channel(&connection).await.unwrap();
        let topology = Topology {
            queue: String::new(),
            ..queries()
        };

        let artifacts = TopologyInitializer::new(topology)
            .declare(&channel)
            .await
            .unwrap();

        assert!(artifacts.queue_name.starts_with("amq.gen-"));
        assert!(broker.has_binding(&artifacts.queue_name, "queries", "#"));
    }

    #[tokio::test]
    async fn test_closed_channel_fails_declaration() {
        let broker = MemoryBroker::new();
        let connection = broker.dial().await.unwrap();
        let channel = broker.open_channel(&connection).await.unwrap();
        broker.drop_connections();

        let err = TopologyInitializer::new(queries())
            .declare(&channel)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Topology { .. }));
        assert!(err.is_fatal());
    }
}
