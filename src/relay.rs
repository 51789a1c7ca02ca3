// src/relay.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{error, info};

use crate::broker::Connector;
use crate::config::RelayConfig;
use crate::consumer::ConsumerLoop;
use crate::errors::{RelayError, Result};
use crate::payload::Payload;
use crate::publisher::PublisherLoop;
use crate::retry::{FixedInterval, Immediate};
use crate::supervisor::{ConnectionSupervisor, ReconnectReason};
use crate::topology::{Topology, TopologyInitializer};

/// Wires the supervisor, the consumer loop and the publisher loop together.
pub struct Relay<K: Connector> {
    connector: K,
    topology: Topology,
    retry_interval: Duration,
    payload: Payload,
}

impl<K: Connector> Relay<K> {
    pub fn new(connector: K, topology: Topology, retry_interval: Duration, payload: Payload) -> Self {
        Self {
            connector,
            topology,
            retry_interval,
            payload,
        }
    }

    pub fn from_config(connector: K, config: &RelayConfig, payload: Payload) -> Self {
        Self::new(connector, config.topology(), config.retry_interval(), payload)
    }

    /// Connect, declare the topology and serve queries.
    ///
    /// Never returns `Ok` under normal operation; any task ending is reported
    /// as an error.
    pub async fn run(self) -> Result<()> {
        let (supervisor, reconnect, mut channels) = ConnectionSupervisor::new(
            self.connector,
            Arc::new(FixedInterval::new(self.retry_interval)),
        );
        // taken before the first lease so both loops start from generation 1
        let consumer_channels = channels.clone();
        let publisher_channels = channels.clone();

        reconnect.request(0, ReconnectReason::Startup);
        let mut supervisor_task = tokio::spawn(supervisor.run());

        let first = tokio::select! {
            lease = channels.next_channel() => lease.ok(),
            stopped = &mut supervisor_task => {
                return Err(task_result("connection supervisor", stopped));
            }
        };
        drop(channels);
        let lease = match first {
            Some(lease) => lease,
            // the supervisor dropped the handoff; its own result says why
            None => return Err(task_result("connection supervisor", supervisor_task.await)),
        };

        let artifacts = TopologyInitializer::new(self.topology)
            .declare(lease.channel())
            .await?;

        let (publisher, responses) = PublisherLoop::new(
            self.payload,
            publisher_channels,
            reconnect.clone(),
            Arc::new(Immediate),
        );
        let consumer = ConsumerLoop::new(artifacts.queue_name, consumer_channels, reconnect, responses);

        let mut publisher_task = tokio::spawn(publisher.run());
        let mut consumer_task = tokio::spawn(consumer.run());
        info!("fakedata relay is running");

        let err = tokio::select! {
            stopped = &mut supervisor_task => task_result("connection supervisor", stopped),
            stopped = &mut consumer_task => task_result("consumer", stopped),
            stopped = &mut publisher_task => task_result("publisher", stopped),
        };

        consumer_task.abort();
        publisher_task.abort();
        supervisor_task.abort();

        error!(error = %err, "relay stopped");
        Err(err)
    }
}

// A finished task is always a failure; surface its own error when it has one.
fn task_result(
    task: &'static str,
    stopped: std::result::Result<Result<()>, JoinError>,
) -> RelayError {
    match stopped {
        Ok(Err(err)) => err,
        Ok(Ok(())) | Err(_) => RelayError::TaskStopped(task),
    }
}
