// src/supervisor.rs

//! Connection supervision.
//!
//! The supervisor owns the broker connection. It waits for reconnect
//! requests, dials until the broker answers, opens one channel and offers it
//! to the loops through the channel handoff. A close listener on the
//! connection feeds the same request queue, so losing the connection starts
//! the next cycle.
//!
//! Requests carry the generation of the channel that failed. Requests for a
//! generation that has already been replaced are dropped, which folds the
//! consumer's, the publisher's and the close listener's reports of one
//! failure into a single reconnect.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::Connector;
use crate::errors::{RelayError, Result};
use crate::handoff::{self, ChannelPublisher, ChannelWatcher};
use crate::retry::{retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectReason {
    Startup,
    ConnectionClosed(String),
    ConsumerStopped(String),
    PublishFailed(String),
    ChannelClosed,
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectReason::Startup => write!(f, "startup"),
            ReconnectReason::ConnectionClosed(reason) => write!(f, "connection closed: {}", reason),
            ReconnectReason::ConsumerStopped(reason) => write!(f, "consumer stopped: {}", reason),
            ReconnectReason::PublishFailed(reason) => write!(f, "publish failed: {}", reason),
            ReconnectReason::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectRequest {
    /// Generation of the channel the requester was using; 0 at startup.
    pub generation: u64,
    pub reason: ReconnectReason,
}

/// Cloneable sender for reconnect requests.
#[derive(Debug, Clone)]
pub struct ReconnectHandle {
    sender: mpsc::UnboundedSender<ReconnectRequest>,
}

impl ReconnectHandle {
    pub fn new(sender: mpsc::UnboundedSender<ReconnectRequest>) -> Self {
        Self { sender }
    }

    pub fn request(&self, generation: u64, reason: ReconnectReason) {
        debug!(generation, %reason, "requesting reconnect");
        if self
            .sender
            .send(ReconnectRequest { generation, reason })
            .is_err()
        {
            warn!("Reconnect request dropped: connection supervisor is gone");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Connected,
}

pub struct ConnectionSupervisor<K: Connector> {
    connector: K,
    dial_policy: Arc<dyn RetryPolicy>,
    requests: mpsc::UnboundedReceiver<ReconnectRequest>,
    // weak so that the loop ends once every external handle is gone
    requester: mpsc::WeakUnboundedSender<ReconnectRequest>,
    channels: ChannelPublisher<K::Channel>,
    connection: Option<K::Connection>,
    state: SupervisorState,
}

impl<K: Connector> ConnectionSupervisor<K> {
    pub fn new(
        connector: K,
        dial_policy: Arc<dyn RetryPolicy>,
    ) -> (Self, ReconnectHandle, ChannelWatcher<K::Channel>) {
        let (sender, requests) = mpsc::unbounded_channel();
        let requester = sender.downgrade();
        let handle = ReconnectHandle::new(sender);
        let (channels, watcher) = handoff::channel();

        let supervisor = Self {
            connector,
            dial_policy,
            requests,
            requester,
            channels,
            connection: None,
            state: SupervisorState::Idle,
        };
        (supervisor, handle, watcher)
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Serve reconnect requests until every handle is dropped, including the
    /// one held by the live connection's close listener.
    ///
    /// Only a channel-open failure ends the loop with an error.
    pub async fn run(mut self) -> Result<()> {
        while let Some(request) = self.requests.recv().await {
            if request.generation < self.channels.generation() {
                debug!(
                    requested = request.generation,
                    current = self.channels.generation(),
                    reason = %request.reason,
                    "ignoring reconnect request for a replaced channel"
                );
                continue;
            }

            info!(generation = request.generation, reason = %request.reason, "reconnect requested");
            self.reconnect().await?;
        }

        info!("all reconnect handles dropped, connection supervisor stopping");
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Some(previous) = self.connection.take() {
            self.connector.close(previous).await;
        }
        self.transition(SupervisorState::Idle);
        self.transition(SupervisorState::Connecting);

        let connector = &self.connector;
        let connection = retry(self.dial_policy.as_ref(), "connect to rabbitmq", || connector.dial()).await?;

        let channel = match self.connector.open_channel(&connection).await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = %err, "Failed to open a channel");
                self.transition(SupervisorState::Idle);
                return Err(match err {
                    RelayError::ChannelOpen(_) => err,
                    other => RelayError::ChannelOpen(other.to_string()),
                });
            }
        };

        let generation = self.channels.generation() + 1;
        if let Some(sender) = self.requester.upgrade() {
            let handle = ReconnectHandle::new(sender);
            self.connector.on_close(
                &connection,
                Box::new(move |reason| {
                    handle.request(generation, ReconnectReason::ConnectionClosed(reason));
                }),
            );
        }

        self.connection = Some(connection);
        let published = self.channels.publish(channel);
        debug_assert_eq!(published, generation);
        self.transition(SupervisorState::Connected);
        info!(generation, "new channel available");
        Ok(())
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "connection supervisor state change");
            self.state = next;
        }
    }
}
