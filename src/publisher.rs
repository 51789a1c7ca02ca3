// src/publisher.rs

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::address::ResolvedAddress;
use crate::broker::BrokerChannel;
use crate::errors::{RelayError, Result};
use crate::handoff::{ChannelWatcher, Lease};
use crate::payload::Payload;
use crate::retry::RetryPolicy;
use crate::supervisor::{ReconnectHandle, ReconnectReason};

/// A reply waiting to be published.
///
/// The address never changes; the lease is swapped for a newer one whenever
/// the channel it refers to has been replaced.
#[derive(Debug, Clone)]
pub struct ResolvedResponse<C> {
    address: ResolvedAddress,
    lease: Lease<C>,
    attempts: u32,
}

impl<C> ResolvedResponse<C> {
    pub fn new(address: ResolvedAddress, lease: Lease<C>) -> Self {
        Self {
            address,
            lease,
            attempts: 0,
        }
    }

    pub fn address(&self) -> &ResolvedAddress {
        &self.address
    }

    pub fn lease(&self) -> &Lease<C> {
        &self.lease
    }

    /// Failed publish attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Responses the consumer may hand over before the publisher takes them.
/// A send blocks once it is full, which holds back the consumer's ack.
pub const HANDOFF_CAPACITY: usize = 1;

pub type ResponseSender<C> = mpsc::Sender<ResolvedResponse<C>>;

/// Publishes the payload for each response, one at a time.
///
/// Failed responses go to a separate retry queue that is drained before any
/// new response is taken from the handoff. While a reply keeps failing the
/// consumer therefore blocks, and the queries behind it stay unacknowledged
/// on the broker instead of piling up in memory.
pub struct PublisherLoop<C: BrokerChannel> {
    payload: Payload,
    inbox: mpsc::Receiver<ResolvedResponse<C>>,
    retries: mpsc::UnboundedReceiver<ResolvedResponse<C>>,
    requeue: mpsc::UnboundedSender<ResolvedResponse<C>>,
    channels: ChannelWatcher<C>,
    reconnect: ReconnectHandle,
    policy: Arc<dyn RetryPolicy>,
}

impl<C: BrokerChannel> PublisherLoop<C> {
    /// Returns the loop and the sender responses are handed to.
    pub fn new(
        payload: Payload,
        channels: ChannelWatcher<C>,
        reconnect: ReconnectHandle,
        policy: Arc<dyn RetryPolicy>,
    ) -> (Self, ResponseSender<C>) {
        let (sender, inbox) = mpsc::channel(HANDOFF_CAPACITY);
        let (requeue, retries) = mpsc::unbounded_channel();
        let publisher = Self {
            payload,
            inbox,
            retries,
            requeue,
            channels,
            reconnect,
            policy,
        };
        (publisher, sender)
    }

    /// Runs until the consumer's sender is dropped and no retry is pending.
    pub async fn run(mut self) -> Result<()> {
        info!(bytes = self.payload.len(), "reply publisher started");
        loop {
            let next = tokio::select! {
                biased;
                Some(retried) = self.retries.recv() => Some(retried),
                fresh = self.inbox.recv() => fresh,
            };
            let Some(response) = next else {
                break;
            };
            self.deliver(response).await?;
        }
        Ok(())
    }

    async fn deliver(&mut self, mut response: ResolvedResponse<C>) -> Result<()> {
        self.refresh(&mut response).await?;

        let result = response
            .lease
            .channel()
            .publish(
                response.address.destination(),
                response.address.routing_key(),
                self.payload.as_bytes(),
            )
            .await;

        let err = match result {
            Ok(()) => {
                info!(
                    destination = response.address.destination(),
                    routing_key = response.address.routing_key(),
                    generation = response.lease.generation(),
                    "sent reply message"
                );
                return Ok(());
            }
            Err(err) => err,
        };

        response.attempts += 1;
        warn!(
            address = %response.address,
            attempt = response.attempts,
            error = %err,
            "failed to send reply message"
        );
        self.reconnect.request(
            response.lease.generation(),
            ReconnectReason::PublishFailed(err.to_string()),
        );

        match self.policy.delay(response.attempts) {
            Some(delay) => {
                if delay.is_zero() {
                    // let the supervisor and consumer run between attempts
                    task::yield_now().await;
                } else {
                    sleep(delay).await;
                }
                // back of the retry queue, still ahead of new responses
                self.requeue
                    .send(response)
                    .map_err(|_| RelayError::PublisherGone)?;
            }
            None => {
                error!(
                    address = %response.address,
                    attempts = response.attempts,
                    "giving up on reply message"
                );
            }
        }
        Ok(())
    }

    // Move the response onto the newest channel, waiting for one if the
    // channel it carries is closed.
    async fn refresh(&mut self, response: &mut ResolvedResponse<C>) -> Result<()> {
        if let Some(current) = self.channels.current() {
            if current.generation() > response.lease.generation() {
                debug!(
                    from = response.lease.generation(),
                    to = current.generation(),
                    "moving reply to the current channel"
                );
                response.lease = current;
            }
        }

        if !response.lease.channel().is_open() {
            debug!(
                generation = response.lease.generation(),
                "reply channel is closed, waiting for a new one"
            );
            self.reconnect
                .request(response.lease.generation(), ReconnectReason::ChannelClosed);
            response.lease = self.channels.newer_than(response.lease.generation()).await?;
        }
        Ok(())
    }
}
