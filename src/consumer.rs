// src/consumer.rs

use futures::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::address;
use crate::broker::{BrokerChannel, InboundDelivery};
use crate::errors::{RelayError, Result};
use crate::handoff::{ChannelWatcher, Lease};
use crate::publisher::{ResolvedResponse, ResponseSender};
use crate::supervisor::{ReconnectHandle, ReconnectReason};

/// Drains the query queue and hands resolved replies to the publisher.
///
/// Deliveries are acknowledged only after their reply has been handed off, so
/// a crash in between can produce a duplicate reply but never a lost one.
/// Deliveries whose reply-to cannot be parsed are rejected without requeue.
pub struct ConsumerLoop<C: BrokerChannel> {
    queue: String,
    channels: ChannelWatcher<C>,
    reconnect: ReconnectHandle,
    responses: ResponseSender<C>,
}

impl<C: BrokerChannel> ConsumerLoop<C> {
    pub fn new(
        queue: impl Into<String>,
        channels: ChannelWatcher<C>,
        reconnect: ReconnectHandle,
        responses: ResponseSender<C>,
    ) -> Self {
        Self {
            queue: queue.into(),
            channels,
            reconnect,
            responses,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            let lease = self.channels.next_channel().await?;

            let reason = match self.consume(&lease).await {
                Ok(()) => "delivery stream closed".to_string(),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => err.to_string(),
            };

            warn!(
                queue = %self.queue,
                generation = lease.generation(),
                %reason,
                "stopped consuming, waiting for a new channel"
            );
            self.reconnect
                .request(lease.generation(), ReconnectReason::ConsumerStopped(reason));
        }
    }

    async fn consume(&self, lease: &Lease<C>) -> Result<()> {
        let consumer_tag = format!("fakedata-{}", &Uuid::new_v4().to_string()[..8]);
        let mut deliveries = lease.channel().consume(&self.queue, &consumer_tag).await?;

        info!(
            queue = %self.queue,
            consumer_tag = %consumer_tag,
            generation = lease.generation(),
            "Waiting for messages"
        );

        while let Some(delivery) = deliveries.next().await {
            self.handle(delivery?, lease).await?;
        }
        Ok(())
    }

    async fn handle(&self, delivery: C::Delivery, lease: &Lease<C>) -> Result<()> {
        let reply_to = delivery.reply_to().unwrap_or_default();

        match address::resolve(reply_to) {
            Err(err) => {
                warn!(reply_to, error = %err, "failed to parse reply-to, rejecting query");
                delivery.reject().await?;
            }
            Ok(address) => {
                info!(%address, "received a query message and will send response");
                // waits while the publisher is behind; the ack waits with it
                self.responses
                    .send(ResolvedResponse::new(address, lease.clone()))
                    .await
                    .map_err(|_| RelayError::PublisherGone)?;
                delivery.ack().await?;
            }
        }
        Ok(())
    }
}
