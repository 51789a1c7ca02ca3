// src/handoff.rs
//
// Hands freshly opened channels from the supervisor to the loops. Only the
// latest channel is ever current; each one is numbered so a stale reference
// can be recognised and replaced.

use tokio::sync::watch;

use crate::errors::{RelayError, Result};

/// A channel together with the connection generation that produced it.
#[derive(Debug, Clone)]
pub struct Lease<C> {
    generation: u64,
    channel: C,
}

impl<C> Lease<C> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }
}

/// Supervisor side of the handoff.
pub struct ChannelPublisher<C> {
    sender: watch::Sender<Option<Lease<C>>>,
    generation: u64,
}

/// Loop side of the handoff. Each loop keeps its own watcher.
#[derive(Clone)]
pub struct ChannelWatcher<C> {
    receiver: watch::Receiver<Option<Lease<C>>>,
    last_taken: u64,
}

pub fn channel<C>() -> (ChannelPublisher<C>, ChannelWatcher<C>) {
    let (sender, receiver) = watch::channel(None);
    (
        ChannelPublisher {
            sender,
            generation: 0,
        },
        ChannelWatcher {
            receiver,
            last_taken: 0,
        },
    )
}

impl<C> ChannelPublisher<C> {
    /// Generation of the channel currently on offer; 0 before the first one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the current channel. Returns the new generation.
    pub fn publish(&mut self, channel: C) -> u64 {
        self.generation += 1;
        self.sender.send_replace(Some(Lease {
            generation: self.generation,
            channel,
        }));
        self.generation
    }

    pub fn subscribe(&self) -> ChannelWatcher<C> {
        ChannelWatcher {
            receiver: self.sender.subscribe(),
            last_taken: 0,
        }
    }
}

impl<C: Clone> ChannelWatcher<C> {
    pub fn current(&self) -> Option<Lease<C>> {
        self.receiver.borrow().clone()
    }

    /// Wait for a channel newer than the last one this watcher took.
    pub async fn next_channel(&mut self) -> Result<Lease<C>> {
        let lease = self.newer_than(self.last_taken).await?;
        self.last_taken = lease.generation;
        Ok(lease)
    }

    /// Wait for a channel newer than `generation`.
    pub async fn newer_than(&mut self, generation: u64) -> Result<Lease<C>> {
        let current = self
            .receiver
            .wait_for(|lease| matches!(lease, Some(lease) if lease.generation > generation))
            .await
            .map_err(|_| RelayError::SupervisorGone)?;

        current.clone().ok_or(RelayError::SupervisorGone)
    }
}
