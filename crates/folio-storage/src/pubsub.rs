//! Publish/subscribe between server processes
//!
//! [`PubSub`] is the seam a coordination backend implements: publish a
//! payload on a string channel, subscribe to a channel. Every subscriber of a
//! channel receives every message published on it after it subscribed, in
//! publish order.
//!
//! [`LocalPubSub`] is the in-memory implementation over tokio broadcast
//! channels. It only reaches subscribers holding the same instance, so it
//! connects sessions of one process, or several simulated processes that
//! share it. Separate server processes need a backend over a shared broker.
//!
//! In [`PayloadMode::Stored`] the hub writes each payload to the durable
//! store and ships only its id; subscribers fetch the payload on receipt.
//! A payload that vanished before it was fetched (pruned, or written by a
//! store that failed) is logged and skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::error::StorageResult;
use crate::store::{now_millis, DocumentStore};

/// Default per-channel buffer before slow subscribers start lagging
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Channel-based publish/subscribe backend
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// Publish a payload; returns how many subscribers it reached
    async fn publish(&self, channel: &str, payload: Bytes) -> StorageResult<usize>;

    /// Subscribe to a channel
    fn subscribe(&self, channel: &str) -> Subscription;

    /// Periodic housekeeping; returns how many stored payloads were dropped
    async fn maintain(&self, _retention: Duration) -> StorageResult<usize> {
        Ok(0)
    }
}

/// Message source behind a [`Subscription`]
#[async_trait]
pub trait MessageStream: Send + 'static {
    /// Next payload, or `None` once the backend is gone
    async fn next_message(&mut self) -> Option<Bytes>;
}

/// Receiving end of one channel subscription
pub struct Subscription {
    channel: String,
    stream: Box<dyn MessageStream>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, stream: impl MessageStream) -> Self {
        Self {
            channel: channel.into(),
            stream: Box::new(stream),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the backend is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.stream.next_message().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("channel", &self.channel).finish()
    }
}

/// How published payloads travel to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// Payload bytes travel with the message
    Inline,
    /// Payload is stored and subscribers fetch it by id
    Stored,
}

#[derive(Debug, Clone)]
enum Envelope {
    Inline(Bytes),
    Pointer(String),
}

/// In-memory [`PubSub`] shared by everything holding the same instance
pub struct LocalPubSub {
    channels: DashMap<String, broadcast::Sender<Envelope>>,
    store: Option<Arc<dyn DocumentStore>>,
    capacity: usize,
}

impl LocalPubSub {
    /// Hub that carries payloads inline
    pub fn inline() -> Self {
        Self {
            channels: DashMap::new(),
            store: None,
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Hub that stores payloads and ships their ids
    pub fn stored(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            channels: DashMap::new(),
            store: Some(store),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the per-channel buffer size
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn mode(&self) -> PayloadMode {
        if self.store.is_some() {
            PayloadMode::Stored
        } else {
            PayloadMode::Inline
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Envelope> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscribers of a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Forget channels nobody listens to anymore
    pub fn remove_idle_channels(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }

    /// Delete stored payloads older than `retention`
    pub async fn prune(&self, retention: Duration) -> StorageResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let cutoff = now_millis() - retention.as_millis() as i64;
        let pruned = store.prune_payloads(cutoff).await?;
        if pruned > 0 {
            debug!(pruned, "Pruned pub/sub payloads");
        }
        Ok(pruned)
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> StorageResult<usize> {
        let sender = self.sender(channel);
        if sender.receiver_count() == 0 {
            trace!(channel, "No subscribers, dropping message");
            return Ok(0);
        }

        let envelope = match &self.store {
            None => Envelope::Inline(payload),
            Some(store) => Envelope::Pointer(store.put_payload(&payload).await?),
        };

        // Subscribers may have gone away since the count above
        let delivered = sender.send(envelope).unwrap_or(0);
        trace!(channel, delivered, "Published message");
        Ok(delivered)
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        let stream = LocalStream {
            channel: channel.to_string(),
            receiver: self.sender(channel).subscribe(),
            store: self.store.clone(),
        };
        Subscription::new(channel, stream)
    }

    async fn maintain(&self, retention: Duration) -> StorageResult<usize> {
        self.remove_idle_channels();
        self.prune(retention).await
    }
}

impl std::fmt::Debug for LocalPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPubSub")
            .field("channels", &self.channels.len())
            .field("mode", &self.mode())
            .finish()
    }
}

struct LocalStream {
    channel: String,
    receiver: broadcast::Receiver<Envelope>,
    store: Option<Arc<dyn DocumentStore>>,
}

#[async_trait]
impl MessageStream for LocalStream {
    async fn next_message(&mut self) -> Option<Bytes> {
        loop {
            let envelope = match self.receiver.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "Subscriber lagged, messages lost");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };

            match envelope {
                Envelope::Inline(payload) => return Some(payload),
                Envelope::Pointer(id) => {
                    let Some(store) = &self.store else {
                        warn!(channel = %self.channel, payload_id = %id, "Pointer without a store");
                        continue;
                    };
                    match store.get_payload(&id).await {
                        Ok(Some(data)) => return Some(Bytes::from(data)),
                        Ok(None) => {
                            warn!(channel = %self.channel, payload_id = %id, "Payload not found, skipping message");
                        }
                        Err(e) => {
                            warn!(channel = %self.channel, payload_id = %id, error = %e, "Failed to fetch payload");
                        }
                    }
                }
            }
        }
    }
}
