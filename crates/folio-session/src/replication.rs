//! Cross-process replication of one session over the pub/sub hub
//!
//! Every process hosting a session subscribes to the session's channel
//! under a random id. Messages are addressed to everyone or to one peer and
//! stamped with the sender's clock:
//!
//! - own messages and messages for other peers are ignored
//! - an older clock is ignored, a newer one makes the session reload
//! - step 1 is broadcast on start and periodically; whoever answers with
//!   step 2 becomes a synced peer
//! - synced peers are pinged; a peer that did not pong since the previous
//!   ping is dropped
//!
//! Local updates queued while a publish is in flight are concatenated and
//! sent as one update frame.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use folio_storage::PubSub;
use folio_sync::{HeadHash, PeerFrame, SyncMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::SessionResult;

/// The session side of replication
#[async_trait]
pub trait ReplicaTarget: Send + Sync + 'static {
    fn clock(&self) -> u64;

    async fn heads(&self) -> SessionResult<Vec<HeadHash>>;

    /// Changes the holder of `heads` is missing
    async fn changes_since(&self, heads: &[HeadHash]) -> SessionResult<Vec<u8>>;

    /// Apply an update from another process
    async fn apply_foreign(&self, update: &[u8]) -> SessionResult<()>;

    async fn apply_foreign_awareness(&self, update: &[u8]) -> SessionResult<()>;

    /// Another process runs a newer clock
    fn newer_clock(&self, clock: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Target {
    Broadcast,
    Peer(Uuid),
}

/// Envelope published on a session channel
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerMessage {
    /// Session key of the sender
    id: String,
    sender_id: Uuid,
    target: Target,
    clock: u64,
    /// Encoded [`PeerFrame`]
    payload: Vec<u8>,
}

enum Input {
    Update(Vec<u8>),
    Awareness(Vec<u8>),
    Reset,
}

/// Handle to a running replication provider
pub struct ReplicationHandle {
    pubsub_id: Uuid,
    tx: mpsc::UnboundedSender<Input>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationHandle {
    pub fn spawn<T: ReplicaTarget>(
        target: Weak<T>,
        channel: String,
        hub: Arc<dyn PubSub>,
        config: &SessionConfig,
    ) -> Self {
        let pubsub_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let provider = Provider {
            target,
            pubsub_id,
            id: channel.trim_start_matches("yjs:").to_string(),
            channel,
            hub,
            peers: HashMap::new(),
            resync_interval: config.replication_resync_interval,
            ping_interval: config.replication_ping_interval,
        };
        let task = tokio::spawn(provider.run(rx, shutdown_rx));
        Self {
            pubsub_id,
            tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn pubsub_id(&self) -> Uuid {
        self.pubsub_id
    }

    pub fn local_update(&self, update: Vec<u8>) {
        let _ = self.tx.send(Input::Update(update));
    }

    pub fn local_awareness(&self, update: Vec<u8>) {
        let _ = self.tx.send(Input::Awareness(update));
    }

    /// Forget synced peers and announce again, after a clock change
    pub fn reset(&self) {
        let _ = self.tx.send(Input::Reset);
    }

    pub async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

struct PeerState {
    ponged: bool,
}

struct Provider<T> {
    target: Weak<T>,
    pubsub_id: Uuid,
    id: String,
    channel: String,
    hub: Arc<dyn PubSub>,
    peers: HashMap<Uuid, PeerState>,
    resync_interval: std::time::Duration,
    ping_interval: std::time::Duration,
}

impl<T: ReplicaTarget> Provider<T> {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Input>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut subscription = self.hub.subscribe(&self.channel);
        let mut resync = interval_at(Instant::now() + self.resync_interval, self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(channel = %self.channel, pubsub_id = %self.pubsub_id, "Replication started");
        self.announce().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                message = subscription.recv() => match message {
                    Some(bytes) => self.handle_message(&bytes).await,
                    None => break,
                },
                input = rx.recv() => match input {
                    Some(input) => self.handle_input(input, &mut rx).await,
                    None => break,
                },
                _ = resync.tick() => self.announce().await,
                _ = ping.tick() => self.ping_peers().await,
            }
        }
        debug!(channel = %self.channel, pubsub_id = %self.pubsub_id, "Replication stopped");
    }

    async fn handle_input(&mut self, input: Input, rx: &mut mpsc::UnboundedReceiver<Input>) {
        match input {
            Input::Update(mut merged) => {
                let mut deferred = Vec::new();
                while let Ok(next) = rx.try_recv() {
                    match next {
                        Input::Update(update) => merged.extend_from_slice(&update),
                        other => deferred.push(other),
                    }
                }
                if !self.peers.is_empty() {
                    let frame = PeerFrame::Sync(SyncMessage::Update { update: merged });
                    self.send(Target::Broadcast, &frame).await;
                }
                for input in deferred {
                    self.handle_simple_input(input).await;
                }
            }
            other => self.handle_simple_input(other).await,
        }
    }

    async fn handle_simple_input(&mut self, input: Input) {
        match input {
            Input::Update(update) => {
                if !self.peers.is_empty() {
                    let frame = PeerFrame::Sync(SyncMessage::Update { update });
                    self.send(Target::Broadcast, &frame).await;
                }
            }
            Input::Awareness(update) => {
                self.send(Target::Broadcast, &PeerFrame::Awareness(update)).await;
            }
            Input::Reset => {
                self.peers.clear();
                self.announce().await;
            }
        }
    }

    async fn handle_message(&mut self, bytes: &[u8]) {
        let message: PeerMessage = match postcard::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "Dropping malformed replication message");
                return;
            }
        };
        if message.sender_id == self.pubsub_id {
            return;
        }
        if let Target::Peer(peer) = message.target {
            if peer != self.pubsub_id {
                return;
            }
        }
        let Some(target) = self.target.upgrade() else {
            return;
        };

        let clock = target.clock();
        if message.clock < clock {
            trace!(channel = %self.channel, clock, remote = message.clock, "Ignoring message from an older clock");
            return;
        }
        if message.clock > clock {
            target.newer_clock(message.clock);
            return;
        }

        let frame = match PeerFrame::decode(&message.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "Dropping malformed replication frame");
                return;
            }
        };
        let sender = message.sender_id;
        if let Err(e) = self.handle_frame(target.as_ref(), sender, frame).await {
            warn!(channel = %self.channel, sender = %sender, error = %e, "Failed to handle replication frame");
        }
    }

    async fn handle_frame(&mut self, target: &T, sender: Uuid, frame: PeerFrame) -> SessionResult<()> {
        match frame {
            PeerFrame::Sync(SyncMessage::Step1 { heads }) => {
                let update = target.changes_since(&heads).await?;
                self.send(Target::Peer(sender), &PeerFrame::Sync(SyncMessage::Step2 { update }))
                    .await;
                if !self.peers.contains_key(&sender) {
                    let heads = target.heads().await?;
                    self.send(Target::Peer(sender), &PeerFrame::Sync(SyncMessage::Step1 { heads }))
                        .await;
                }
            }
            PeerFrame::Sync(SyncMessage::Step2 { update }) => {
                if !update.is_empty() {
                    target.apply_foreign(&update).await?;
                }
                if self.peers.insert(sender, PeerState { ponged: true }).is_none() {
                    info!(channel = %self.channel, peer = %sender, "Peer synced");
                }
            }
            PeerFrame::Sync(SyncMessage::Update { update }) => {
                target.apply_foreign(&update).await?;
            }
            PeerFrame::Awareness(update) => {
                target.apply_foreign_awareness(&update).await?;
            }
            PeerFrame::Ping => {
                self.send(Target::Peer(sender), &PeerFrame::Pong).await;
            }
            PeerFrame::Pong => {
                if let Some(peer) = self.peers.get_mut(&sender) {
                    peer.ponged = true;
                }
            }
        }
        Ok(())
    }

    async fn announce(&mut self) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        match target.heads().await {
            Ok(heads) => {
                self.send(Target::Broadcast, &PeerFrame::Sync(SyncMessage::Step1 { heads }))
                    .await
            }
            Err(e) => warn!(channel = %self.channel, error = %e, "Failed to read heads"),
        }
    }

    async fn ping_peers(&mut self) {
        let before = self.peers.len();
        self.peers.retain(|_, peer| peer.ponged);
        if self.peers.len() < before {
            info!(channel = %self.channel, dropped = before - self.peers.len(), "Dropped unresponsive peers");
        }
        let peers: Vec<Uuid> = self.peers.keys().copied().collect();
        for peer in peers {
            if let Some(state) = self.peers.get_mut(&peer) {
                state.ponged = false;
            }
            self.send(Target::Peer(peer), &PeerFrame::Ping).await;
        }
    }

    async fn send(&self, target: Target, frame: &PeerFrame) {
        let Some(clock) = self.target.upgrade().map(|t| t.clock()) else {
            return;
        };
        let payload = match frame.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "Failed to encode replication frame");
                return;
            }
        };
        let message = PeerMessage {
            id: self.id.clone(),
            sender_id: self.pubsub_id,
            target,
            clock,
            payload,
        };
        let bytes = match postcard::to_allocvec(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "Failed to encode replication message");
                return;
            }
        };
        if let Err(e) = self.hub.publish(&self.channel, bytes.into()).await {
            warn!(channel = %self.channel, error = %e, "Failed to publish replication message");
        }
    }
}
