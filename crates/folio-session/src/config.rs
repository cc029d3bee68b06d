//! Session manager configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and sizing of sessions, connections, replication and execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often idle sessions are swept from the live map
    pub collect_interval: Duration,
    /// Byte budget of the cache that keeps recently idle sessions warm
    pub cache_max_bytes: u64,
    /// How long shutdown waits for sessions to drain
    pub shutdown_timeout: Duration,
    /// How often shutdown re-checks the live map
    pub shutdown_poll_interval: Duration,
    /// Sessions destroyed at once when shutdown gives up waiting
    pub force_destroy_concurrency: usize,
    /// Ping interval; a connection that missed a pong is closed
    pub keepalive_interval: Duration,
    /// How often a connection re-resolves its user's role
    pub role_refresh_interval: Duration,
    /// Minimum spacing of snapshot writes
    pub persist_interval: Duration,
    /// Executor poll interval while the queue is empty
    pub executor_idle_poll: Duration,
    /// Delay before a failed executor loop is restarted
    pub executor_restart_backoff: Duration,
    /// How often replication re-announces itself with a step 1
    pub replication_resync_interval: Duration,
    /// How often synced peers are pinged
    pub replication_ping_interval: Duration,
    /// Load latency above which history cleanup is considered
    pub history_cleanup_latency: Duration,
    /// Clock age above which history cleanup is considered
    pub history_cleanup_clock_age: Duration,
    /// Age after which stored pub/sub payloads are pruned
    pub payload_retention: Duration,
    /// Capacity of the document event channel
    pub event_channel_capacity: usize,
    /// Messages queued per connection before a slow client is dropped
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_secs(5),
            cache_max_bytes: 512 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(120),
            shutdown_poll_interval: Duration::from_millis(200),
            force_destroy_concurrency: 5,
            keepalive_interval: Duration::from_secs(30),
            role_refresh_interval: Duration::from_secs(5),
            persist_interval: Duration::from_millis(500),
            executor_idle_poll: Duration::from_millis(500),
            executor_restart_backoff: Duration::from_secs(1),
            replication_resync_interval: Duration::from_secs(30),
            replication_ping_interval: Duration::from_secs(30),
            history_cleanup_latency: Duration::from_secs(1),
            history_cleanup_clock_age: Duration::from_secs(24 * 60 * 60),
            payload_retention: Duration::from_secs(10 * 60),
            event_channel_capacity: 1024,
            outbound_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Short intervals for tests
    pub fn testing() -> Self {
        Self {
            collect_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(2),
            shutdown_poll_interval: Duration::from_millis(20),
            persist_interval: Duration::from_millis(20),
            executor_idle_poll: Duration::from_millis(10),
            executor_restart_backoff: Duration::from_millis(50),
            replication_resync_interval: Duration::from_millis(200),
            replication_ping_interval: Duration::from_millis(500),
            ..Self::default()
        }
    }

    pub fn with_collect_interval(mut self, interval: Duration) -> Self {
        self.collect_interval = interval;
        self
    }

    pub fn with_cache_max_bytes(mut self, bytes: u64) -> Self {
        self.cache_max_bytes = bytes;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_role_refresh_interval(mut self, interval: Duration) -> Self {
        self.role_refresh_interval = interval;
        self
    }

    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    pub fn with_executor_idle_poll(mut self, interval: Duration) -> Self {
        self.executor_idle_poll = interval;
        self
    }

    pub fn with_executor_restart_backoff(mut self, backoff: Duration) -> Self {
        self.executor_restart_backoff = backoff;
        self
    }

    pub fn with_replication_intervals(mut self, resync: Duration, ping: Duration) -> Self {
        self.replication_resync_interval = resync;
        self.replication_ping_interval = ping;
        self
    }

    pub fn with_payload_retention(mut self, retention: Duration) -> Self {
        self.payload_retention = retention;
        self
    }

    pub fn with_history_cleanup(mut self, latency: Duration, clock_age: Duration) -> Self {
        self.history_cleanup_latency = latency;
        self.history_cleanup_clock_age = clock_age;
        self
    }
}
