//! The cluster: process-level aggregate owning every shard, the shared
//! identify throttle, the event dispatcher, and the 1 Hz ticker that
//! drives each shard's scheduler.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use lanyard_cache::GuildCache;
use lanyard_models::intents::Intents;

use crate::dispatch::EventDispatcher;
use crate::error::GatewayError;
use crate::shard::Shard;
use crate::transport::Transport;
use crate::voice::VoiceConnector;

const DEFAULT_IDENTIFY_GATE_SECS: i64 = 5;

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub token: String,
    pub intents: Intents,
    pub shard_count: u32,
    /// Use the zlib-stream gateway transport.
    pub compressed: bool,
    /// Minimum spacing between IDENTIFYs across all shards of this
    /// cluster.
    pub identify_gate_secs: i64,
}

impl ClusterOptions {
    pub fn new(token: impl Into<String>, shard_count: u32) -> Self {
        Self {
            token: token.into(),
            intents: Intents::empty(),
            shard_count,
            compressed: true,
            identify_gate_secs: DEFAULT_IDENTIFY_GATE_SECS,
        }
    }
}

/// State shared by every shard of a cluster. Shards hold this as an Arc
/// back-reference; the cluster outlives its shards by construction.
pub(crate) struct ClusterShared {
    pub(crate) token: String,
    pub(crate) intents: Intents,
    pub(crate) max_shards: u32,
    pub(crate) compressed: bool,
    pub(crate) identify_gate_secs: i64,
    /// Unix timestamp of the most recent IDENTIFY by any shard; the total
    /// order across shards is what the identify gate is built on.
    pub(crate) last_identify: AtomicI64,
    pub(crate) dispatcher: Arc<dyn EventDispatcher>,
    pub(crate) cache: Arc<GuildCache>,
    pub(crate) voice: Option<Arc<dyn VoiceConnector>>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

pub struct Cluster<T: Transport> {
    shared: Arc<ClusterShared>,
    shards: Vec<Arc<Shard<T>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: Transport> Cluster<T> {
    pub fn new(
        options: ClusterOptions,
        dispatcher: Arc<dyn EventDispatcher>,
        cache: Arc<GuildCache>,
        voice: Option<Arc<dyn VoiceConnector>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(ClusterShared {
            token: options.token,
            intents: options.intents,
            max_shards: options.shard_count,
            compressed: options.compressed,
            identify_gate_secs: options.identify_gate_secs,
            last_identify: AtomicI64::new(0),
            dispatcher,
            cache,
            voice,
            shutdown: shutdown_rx,
        });
        Self {
            shared,
            shards: Vec::new(),
            shutdown_tx,
        }
    }

    /// Add the next shard, wired to `transport`. Shard ids are assigned in
    /// call order.
    pub fn add_shard(&mut self, transport: T) -> Arc<Shard<T>> {
        let shard = Arc::new(Shard::new(
            self.shards.len() as u32,
            Arc::clone(&self.shared),
            transport,
        ));
        self.shards.push(Arc::clone(&shard));
        shard
    }

    pub fn shards(&self) -> &[Arc<Shard<T>>] {
        &self.shards
    }

    /// Create any missing shards, spawn every shard's supervisor, and
    /// start the ticker. Returns the supervisor join handles; each resolves
    /// only on shutdown or a fatal gateway close.
    pub fn start(&mut self) -> Vec<JoinHandle<Result<(), GatewayError>>>
    where
        T: Default,
    {
        while (self.shards.len() as u32) < self.shared.max_shards {
            self.add_shard(T::default());
        }
        let mut handles = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let shard = Arc::clone(shard);
            handles.push(tokio::spawn(async move { shard.run().await }));
        }
        self.spawn_ticker();
        handles
    }

    /// The cluster-owned 1 Hz ticker. Each tick runs every shard's
    /// scheduler in turn.
    pub fn spawn_ticker(&self) -> JoinHandle<()> {
        let shards = self.shards.clone();
        let mut shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for shard in &shards {
                            shard.one_second_timer().await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Ask every shard to close its session and exit its supervisor.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::NullDispatcher;
    use crate::testutil::FakeTransport;
    use serde_json::Value;
    use std::time::Instant;

    const HELLO: &[u8] = br#"{"op":10,"d":{"heartbeat_interval":41250}}"#;

    #[tokio::test]
    async fn identify_gate_spaces_shards_apart() {
        let mut options = ClusterOptions::new("token", 2);
        options.compressed = false;
        options.identify_gate_secs = 2;
        let mut cluster: Cluster<FakeTransport> = Cluster::new(
            options,
            Arc::new(NullDispatcher),
            Arc::new(GuildCache::new()),
            None,
        );
        let (transport_a, _tx_a) = FakeTransport::pair();
        let (transport_b, _tx_b) = FakeTransport::pair();
        let shard_a = cluster.add_shard(transport_a.clone());
        let shard_b = cluster.add_shard(transport_b.clone());
        transport_a.connect("wss://test").await.unwrap();
        transport_b.connect("wss://test").await.unwrap();

        let started = Instant::now();
        assert!(shard_a.handle_frame(HELLO, None).await);
        assert!(shard_b.handle_frame(HELLO, None).await);
        let elapsed = started.elapsed();

        // The second identify must wait out the gate. Second-granularity
        // timestamps can shave up to one second off the spacing.
        assert!(elapsed >= Duration::from_secs(1), "gate not enforced: {elapsed:?}");
        for transport in [&transport_a, &transport_b] {
            let sent = transport.sent();
            assert_eq!(sent.len(), 1);
            let identify: Value = serde_json::from_str(&sent[0]).unwrap();
            assert_eq!(identify["op"], 2);
        }
        let shards = [shard_a, shard_b];
        for (index, shard) in shards.iter().enumerate() {
            assert_eq!(shard.shard_id(), index as u32);
        }
    }

    #[tokio::test]
    async fn shard_ids_are_assigned_in_order() {
        let mut cluster: Cluster<FakeTransport> = Cluster::new(
            ClusterOptions::new("token", 3),
            Arc::new(NullDispatcher),
            Arc::new(GuildCache::new()),
            None,
        );
        for expected in 0..3u32 {
            let (transport, _tx) = FakeTransport::pair();
            let shard = cluster.add_shard(transport);
            assert_eq!(shard.shard_id(), expected);
        }
        assert_eq!(cluster.shards().len(), 3);
    }
}
