//! Test doubles for the gateway unit tests: a scripted transport, a
//! recording dispatcher, and a recording voice connector.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{watch, Notify};

use lanyard_cache::GuildCache;
use lanyard_models::intents::Intents;

use crate::cluster::ClusterShared;
use crate::dispatch::EventDispatcher;
use crate::error::TransportError;
use crate::transport::{Transport, TransportState};
use crate::voice::{VoiceConnector, VoiceSession};

const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// In-memory transport: inbound frames arrive over a channel, outbound
/// frames are recorded. Cloning shares the underlying connection, so
/// tests can inspect what the shard sent.
#[derive(Clone)]
pub(crate) struct FakeTransport {
    inner: Arc<FakeInner>,
}

struct FakeInner {
    frames: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    sent: Mutex<Vec<String>>,
    state: AtomicU8,
    close_code: AtomicU16,
    connects: AtomicU32,
    closed: Notify,
}

impl FakeTransport {
    pub fn pair() -> (Self, UnboundedSender<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(FakeInner {
                frames: tokio::sync::Mutex::new(rx),
                sent: Mutex::new(Vec::new()),
                state: AtomicU8::new(STATE_CLOSED),
                close_code: AtomicU16::new(0),
                connects: AtomicU32::new(0),
                closed: Notify::new(),
            }),
        };
        (transport, tx)
    }

    pub fn sent(&self) -> Vec<String> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .map(|frame| serde_json::from_str(frame).unwrap())
            .collect()
    }

    pub fn connects(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn set_close_code(&self, code: u16) {
        self.inner.close_code.store(code, Ordering::SeqCst);
    }
}

impl Transport for FakeTransport {
    fn connect(&self, _url: &str) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            self.inner.close_code.store(0, Ordering::SeqCst);
            self.inner.state.store(STATE_CONNECTED, Ordering::SeqCst);
            self.inner.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn next_frame(&self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send {
        async move {
            loop {
                if self.state() == TransportState::Closed {
                    return Ok(None);
                }
                let mut frames = self.inner.frames.lock().await;
                tokio::select! {
                    frame = frames.recv() => return Ok(frame),
                    _ = self.inner.closed.notified() => {
                        // Re-check the state: a stale close permit from a
                        // previous connection is not a close.
                        drop(frames);
                        continue;
                    }
                }
            }
        }
    }

    fn send(&self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            if self.state() != TransportState::Connected {
                return Err(TransportError::NotConnected);
            }
            self.inner.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        async move {
            self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
            self.inner.closed.notify_one();
        }
    }

    fn state(&self) -> TransportState {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_CONNECTED => TransportState::Connected,
            STATE_CLOSED => TransportState::Closed,
            _ => TransportState::Connecting,
        }
    }

    fn close_code(&self) -> Option<u16> {
        match self.inner.close_code.load(Ordering::SeqCst) {
            0 => None,
            code => Some(code),
        }
    }
}

#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    pub events: Mutex<Vec<(u32, String)>>,
}

impl EventDispatcher for RecordingDispatcher {
    fn handle_event(&self, shard_id: u32, event: &str, _envelope: &Value, _raw: &str) {
        self.events.lock().unwrap().push((shard_id, event.to_string()));
    }
}

#[derive(Default)]
pub(crate) struct RecordingConnector {
    pub sessions: Mutex<Vec<VoiceSession>>,
}

impl VoiceConnector for RecordingConnector {
    fn connect(&self, session: VoiceSession) {
        self.sessions.lock().unwrap().push(session);
    }
}

pub(crate) struct TestCluster {
    pub shared: Arc<ClusterShared>,
    pub shutdown: watch::Sender<bool>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub connector: Arc<RecordingConnector>,
    pub cache: Arc<GuildCache>,
}

pub(crate) fn test_cluster(compressed: bool, intents: Intents) -> TestCluster {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let connector = Arc::new(RecordingConnector::default());
    let cache = Arc::new(GuildCache::new());
    let shared = Arc::new(ClusterShared {
        token: "test-token".to_string(),
        intents,
        max_shards: 1,
        compressed,
        identify_gate_secs: 5,
        last_identify: AtomicI64::new(0),
        dispatcher: dispatcher.clone() as Arc<dyn EventDispatcher>,
        cache: cache.clone(),
        voice: Some(connector.clone() as Arc<dyn VoiceConnector>),
        shutdown: shutdown_rx,
    });
    TestCluster {
        shared,
        shutdown,
        dispatcher,
        connector,
        cache,
    }
}

/// Poll `condition` until it holds or a 5 second deadline passes.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
