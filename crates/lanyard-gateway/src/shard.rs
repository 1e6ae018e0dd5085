//! A single gateway shard: the protocol engine, the one-second scheduler,
//! and the supervisor loop that keeps the session alive across transport
//! and protocol faults.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use lanyard_models::close_code::{close_code_description, is_fatal_close_code};
use lanyard_models::gateway::{
    EVENT_READY, EVENT_RESUMED, EVENT_VOICE_SERVER_UPDATE, EVENT_VOICE_STATE_UPDATE, OP_DISPATCH,
    OP_HEARTBEAT, OP_HEARTBEAT_ACK, OP_HELLO, OP_IDENTIFY, OP_INVALID_SESSION, OP_RECONNECT,
    OP_RESUME, OP_VOICE_STATE_UPDATE,
};

use crate::cluster::ClusterShared;
use crate::config;
use crate::error::GatewayError;
use crate::inflate::Inflater;
use crate::queue::OutboundQueue;
use crate::session::{Session, SessionState};
use crate::transport::{Transport, TransportState};
use crate::voice::{VoiceConnection, VoiceRegistry, VoiceSession};

/// Pause before retrying a failed connect, so an unreachable endpoint
/// cannot spin the supervisor.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Heartbeats are emitted at this fraction of the server's interval, so
/// scheduling jitter can never push one past the deadline.
const HEARTBEAT_EARLY_FACTOR: f64 = 0.75;

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Messages drained per tick: one on even seconds, two on odd, averaging
/// 1.5/s against the gateway's 120-per-60s budget.
fn drain_budget(now: i64) -> usize {
    ((now % 2) + 1) as usize
}

pub struct Shard<T: Transport> {
    shard_id: u32,
    pub(crate) cluster: Arc<ClusterShared>,
    pub(crate) transport: T,
    pub(crate) session: Session,
    pub(crate) queue: OutboundQueue,
    pub(crate) voice: VoiceRegistry,
    /// Our own user id, captured from READY; voice state updates for other
    /// users are not ours to track.
    pub(crate) user_id: AtomicU64,
}

impl<T: Transport> Shard<T> {
    pub(crate) fn new(shard_id: u32, cluster: Arc<ClusterShared>, transport: T) -> Self {
        Self {
            shard_id,
            cluster,
            transport,
            session: Session::new(unix_now()),
            queue: OutboundQueue::new(),
            voice: VoiceRegistry::new(),
            user_id: AtomicU64::new(0),
        }
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// The supervisor loop: connect, read until disconnect, tear down,
    /// reconnect. Exits only on shutdown or a fatal gateway close code.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let url = config::gateway_url(self.cluster.compressed);
        let mut shutdown = self.cluster.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.session.set_state(SessionState::Handshaking);
            // The zlib context lives exactly as long as one connection.
            let mut inflater = self.cluster.compressed.then(Inflater::new);
            if let Err(err) = self.transport.connect(&url).await {
                warn!(shard = self.shard_id, error = %err, "gateway connect failed, retrying");
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                continue;
            }
            info!(shard = self.shard_id, url = %url, "connected to gateway");

            let mut pending: Vec<u8> = Vec::new();
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!(shard = self.shard_id, "shutdown requested, closing gateway session");
                            self.disconnect().await;
                            self.session.set_state(SessionState::Disconnected);
                            return Ok(());
                        }
                    }
                    frame = self.transport.next_frame() => {
                        match frame {
                            Ok(Some(bytes)) => {
                                pending.extend_from_slice(&bytes);
                                if self.handle_frame(&pending, inflater.as_mut()).await {
                                    pending.clear();
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                warn!(shard = self.shard_id, error = %err, "gateway read failed");
                                break;
                            }
                        }
                    }
                }
            }

            self.disconnect().await;
            if let Some(code) = self.transport.close_code() {
                self.gateway_error(code);
                if is_fatal_close_code(code) {
                    let description = close_code_description(code);
                    error!(shard = self.shard_id, code, description,
                        "fatal gateway close code, shutting shard down");
                    self.session.set_state(SessionState::Fatal);
                    return Err(GatewayError::Fatal { code, description });
                }
            }
            self.session.set_state(SessionState::Reconnecting);
            info!(shard = self.shard_id, "reconnecting to gateway");
        }
    }

    /// Common teardown: close the socket, drop readiness, flush the queue.
    /// Queued user messages are best-effort at this layer and are dropped,
    /// not replayed.
    async fn disconnect(&self) {
        self.transport.close().await;
        self.session.set_ready(false);
        self.queue.clear();
    }

    /// Consume one transport frame. Returns whether `buf` was fully
    /// consumed; `false` means a partial compressed message, and the
    /// caller must append the next frame to the same buffer before
    /// re-invoking.
    pub(crate) async fn handle_frame(&self, buf: &[u8], inflater: Option<&mut Inflater>) -> bool {
        let text = match inflater {
            Some(inflater) => {
                if !Inflater::is_message_complete(buf) {
                    return false;
                }
                match inflater.inflate(buf) {
                    Ok(text) => {
                        self.session.add_decompressed(text.len() as u64);
                        text
                    }
                    Err(err) => {
                        self.gateway_error(err.close_code());
                        self.transport.close().await;
                        return true;
                    }
                }
            }
            None => match std::str::from_utf8(buf) {
                Ok(text) => text.to_string(),
                Err(err) => {
                    error!(shard = self.shard_id, error = %err, "gateway frame is not valid UTF-8");
                    return true;
                }
            },
        };
        self.handle_payload(&text).await;
        true
    }

    async fn handle_payload(&self, text: &str) {
        if config::wire_trace_enabled() {
            trace!(target: "wire", shard = self.shard_id, bytes = text.len(),
                payload = %config::payload_preview(text), "gateway_in");
        }
        let envelope: Value = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                // A malformed frame is dropped; the session stays up.
                error!(shard = self.shard_id, error = %err,
                    payload = %config::payload_preview(text), "dropping unparseable gateway frame");
                return;
            }
        };

        if let Some(sequence) = envelope.get("s").and_then(Value::as_u64) {
            self.session.set_last_sequence(sequence);
        }
        let Some(op) = envelope.get("op").and_then(Value::as_u64) else {
            return;
        };
        match op as u8 {
            OP_DISPATCH => self.handle_dispatch(&envelope, text),
            OP_HEARTBEAT => {
                // Server-requested heartbeat: answer ahead of anything else.
                self.queue_message(self.heartbeat_payload(), true);
            }
            OP_RECONNECT => {
                debug!(shard = self.shard_id, session_id = %self.session.session_id(),
                    "reconnection requested, closing socket");
                self.queue.clear();
                self.session.set_state(SessionState::Reconnecting);
                self.transport.close().await;
            }
            OP_INVALID_SESSION => {
                debug!(shard = self.shard_id, session_id = %self.session.session_id(),
                    "failed to resume session, will reidentify");
                self.session.clear_resume_state();
                self.session.set_state(SessionState::Invalidated);
                // An invalid session re-enters the HELLO path to identify
                // with the just-cleared state.
                self.handle_hello(&envelope).await;
            }
            OP_HELLO => self.handle_hello(&envelope).await,
            OP_HEARTBEAT_ACK => self.session.set_last_heartbeat_ack(unix_now()),
            other => debug!(shard = self.shard_id, op = other, "unhandled gateway opcode"),
        }
    }

    /// The HELLO reaction: capture the heartbeat interval, then either
    /// resume the previous session or identify a new one behind the
    /// cluster-wide gate.
    async fn handle_hello(&self, envelope: &Value) {
        self.session.set_state(SessionState::HelloReceived);
        if let Some(interval) = envelope
            .pointer("/d/heartbeat_interval")
            .and_then(Value::as_u64)
        {
            self.session.set_heartbeat_interval_ms(interval);
        }

        if self.session.resumable() {
            let session_id = self.session.session_id();
            let sequence = self.session.last_sequence();
            debug!(shard = self.shard_id, %session_id, sequence, "resuming session");
            self.session.set_state(SessionState::Resuming);
            let resume = json!({
                "op": OP_RESUME,
                "d": {
                    "token": self.cluster.token,
                    "session_id": session_id,
                    "seq": sequence,
                }
            });
            self.send_now(&resume.to_string()).await;
            self.session.increment_resumes();
        } else {
            let gate = self.cluster.identify_gate_secs;
            loop {
                let last = self.cluster.last_identify.load(Ordering::SeqCst);
                let now = unix_now();
                if now >= last + gate {
                    break;
                }
                let wait = (last + gate - now) as u64;
                debug!(shard = self.shard_id, wait, "waiting before identifying session");
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
            debug!(shard = self.shard_id, "identifying new session");
            self.session.set_state(SessionState::Identifying);
            let mut d = json!({
                "token": self.cluster.token,
                "properties": {
                    "$os": "Linux",
                    "$browser": "lanyard",
                    "$device": "lanyard",
                },
                "shard": [self.shard_id, self.cluster.max_shards],
                "compress": false,
                "large_threshold": config::settings().large_threshold,
            });
            if !self.cluster.intents.is_empty() {
                d["intents"] = json!(self.cluster.intents.bits());
            }
            let identify = json!({"op": OP_IDENTIFY, "d": d});
            self.send_now(&identify.to_string()).await;
            let now = unix_now();
            self.cluster.last_identify.store(now, Ordering::SeqCst);
            self.session.set_connect_time(now);
            self.session.increment_reconnects();
        }
        self.session.set_last_heartbeat_ack(unix_now());
    }

    fn handle_dispatch(&self, envelope: &Value, raw: &str) {
        let event = envelope.get("t").and_then(Value::as_str).unwrap_or_default();
        match event {
            EVENT_READY => self.on_ready(envelope),
            EVENT_RESUMED => {
                self.session.set_ready(true);
                self.session.set_state(SessionState::Ready);
                info!(shard = self.shard_id, session_id = %self.session.session_id(),
                    "session resumed");
            }
            EVENT_VOICE_SERVER_UPDATE => self.on_voice_server_update(envelope),
            EVENT_VOICE_STATE_UPDATE => self.on_voice_state_update(envelope),
            _ => {}
        }
        self.cluster
            .dispatcher
            .handle_event(self.shard_id, event, envelope, raw);
    }

    fn on_ready(&self, envelope: &Value) {
        if let Some(session_id) = envelope.pointer("/d/session_id").and_then(Value::as_str) {
            self.session.set_session_id(session_id);
        }
        if let Some(user_id) = snowflake(envelope.pointer("/d/user/id")) {
            self.user_id.store(user_id, Ordering::SeqCst);
        }
        self.session.set_ready(true);
        self.session.set_state(SessionState::Ready);
        info!(shard = self.shard_id, session_id = %self.session.session_id(),
            "session established");
    }

    fn on_voice_server_update(&self, envelope: &Value) {
        let Some(guild_id) = snowflake(envelope.pointer("/d/guild_id")) else {
            return;
        };
        let endpoint = envelope
            .pointer("/d/endpoint")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let token = envelope
            .pointer("/d/token")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if let Some(ready) = self.voice.apply_server_update(guild_id, endpoint, token) {
            self.spawn_voice_client(ready);
        }
    }

    fn on_voice_state_update(&self, envelope: &Value) {
        let our_user = self.user_id.load(Ordering::SeqCst);
        let Some(user_id) = snowflake(envelope.pointer("/d/user_id")) else {
            return;
        };
        if our_user == 0 || user_id != our_user {
            return;
        }
        let Some(guild_id) = snowflake(envelope.pointer("/d/guild_id")) else {
            return;
        };
        let Some(session_id) = envelope.pointer("/d/session_id").and_then(Value::as_str) else {
            return;
        };
        if let Some(ready) = self.voice.apply_state_update(guild_id, session_id) {
            self.spawn_voice_client(ready);
        }
    }

    /// Hand a completed voice handshake to the external client on a
    /// detached blocking task; its TLS handshakes must never stall the
    /// reader.
    fn spawn_voice_client(&self, session: VoiceSession) {
        let Some(connector) = self.cluster.voice.clone() else {
            debug!(shard = self.shard_id, guild_id = session.guild_id,
                "voice session ready but no voice connector configured");
            return;
        };
        info!(shard = self.shard_id, guild_id = session.guild_id,
            channel_id = session.channel_id, "voice session ready, spawning voice client");
        tokio::task::spawn_blocking(move || connector.connect(session));
    }

    /// One tick of the scheduler. Acts only on a live, ready session:
    /// liveness first, then the rate-limited queue drain, then heartbeat
    /// emission.
    pub async fn one_second_timer(&self) {
        if !self.is_connected() {
            return;
        }
        let now = unix_now();

        // Two missed ACK windows mean the TCP connection is dead even
        // though the socket still looks open.
        let interval_ms = self.session.heartbeat_interval_ms();
        let interval_secs = (interval_ms / 1000) as i64;
        if interval_secs > 0 && now - self.session.last_heartbeat_ack() > interval_secs * 2 {
            warn!(shard = self.shard_id, session_id = %self.session.session_id(),
                "missed heartbeat ACK, forcing reconnection");
            self.queue.clear();
            self.transport.close().await;
            return;
        }

        for _ in 0..drain_budget(now) {
            let Some(message) = self.queue.pop() else {
                break;
            };
            self.send_now(&message).await;
        }

        if interval_ms > 0 && self.session.last_sequence() > 0 {
            let due = self.session.last_heartbeat_sent()
                + (interval_ms as f64 * HEARTBEAT_EARLY_FACTOR / 1000.0) as i64;
            if now > due {
                self.queue_message(self.heartbeat_payload(), true);
                self.session.set_last_heartbeat_sent(now);
                self.cluster.cache.garbage_collect();
            }
        }
    }

    fn heartbeat_payload(&self) -> String {
        let sequence = self.session.last_sequence();
        let d = if sequence > 0 { json!(sequence) } else { Value::Null };
        json!({"op": OP_HEARTBEAT, "d": d}).to_string()
    }

    async fn send_now(&self, message: &str) {
        if let Err(err) = self.transport.send(message).await {
            warn!(shard = self.shard_id, error = %err, "failed to write gateway frame");
        }
    }

    /// Log an error code with its canonical description. Errors never
    /// propagate past this shard; the supervisor handles recovery.
    fn gateway_error(&self, code: u16) {
        warn!(shard = self.shard_id, code,
            description = close_code_description(code), "gateway error");
    }

    /// Enqueue an outbound gateway message. `to_front` is for priority
    /// traffic (heartbeats, voice state updates).
    pub fn queue_message(&self, message: impl Into<String>, to_front: bool) {
        self.queue.push(message.into(), to_front);
    }

    pub fn clear_queue(&self) {
        self.queue.clear();
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Connected means the WebSocket is up and READY or RESUMED has been
    /// observed.
    pub fn is_connected(&self) -> bool {
        self.transport.state() == TransportState::Connected && self.session.ready()
    }

    pub fn uptime(&self) -> Duration {
        let connect_time = self.session.connect_time();
        if connect_time == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs((unix_now() - connect_time).max(0) as u64)
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn reconnects(&self) -> u64 {
        self.session.reconnects()
    }

    pub fn resumes(&self) -> u64 {
        self.session.resumes()
    }

    pub fn decompressed_bytes_in(&self) -> u64 {
        self.session.decompressed_total()
    }

    /// Guilds on this shard. Linear in cache size, under the cache's lock.
    pub fn guild_count(&self) -> u64 {
        self.cluster.cache.with_guilds(|guilds| {
            guilds
                .values()
                .filter(|guild| guild.shard_id == self.shard_id)
                .count() as u64
        })
    }

    pub fn member_count(&self) -> u64 {
        self.cluster.cache.with_guilds(|guilds| {
            guilds
                .values()
                .filter(|guild| guild.shard_id == self.shard_id)
                .map(|guild| guild.members.len() as u64)
                .sum()
        })
    }

    pub fn channel_count(&self) -> u64 {
        self.cluster.cache.with_guilds(|guilds| {
            guilds
                .values()
                .filter(|guild| guild.shard_id == self.shard_id)
                .map(|guild| guild.channels.len() as u64)
                .sum()
        })
    }

    /// Start the voice handshake for a guild. A duplicate call while a
    /// record exists is a no-op. The gateway replies with
    /// VOICE_SERVER_UPDATE and VOICE_STATE_UPDATE, in either order.
    pub fn connect_voice(&self, guild_id: u64, channel_id: u64) {
        if !self.voice.insert_if_absent(guild_id, channel_id) {
            return;
        }
        let join = json!({
            "op": OP_VOICE_STATE_UPDATE,
            "d": {
                "guild_id": guild_id.to_string(),
                "channel_id": channel_id.to_string(),
                "self_mute": false,
                "self_deaf": false,
            }
        });
        self.queue_message(join.to_string(), true);
    }

    /// Leave a guild's voice channel and drop its record.
    pub fn disconnect_voice(&self, guild_id: u64) {
        if self.voice.remove(guild_id).is_none() {
            return;
        }
        let leave = json!({
            "op": OP_VOICE_STATE_UPDATE,
            "d": {
                "guild_id": guild_id.to_string(),
                "channel_id": Value::Null,
                "self_mute": false,
                "self_deaf": false,
            }
        });
        self.queue_message(leave.to_string(), true);
    }

    pub fn voice_connection(&self, guild_id: u64) -> Option<VoiceConnection> {
        self.voice.get(guild_id)
    }
}

fn snowflake(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::String(text) => text.parse().ok(),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}
