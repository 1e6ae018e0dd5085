//! Voice-session bookkeeping.
//!
//! Joining a voice channel is a three-way handshake: the shard sends an
//! op-4 voice state update, then the gateway replies with
//! VOICE_SERVER_UPDATE and VOICE_STATE_UPDATE in unspecified order. A
//! [`VoiceConnection`] record accumulates the endpoint, session id, and
//! token as they arrive; once all three are present the external voice
//! client is spawned exactly once, in a detached task that carries only
//! copied fields.

use std::collections::HashMap;
use std::sync::Mutex;

/// Per-guild voice handshake state.
#[derive(Debug, Clone, Default)]
pub struct VoiceConnection {
    pub channel_id: u64,
    /// Voice WebSocket hostname from VOICE_SERVER_UPDATE.
    pub endpoint: String,
    /// Voice session id from VOICE_STATE_UPDATE.
    pub session_id: String,
    /// Voice token from VOICE_SERVER_UPDATE.
    pub token: String,
    /// Whether the external voice client has been spawned.
    pub active: bool,
}

impl VoiceConnection {
    pub fn new(channel_id: u64) -> Self {
        Self {
            channel_id,
            ..Self::default()
        }
    }

    /// All three handshake fields have arrived.
    pub fn is_ready(&self) -> bool {
        !self.endpoint.is_empty() && !self.session_id.is_empty() && !self.token.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Everything a spawned voice client needs, copied out of the shard so the
/// detached task never aliases shard state.
#[derive(Debug, Clone)]
pub struct VoiceSession {
    pub guild_id: u64,
    pub channel_id: u64,
    pub endpoint: String,
    pub session_id: String,
    pub token: String,
}

/// Spawned on a blocking task once a voice record becomes ready.
/// Implementations may perform blocking TLS handshakes; the shard's reader
/// is never stalled by them.
pub trait VoiceConnector: Send + Sync {
    fn connect(&self, session: VoiceSession);
}

/// The shard's voice map: one record per guild, under its own mutex,
/// separate from the outbound-queue lock.
#[derive(Default)]
pub struct VoiceRegistry {
    connections: Mutex<HashMap<u64, VoiceConnection>>,
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record for `guild_id` unless one already exists. Returns
    /// whether a record was created (and an op-4 join should be sent).
    pub fn insert_if_absent(&self, guild_id: u64, channel_id: u64) -> bool {
        let mut connections = self.connections.lock().unwrap();
        if connections.contains_key(&guild_id) {
            return false;
        }
        connections.insert(guild_id, VoiceConnection::new(channel_id));
        true
    }

    pub fn remove(&self, guild_id: u64) -> Option<VoiceConnection> {
        self.connections.lock().unwrap().remove(&guild_id)
    }

    pub fn get(&self, guild_id: u64) -> Option<VoiceConnection> {
        self.connections.lock().unwrap().get(&guild_id).cloned()
    }

    /// Apply a VOICE_SERVER_UPDATE. Returns a spawnable session when this
    /// update completed the handshake.
    pub fn apply_server_update(
        &self,
        guild_id: u64,
        endpoint: &str,
        token: &str,
    ) -> Option<VoiceSession> {
        let mut connections = self.connections.lock().unwrap();
        let connection = connections.get_mut(&guild_id)?;
        connection.endpoint = endpoint.to_string();
        connection.token = token.to_string();
        Self::take_ready(guild_id, connection)
    }

    /// Apply the session id from a VOICE_STATE_UPDATE for our own user.
    /// Returns a spawnable session when this update completed the
    /// handshake.
    pub fn apply_state_update(&self, guild_id: u64, session_id: &str) -> Option<VoiceSession> {
        let mut connections = self.connections.lock().unwrap();
        let connection = connections.get_mut(&guild_id)?;
        connection.session_id = session_id.to_string();
        Self::take_ready(guild_id, connection)
    }

    /// Flip a newly ready record to active, yielding the copied fields for
    /// the detached client. The active flag guarantees exactly one spawn
    /// per record even when updates repeat.
    fn take_ready(guild_id: u64, connection: &mut VoiceConnection) -> Option<VoiceSession> {
        if !connection.is_ready() || connection.is_active() {
            return None;
        }
        connection.active = true;
        Some(VoiceSession {
            guild_id,
            channel_id: connection.channel_id,
            endpoint: connection.endpoint.clone(),
            session_id: connection.session_id.clone(),
            token: connection.token.clone(),
        })
    }
}
