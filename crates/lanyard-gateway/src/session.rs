//! Per-shard session state shared between the reader task and the ticker.
//!
//! Every scalar here is written by the reader and read by the ticker (or
//! vice versa), so each is an explicit atomic; the session id is the one
//! non-word field and sits behind a mutex held only for O(1) copies.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Handshaking,
    HelloReceived,
    Identifying,
    Resuming,
    Ready,
    Reconnecting,
    Invalidated,
    Fatal,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Handshaking,
            2 => SessionState::HelloReceived,
            3 => SessionState::Identifying,
            4 => SessionState::Resuming,
            5 => SessionState::Ready,
            6 => SessionState::Reconnecting,
            7 => SessionState::Invalidated,
            8 => SessionState::Fatal,
            _ => SessionState::Disconnected,
        }
    }
}

pub struct Session {
    state: AtomicU8,
    session_id: Mutex<String>,
    last_sequence: AtomicU64,
    heartbeat_interval_ms: AtomicU64,
    last_heartbeat_sent: AtomicI64,
    last_heartbeat_ack: AtomicI64,
    connect_time: AtomicI64,
    reconnects: AtomicU64,
    resumes: AtomicU64,
    ready: AtomicBool,
    decompressed_total: AtomicU64,
}

impl Session {
    pub fn new(now: i64) -> Self {
        Self {
            state: AtomicU8::new(SessionState::Disconnected as u8),
            session_id: Mutex::new(String::new()),
            last_sequence: AtomicU64::new(0),
            heartbeat_interval_ms: AtomicU64::new(0),
            last_heartbeat_sent: AtomicI64::new(now),
            last_heartbeat_ack: AtomicI64::new(now),
            connect_time: AtomicI64::new(0),
            reconnects: AtomicU64::new(0),
            resumes: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            decompressed_total: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().unwrap().clone()
    }

    pub fn set_session_id(&self, session_id: &str) {
        *self.session_id.lock().unwrap() = session_id.to_string();
    }

    /// A non-empty session id and a non-zero sequence together authorize
    /// RESUME; anything less means a full IDENTIFY.
    pub fn resumable(&self) -> bool {
        self.last_sequence() > 0 && !self.session_id.lock().unwrap().is_empty()
    }

    /// Forget the resumable session, forcing the next HELLO to identify.
    pub fn clear_resume_state(&self) {
        self.session_id.lock().unwrap().clear();
        self.last_sequence.store(0, Ordering::SeqCst);
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    pub fn set_last_sequence(&self, sequence: u64) {
        self.last_sequence.store(sequence, Ordering::SeqCst);
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms.load(Ordering::SeqCst)
    }

    pub fn set_heartbeat_interval_ms(&self, interval: u64) {
        self.heartbeat_interval_ms.store(interval, Ordering::SeqCst);
    }

    pub fn last_heartbeat_sent(&self) -> i64 {
        self.last_heartbeat_sent.load(Ordering::SeqCst)
    }

    pub fn set_last_heartbeat_sent(&self, at: i64) {
        self.last_heartbeat_sent.store(at, Ordering::SeqCst);
    }

    pub fn last_heartbeat_ack(&self) -> i64 {
        self.last_heartbeat_ack.load(Ordering::SeqCst)
    }

    pub fn set_last_heartbeat_ack(&self, at: i64) {
        self.last_heartbeat_ack.store(at, Ordering::SeqCst);
    }

    pub fn connect_time(&self) -> i64 {
        self.connect_time.load(Ordering::SeqCst)
    }

    pub fn set_connect_time(&self, at: i64) {
        self.connect_time.store(at, Ordering::SeqCst);
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resumes(&self) -> u64 {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn increment_resumes(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn decompressed_total(&self) -> u64 {
        self.decompressed_total.load(Ordering::SeqCst)
    }

    pub fn add_decompressed(&self, bytes: u64) {
        self.decompressed_total.fetch_add(bytes, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_requires_both_session_and_sequence() {
        let session = Session::new(0);
        assert!(!session.resumable());
        session.set_session_id("abc");
        assert!(!session.resumable());
        session.set_last_sequence(42);
        assert!(session.resumable());
        session.clear_resume_state();
        assert!(!session.resumable());
        assert_eq!(session.last_sequence(), 0);
        assert!(session.session_id().is_empty());
    }

    #[test]
    fn state_round_trips_through_storage() {
        let session = Session::new(0);
        assert_eq!(session.state(), SessionState::Disconnected);
        for state in [
            SessionState::Handshaking,
            SessionState::HelloReceived,
            SessionState::Identifying,
            SessionState::Resuming,
            SessionState::Ready,
            SessionState::Reconnecting,
            SessionState::Invalidated,
            SessionState::Fatal,
        ] {
            session.set_state(state);
            assert_eq!(session.state(), state);
        }
    }
}
