//! The event-dispatch seam between the session layer and the bot.

use serde_json::Value;

/// Receives every op-0 dispatch a shard decodes. `event` is the envelope's
/// `t` field, `envelope` the full decoded frame, `raw` the frame text as it
/// came off the wire (after inflation).
///
/// Called inline on the shard's reader task: implementations that do real
/// work should hand the event off to their own task or channel.
pub trait EventDispatcher: Send + Sync {
    fn handle_event(&self, shard_id: u32, event: &str, envelope: &Value, raw: &str);
}

/// Dispatcher for bots that only want the session-level side effects
/// (voice bookkeeping, ready tracking) and no event stream.
pub struct NullDispatcher;

impl EventDispatcher for NullDispatcher {
    fn handle_event(&self, _shard_id: u32, _event: &str, _envelope: &Value, _raw: &str) {}
}
