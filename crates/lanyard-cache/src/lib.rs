//! Shard-partitioned guild cache shared by every shard in a cluster.
//!
//! The cache is a plain container behind a mutex. Shards read it through
//! [`GuildCache::with_guilds`], which holds the lock for the duration of
//! the iteration; writers (the embedding bot's dispatch handlers) use the
//! insert/remove operations. Scans are linear in cache size.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// One cached guild, keyed by snowflake and tagged with the shard that
/// receives its events.
#[derive(Debug, Clone)]
pub struct GuildRecord {
    pub id: u64,
    pub shard_id: u32,
    /// Set by a GUILD_DELETE with `unavailable: true`; evicted by the next
    /// garbage-collection pass.
    pub unavailable: bool,
    pub members: HashSet<u64>,
    pub channels: HashSet<u64>,
}

impl GuildRecord {
    pub fn new(id: u64, shard_id: u32) -> Self {
        Self {
            id,
            shard_id,
            unavailable: false,
            members: HashSet::new(),
            channels: HashSet::new(),
        }
    }
}

#[derive(Default)]
pub struct GuildCache {
    container: Mutex<HashMap<u64, GuildRecord>>,
}

impl GuildCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: GuildRecord) {
        self.container.lock().unwrap().insert(record.id, record);
    }

    pub fn remove(&self, guild_id: u64) -> Option<GuildRecord> {
        self.container.lock().unwrap().remove(&guild_id)
    }

    pub fn mark_unavailable(&self, guild_id: u64) {
        if let Some(guild) = self.container.lock().unwrap().get_mut(&guild_id) {
            guild.unavailable = true;
        }
    }

    pub fn len(&self) -> usize {
        self.container.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.container.lock().unwrap().is_empty()
    }

    /// Iterate the cache under its lock. The mutex is held until `f`
    /// returns, so keep the closure cheap.
    pub fn with_guilds<R>(&self, f: impl FnOnce(&HashMap<u64, GuildRecord>) -> R) -> R {
        let guilds = self.container.lock().unwrap();
        f(&guilds)
    }

    /// Evict guilds marked unavailable. Invoked by the heartbeat scheduler
    /// once per emitted heartbeat. Returns the number of evicted records.
    pub fn garbage_collect(&self) -> usize {
        let mut guilds = self.container.lock().unwrap();
        let before = guilds.len();
        guilds.retain(|_, guild| !guild.unavailable);
        let evicted = before - guilds.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted unavailable guilds from cache");
        }
        evicted
    }
}
