//! Discord gateway shard client.
//!
//! Each [`Shard`] owns one authenticated, resumable, heartbeated WebSocket
//! session against the real-time gateway; a [`Cluster`] owns many shards
//! plus the cluster-wide identify throttle and the one-second ticker that
//! drives heartbeats and outbound rate limiting.

pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inflate;
pub mod queue;
pub mod session;
pub mod shard;
pub mod transport;
pub mod voice;

pub use cluster::{Cluster, ClusterOptions};
pub use dispatch::{EventDispatcher, NullDispatcher};
pub use error::{CodecError, GatewayError, TransportError};
pub use inflate::Inflater;
pub use session::SessionState;
pub use shard::Shard;
pub use transport::{Transport, TransportState, TungsteniteTransport};
pub use voice::{VoiceConnection, VoiceConnector, VoiceSession};

#[cfg(test)]
pub(crate) mod testutil;
