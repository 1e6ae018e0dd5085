use lanyard_models::close_code::{
    CODE_ZLIB_DATA_ERROR, CODE_ZLIB_MEMORY_ERROR, CODE_ZLIB_STREAM_ERROR,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("transport is not connected")]
    NotConnected,
}

/// Failures from the streaming zlib inflater. Each maps to a synthetic
/// close code reported through the shard's error path.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("zlib stream error")]
    Stream,
    #[error("zlib data error: {0}")]
    Data(String),
    #[error("zlib memory error")]
    Memory,
}

impl CodecError {
    pub fn close_code(&self) -> u16 {
        match self {
            CodecError::Stream => CODE_ZLIB_STREAM_ERROR,
            CodecError::Data(_) => CODE_ZLIB_DATA_ERROR,
            CodecError::Memory => CODE_ZLIB_MEMORY_ERROR,
        }
    }
}

/// The only error a shard supervisor surfaces. Transport and codec
/// failures never escape the supervisor: they are converted into
/// close-and-reconnect, and user code hears about them through the log.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway rejected the session with a code that cannot succeed
    /// on retry; the shard has shut down.
    #[error("gateway closed with fatal code {code}: {description}")]
    Fatal { code: u16, description: &'static str },
}
