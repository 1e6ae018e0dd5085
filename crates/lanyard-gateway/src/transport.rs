//! The WebSocket seam between a shard and the network.
//!
//! The session layer only ever sees this trait: connect, read one frame,
//! write one text frame, close, state. Closing must promptly unblock a
//! reader parked in [`Transport::next_frame`], because both the liveness
//! check and RECONNECT handling rely on a force-close to get the reader
//! back into the supervisor loop.

use std::future::Future;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Closed,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransportState::Connecting,
            1 => TransportState::Connected,
            _ => TransportState::Closed,
        }
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Establish the WebSocket connection.
    fn connect(&self, url: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the payload of the next text or binary frame. `Ok(None)`
    /// means the connection is gone (server close, stream end, or a local
    /// force-close).
    fn next_frame(&self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Send one text frame.
    fn send(&self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the connection and unblock any reader parked in `next_frame`.
    fn close(&self) -> impl Future<Output = ()> + Send;

    fn state(&self) -> TransportState;

    /// Close code observed from the server on the current connection, if
    /// a close frame carried one.
    fn close_code(&self) -> Option<u16>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Production transport over tokio-tungstenite with rustls.
pub struct TungsteniteTransport {
    sink: Mutex<Option<WsSink>>,
    source: Mutex<Option<WsSource>>,
    state: AtomicU8,
    /// 0 = no close code observed.
    close_code: AtomicU16,
    closed: Notify,
}

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            source: Mutex::new(None),
            state: AtomicU8::new(STATE_CLOSED),
            close_code: AtomicU16::new(0),
            closed: Notify::new(),
        }
    }
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TungsteniteTransport {
    fn connect(&self, url: &str) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            self.state.store(STATE_CONNECTING, Ordering::SeqCst);
            self.close_code.store(0, Ordering::SeqCst);
            let (stream, response) = connect_async(url).await?;
            debug!(status = %response.status(), "gateway websocket handshake complete");
            let (sink, source) = stream.split();
            *self.sink.lock().await = Some(sink);
            *self.source.lock().await = Some(source);
            self.state.store(STATE_CONNECTED, Ordering::SeqCst);
            Ok(())
        }
    }

    fn next_frame(&self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send {
        async move {
            loop {
                if self.state() == TransportState::Closed {
                    return Ok(None);
                }
                let mut source = self.source.lock().await;
                let Some(stream) = source.as_mut() else {
                    return Ok(None);
                };
                let message = tokio::select! {
                    message = stream.next() => message,
                    _ = self.closed.notified() => {
                        // Re-check the state: a stale permit left over from
                        // a previous connection's close is not a close.
                        drop(source);
                        continue;
                    }
                };
                match message {
                    Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                    Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes.to_vec())),
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            self.close_code
                                .store(u16::from(frame.code), Ordering::SeqCst);
                            debug!(code = u16::from(frame.code), reason = %frame.reason,
                                "gateway sent close frame");
                        }
                        self.state.store(STATE_CLOSED, Ordering::SeqCst);
                        return Ok(None);
                    }
                    // Control frames; tungstenite replies to pings on the
                    // next write.
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        self.state.store(STATE_CLOSED, Ordering::SeqCst);
                        return Err(err.into());
                    }
                    None => {
                        self.state.store(STATE_CLOSED, Ordering::SeqCst);
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn send(&self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            let mut sink = self.sink.lock().await;
            let Some(sink) = sink.as_mut() else {
                return Err(TransportError::NotConnected);
            };
            sink.send(Message::text(text)).await?;
            Ok(())
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        async move {
            self.state.store(STATE_CLOSED, Ordering::SeqCst);
            // Never touch `source` here: the reader may hold its lock.
            if let Some(mut sink) = self.sink.lock().await.take() {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
            self.closed.notify_one();
        }
    }

    fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn close_code(&self) -> Option<u16> {
        match self.close_code.load(Ordering::SeqCst) {
            0 => None,
            code => Some(code),
        }
    }
}
