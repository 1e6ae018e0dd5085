//! Streaming zlib inflation for the gateway's `zlib-stream` transport mode.
//!
//! Compressed gateway traffic is one continuous zlib stream for the life
//! of a connection; each logical message ends with a sync-flush trailer.
//! The inflate context therefore lives exactly as long as the connection:
//! the supervisor builds a fresh [`Inflater`] on every (re)connect.

use flate2::{Decompress, FlushDecompress, Status};

use crate::error::CodecError;

/// zlib sync-flush trailer marking a logical message boundary.
const ZLIB_SYNC_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const STAGING_BUFFER_SIZE: usize = 512 * 1024;

pub struct Inflater {
    stream: Decompress,
    staging: Box<[u8]>,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            stream: Decompress::new(true),
            staging: vec![0u8; STAGING_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// Whether `buf` holds a complete compressed message: the gateway only
    /// sync-flushes at message boundaries, so anything not ending in the
    /// trailer is a partial frame the caller must keep accumulating.
    pub fn is_message_complete(buf: &[u8]) -> bool {
        buf.len() >= ZLIB_SYNC_TRAILER.len() && buf[buf.len() - ZLIB_SYNC_TRAILER.len()..] == ZLIB_SYNC_TRAILER
    }

    /// Inflate one complete compressed message into its UTF-8 text payload.
    pub fn inflate(&mut self, buf: &[u8]) -> Result<String, CodecError> {
        let mut decompressed = Vec::new();
        let mut consumed = 0usize;
        loop {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();
            self.stream
                .decompress(&buf[consumed..], &mut self.staging, FlushDecompress::None)
                .map_err(|err| CodecError::Data(err.to_string()))?;
            let read = (self.stream.total_in() - before_in) as usize;
            let wrote = (self.stream.total_out() - before_out) as usize;
            consumed += read;
            decompressed.extend_from_slice(&self.staging[..wrote]);

            if wrote == self.staging.len() {
                // Staging buffer filled; more output is pending.
                continue;
            }
            if wrote == 0 && read == 0 && consumed < buf.len() {
                // No progress with input remaining: the stream context is
                // out of sync with the data.
                return Err(CodecError::Stream);
            }
            break;
        }
        String::from_utf8(decompressed)
            .map_err(|_| CodecError::Data("inflated payload is not valid UTF-8".to_string()))
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}
