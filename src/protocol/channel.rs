//! Framed Control Channel

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::codec::{decode_frame, encode_frame, truncation_error};
use super::{Command, Frame};
use crate::error::RelayError;
use crate::protocol::constants::*;

/// Frame-oriented view over one control connection.
///
/// Incoming bytes are buffered inside the channel until a complete frame is available, so
/// a receive abandoned half-way (for example by a timeout) never loses partial input.
pub struct FramedChannel<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a connected stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(FRAME_HEADER_LEN + DEFAULT_CHUNK_SIZE),
            write_buf: BytesMut::with_capacity(FRAME_HEADER_LEN + DEFAULT_CHUNK_SIZE),
        }
    }

    /// Get a reference to the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Send a DATA frame carrying `data`
    pub async fn send_data(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write_buf.clear();
        self.write_buf.reserve(FRAME_HEADER_LEN + data.len());
        self.write_buf.extend_from_slice(&[CMD_DATA]);
        self.write_buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.write_buf.extend_from_slice(data);
        self.flush_write_buf().await
    }

    /// Send a zero-length CONNECT or CLOSE frame
    pub async fn send_control(&mut self, command: Command) -> std::io::Result<()> {
        debug_assert!(command.is_control(), "DATA frames go through send_data");
        debug!("Sending {} frame", command);
        self.send_frame(&Frame::control(command)).await
    }

    /// Send an arbitrary frame
    pub async fn send_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        self.write_buf.clear();
        encode_frame(frame, &mut self.write_buf);
        self.flush_write_buf().await
    }

    async fn flush_write_buf(&mut self) -> std::io::Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await
    }

    /// Wait for the next complete frame.
    ///
    /// This is cancellation safe. A clean end of stream between frames yields
    /// [`RelayError::ChannelClosed`]; an end of stream inside a frame yields a truncation
    /// protocol error.
    pub async fn recv_frame(&mut self) -> Result<Frame, RelayError> {
        loop {
            if let Some(frame) = decode_frame(&mut self.read_buf)? {
                trace!(command = %frame.command, len = frame.payload.len(), "Received frame");
                return Ok(frame);
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Err(RelayError::ChannelClosed);
                }
                return Err(truncation_error(&self.read_buf).into());
            }
        }
    }

    /// Wait at most `wait` for the next frame; `Ok(None)` means no frame is available yet
    pub async fn recv_frame_timeout(&mut self, wait: Duration) -> Result<Option<Frame>, RelayError> {
        match timeout(wait, self.recv_frame()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Drop every frame that can be read without waiting, malformed ones included.
    ///
    /// Returns the number of frames discarded. Partial input stays buffered.
    pub async fn discard_pending(&mut self) -> Result<usize, RelayError> {
        let mut discarded = 0;
        loop {
            match self.recv_frame_timeout(Duration::ZERO).await {
                Ok(Some(frame)) => {
                    debug!(command = %frame.command, len = frame.payload.len(), "Discarding stale frame");
                }
                Ok(None) => return Ok(discarded),
                Err(RelayError::Protocol(e)) if e.is_recoverable() => {
                    debug!("Discarding malformed stale frame: {}", e);
                }
                Err(e) => return Err(e),
            }
            discarded += 1;
        }
    }

    /// Bytes received but not yet decoded into a frame
    pub fn pending_input(&self) -> usize {
        self.read_buf.len()
    }

    /// Shut down the write half of the underlying stream
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}
