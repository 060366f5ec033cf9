//! Relay Endpoints

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{is_transient_io, RelayError};
use crate::protocol::{Command, FramedChannel};

/// What one bounded read from an endpoint produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Payload bytes (possibly empty for a zero-length DATA frame)
    Data(Bytes),
    /// Orderly end of stream from a plain socket
    Eof,
    /// CLOSE received from a framed peer
    Close,
    /// CONNECT received from a framed peer
    Connect,
    /// Nothing arrived within the poll interval
    Idle,
}

/// One side of a session: a plain stream, or the control channel borrowed for the
/// lifetime of the session
pub enum Endpoint<'a, S> {
    Plain(S),
    Framed(&'a mut FramedChannel<S>),
}

impl<'a, S> Endpoint<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn is_framed(&self) -> bool {
        matches!(self, Endpoint::Framed(_))
    }

    /// Read whatever is available within `wait`
    pub async fn recv(&mut self, buf: &mut [u8], wait: Duration) -> Result<Inbound, RelayError> {
        match self {
            Endpoint::Plain(stream) => match timeout(wait, stream.read(buf)).await {
                Err(_) => Ok(Inbound::Idle),
                Ok(Ok(0)) => Ok(Inbound::Eof),
                Ok(Ok(n)) => Ok(Inbound::Data(Bytes::copy_from_slice(&buf[..n]))),
                Ok(Err(e)) if is_transient_io(&e) => Ok(Inbound::Idle),
                Ok(Err(e)) => Err(e.into()),
            },
            Endpoint::Framed(channel) => match channel.recv_frame_timeout(wait).await {
                Ok(None) => Ok(Inbound::Idle),
                Ok(Some(frame)) => Ok(match frame.command {
                    Command::Data => Inbound::Data(frame.payload),
                    Command::Close => Inbound::Close,
                    Command::Connect => Inbound::Connect,
                }),
                Err(e) if e.is_transient() => Ok(Inbound::Idle),
                Err(e) => Err(e),
            },
        }
    }

    /// Deliver `data`, wrapped in a DATA frame when framed
    pub async fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Endpoint::Plain(stream) => stream.write_all(data).await,
            Endpoint::Framed(channel) => channel.send_data(data).await,
        }
    }

    /// Best-effort CLOSE toward a framed peer; plain endpoints have nothing to signal.
    ///
    /// Returns whether a CLOSE frame was written.
    pub async fn signal_close(&mut self) -> bool {
        match self {
            Endpoint::Plain(_) => false,
            Endpoint::Framed(channel) => match channel.send_control(Command::Close).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to send CLOSE on control channel: {}", e);
                    false
                }
            },
        }
    }

    /// Propagate a half-close: stop writing to a plain peer
    pub async fn shutdown_write(&mut self) {
        if let Endpoint::Plain(stream) = self {
            if let Err(e) = stream.shutdown().await {
                debug!("Half-close shutdown failed: {}", e);
            }
        }
    }

    /// Release the endpoint. Plain streams are shut down and dropped; the control
    /// channel stays open for the next session.
    pub async fn close(self) {
        if let Endpoint::Plain(mut stream) = self {
            if let Err(e) = stream.shutdown().await {
                debug!("Endpoint shutdown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_plain_recv_states() {
        let (a, mut b) = duplex(64);
        let mut endpoint = Endpoint::Plain(a);
        let mut buf = [0u8; 16];

        assert_eq!(endpoint.recv(&mut buf, WAIT).await.unwrap(), Inbound::Idle);

        b.write_all(b"ping").await.unwrap();
        assert_eq!(
            endpoint.recv(&mut buf, WAIT).await.unwrap(),
            Inbound::Data(Bytes::from_static(b"ping"))
        );

        drop(b);
        assert_eq!(endpoint.recv(&mut buf, WAIT).await.unwrap(), Inbound::Eof);
    }

    #[tokio::test]
    async fn test_framed_recv_states() {
        let (a, b) = duplex(64);
        let mut channel = FramedChannel::new(a);
        let mut peer = FramedChannel::new(b);
        let mut buf = [0u8; 16];

        peer.send_data(b"x").await.unwrap();
        peer.send_control(Command::Connect).await.unwrap();
        peer.send_control(Command::Close).await.unwrap();

        let mut endpoint = Endpoint::Framed(&mut channel);
        assert!(endpoint.is_framed());
        assert_eq!(
            endpoint.recv(&mut buf, WAIT).await.unwrap(),
            Inbound::Data(Bytes::from_static(b"x"))
        );
        assert_eq!(endpoint.recv(&mut buf, WAIT).await.unwrap(), Inbound::Connect);
        assert_eq!(endpoint.recv(&mut buf, WAIT).await.unwrap(), Inbound::Close);
        assert_eq!(endpoint.recv(&mut buf, WAIT).await.unwrap(), Inbound::Idle);
    }

    #[tokio::test]
    async fn test_signal_close_only_for_framed() {
        let (a, _b) = duplex(64);
        let mut plain = Endpoint::Plain(a);
        assert!(!plain.signal_close().await);

        let (c, d) = duplex(64);
        let mut channel = FramedChannel::new(c);
        let mut peer = FramedChannel::new(d);
        let mut framed = Endpoint::Framed(&mut channel);
        assert!(framed.signal_close().await);
        assert_eq!(peer.recv_frame().await.unwrap(), crate::protocol::Frame::close());
    }
}
