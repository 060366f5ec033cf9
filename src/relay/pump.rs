//! Duplex Pump
//!
//! Moves bytes between a plain local stream and a remote endpoint by alternating between
//! the two read directions. A direction keeps the turn while it produces data and hands
//! it over when a bounded read comes back empty. An endpoint that reported end of stream
//! is marked half-closed; when its turn comes around again the session terminates.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::endpoint::{Endpoint, Inbound};
use super::session::{RelaySession, SessionState, Side};
use crate::error::{ProtocolError, RelayError};
use crate::protocol::constants::DEFAULT_CHUNK_SIZE;

/// Default bound on one read before the turn passes to the other direction
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Local side closed and stayed closed for a full round
    LocalClosed,
    /// Plain remote side closed and stayed closed for a full round
    RemoteClosed,
    /// Framed peer sent CLOSE
    PeerClose,
    /// Framed peer sent malformed or truncated traffic
    Protocol(ProtocolError),
    /// Hard I/O error on the local stream
    LocalError(io::ErrorKind),
    /// Hard I/O error on a plain remote stream
    RemoteError(io::ErrorKind),
    /// The control channel failed or was closed by the peer
    ChannelLost,
}

impl TerminationReason {
    /// Whether the control channel can carry another session afterwards.
    ///
    /// Truncated or oversized frames leave the byte stream out of frame alignment, so they
    /// count as lost.
    pub fn control_channel_usable(&self) -> bool {
        match self {
            TerminationReason::ChannelLost => false,
            TerminationReason::Protocol(e) => e.is_recoverable(),
            _ => true,
        }
    }

    /// Whether a CLOSE should be sent to a framed remote
    fn should_signal_close(&self) -> bool {
        matches!(
            self,
            TerminationReason::LocalClosed
                | TerminationReason::RemoteClosed
                | TerminationReason::LocalError(_)
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::LocalClosed => write!(f, "local closed"),
            TerminationReason::RemoteClosed => write!(f, "remote closed"),
            TerminationReason::PeerClose => write!(f, "peer sent CLOSE"),
            TerminationReason::Protocol(e) => write!(f, "protocol error: {}", e),
            TerminationReason::LocalError(kind) => write!(f, "local i/o error: {:?}", kind),
            TerminationReason::RemoteError(kind) => write!(f, "remote i/o error: {:?}", kind),
            TerminationReason::ChannelLost => write!(f, "control channel lost"),
        }
    }
}

/// Result of one pump run
#[derive(Debug, Clone)]
pub struct PumpOutcome {
    pub reason: TerminationReason,
    pub state: SessionState,
    pub close_sent: bool,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Result of a single turn
enum Turn {
    Forwarded(usize),
    Idle,
    Eof,
    Close,
    StrayConnect,
    ReadFailed(RelayError),
    WriteFailed(io::Error),
}

/// Bidirectional copy engine shared by every relay role
#[derive(Debug, Clone)]
pub struct DuplexPump {
    chunk_size: usize,
    poll_interval: Duration,
}

impl Default for DuplexPump {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_POLL_INTERVAL)
    }
}

impl DuplexPump {
    pub fn new(chunk_size: usize, poll_interval: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            poll_interval,
        }
    }

    /// Create a pump from the server configuration
    pub fn from_config(config: &crate::config::ServerConfig) -> Self {
        Self::new(config.buffer_size, config.poll_interval)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run a session until both directions are done or an I/O error ends it.
    ///
    /// `local` is always closed on return. A framed `remote` is only borrowed and stays
    /// open; a plain `remote` is closed.
    pub async fn run<L, R>(
        &self,
        session: &RelaySession,
        local: L,
        mut remote: Endpoint<'_, R>,
    ) -> PumpOutcome
    where
        L: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + AsyncWrite + Unpin,
    {
        let mut local: Endpoint<'_, L> = Endpoint::Plain(local);
        let mut state = SessionState::new();
        let mut buf = vec![0u8; self.chunk_size];

        debug!(session_id = %session.session_id, framed = remote.is_framed(), "Pump started");

        let reason = loop {
            let side = state.direction;

            // Second observation of a closed endpoint ends the session
            if state.is_closed(side) {
                break match side {
                    Side::Local => TerminationReason::LocalClosed,
                    Side::Remote => TerminationReason::RemoteClosed,
                };
            }

            let turn = match side {
                Side::Local => self.turn(&mut buf, &mut local, &mut remote).await,
                Side::Remote => self.turn(&mut buf, &mut remote, &mut local).await,
            };

            match turn {
                Turn::Forwarded(n) => session.record_transfer(side, n),
                Turn::Idle => state.flip(),
                Turn::Eof => {
                    debug!(session_id = %session.session_id, side = %side, "Half-close observed");
                    state.mark_closed(side);
                    match side {
                        Side::Local => remote.shutdown_write().await,
                        Side::Remote => local.shutdown_write().await,
                    }
                    state.flip();
                }
                Turn::Close => break TerminationReason::PeerClose,
                Turn::StrayConnect => {
                    warn!(session_id = %session.session_id, "Ignoring CONNECT received during an active session");
                }
                Turn::ReadFailed(e) => break read_failure(side, remote.is_framed(), e),
                Turn::WriteFailed(e) => break write_failure(side.other(), remote.is_framed(), e),
            }
        };

        let close_sent = if remote.is_framed() && reason.should_signal_close() {
            remote.signal_close().await
        } else {
            false
        };

        local.close().await;
        remote.close().await;

        debug!(session_id = %session.session_id, reason = %reason, close_sent, "Pump finished");

        PumpOutcome {
            reason,
            state,
            close_sent,
            bytes_up: session.bytes_up(),
            bytes_down: session.bytes_down(),
        }
    }

    async fn turn<X, Y>(
        &self,
        buf: &mut [u8],
        from: &mut Endpoint<'_, X>,
        to: &mut Endpoint<'_, Y>,
    ) -> Turn
    where
        X: AsyncRead + AsyncWrite + Unpin,
        Y: AsyncRead + AsyncWrite + Unpin,
    {
        match from.recv(buf, self.poll_interval).await {
            Ok(Inbound::Data(data)) => match to.send(&data).await {
                Ok(()) => Turn::Forwarded(data.len()),
                Err(e) => Turn::WriteFailed(e),
            },
            Ok(Inbound::Idle) => Turn::Idle,
            Ok(Inbound::Eof) => Turn::Eof,
            Ok(Inbound::Close) => Turn::Close,
            Ok(Inbound::Connect) => Turn::StrayConnect,
            Err(e) => Turn::ReadFailed(e),
        }
    }
}

fn read_failure(side: Side, remote_framed: bool, err: RelayError) -> TerminationReason {
    match (side, err) {
        (_, RelayError::Protocol(e)) => TerminationReason::Protocol(e),
        (Side::Remote, _) if remote_framed => TerminationReason::ChannelLost,
        (Side::Local, e) => TerminationReason::LocalError(error_kind(&e)),
        (Side::Remote, e) => TerminationReason::RemoteError(error_kind(&e)),
    }
}

fn write_failure(side: Side, remote_framed: bool, err: io::Error) -> TerminationReason {
    match side {
        Side::Remote if remote_framed => TerminationReason::ChannelLost,
        Side::Remote => TerminationReason::RemoteError(err.kind()),
        Side::Local => TerminationReason::LocalError(err.kind()),
    }
}

fn error_kind(err: &RelayError) -> io::ErrorKind {
    match err {
        RelayError::Io(e) => e.kind(),
        RelayError::ChannelClosed => io::ErrorKind::UnexpectedEof,
        _ => io::ErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Frame, FramedChannel};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn session() -> RelaySession {
        RelaySession::new(
            "127.0.0.1:1000".parse().unwrap(),
            "127.0.0.1:2000".parse().unwrap(),
        )
    }

    fn pump() -> DuplexPump {
        DuplexPump::new(4096, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_plain_to_plain_double_close() {
        let (local, mut local_peer) = duplex(4096);
        let (remote, mut remote_peer) = duplex(4096);

        local_peer.write_all(b"up").await.unwrap();
        local_peer.shutdown().await.unwrap();

        let session = session();
        let handle = tokio::spawn(async move {
            let mut got = Vec::new();
            remote_peer.read_to_end(&mut got).await.unwrap();
            got
        });

        let outcome = pump().run(&session, local, Endpoint::Plain(remote)).await;
        assert_eq!(outcome.reason, TerminationReason::LocalClosed);
        assert!(outcome.state.local_closed);
        assert!(!outcome.close_sent);
        assert_eq!(outcome.bytes_up, 2);
        assert_eq!(handle.await.unwrap(), b"up");
    }

    #[tokio::test]
    async fn test_local_close_signals_close_once() {
        let (local, mut local_peer) = duplex(4096);
        let (control, control_peer) = duplex(4096);
        let mut channel = FramedChannel::new(control);
        let mut peer = FramedChannel::new(control_peer);

        local_peer.write_all(b"abc").await.unwrap();
        drop(local_peer);

        let session = session();
        let outcome = pump().run(&session, local, Endpoint::Framed(&mut channel)).await;
        assert_eq!(outcome.reason, TerminationReason::LocalClosed);
        assert!(outcome.close_sent);
        assert!(outcome.reason.control_channel_usable());

        assert_eq!(peer.recv_frame().await.unwrap(), Frame::data(&b"abc"[..]));
        assert_eq!(peer.recv_frame().await.unwrap(), Frame::close());
        let rest = peer.recv_frame_timeout(Duration::from_millis(30)).await.unwrap();
        assert!(rest.is_none(), "nothing may follow CLOSE");
    }

    #[tokio::test]
    async fn test_peer_close_ends_without_reply() {
        let (local, mut local_peer) = duplex(4096);
        let (control, control_peer) = duplex(4096);
        let mut channel = FramedChannel::new(control);
        let mut peer = FramedChannel::new(control_peer);

        peer.send_data(b"down").await.unwrap();
        peer.send_control(Command::Close).await.unwrap();

        let session = session();
        let outcome = pump().run(&session, local, Endpoint::Framed(&mut channel)).await;
        assert_eq!(outcome.reason, TerminationReason::PeerClose);
        assert!(!outcome.close_sent);
        assert_eq!(outcome.bytes_down, 4);

        let mut got = Vec::new();
        local_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"down");

        let rest = peer.recv_frame_timeout(Duration::from_millis(30)).await.unwrap();
        assert!(rest.is_none());
    }

    #[tokio::test]
    async fn test_stray_connect_is_ignored() {
        let (local, mut local_peer) = duplex(4096);
        let (control, control_peer) = duplex(4096);
        let mut channel = FramedChannel::new(control);
        let mut peer = FramedChannel::new(control_peer);

        peer.send_control(Command::Connect).await.unwrap();
        peer.send_data(b"ok").await.unwrap();
        peer.send_control(Command::Close).await.unwrap();

        let session = session();
        let outcome = pump().run(&session, local, Endpoint::Framed(&mut channel)).await;
        assert_eq!(outcome.reason, TerminationReason::PeerClose);

        let mut got = Vec::new();
        local_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ok");
    }

    #[tokio::test]
    async fn test_truncated_frame_counts_as_close() {
        let (local, _local_peer) = duplex(4096);
        let (control, mut control_peer) = duplex(4096);
        let mut channel = FramedChannel::new(control);

        control_peer.write_all(&[0x00, 0, 0, 0, 9, 1, 2]).await.unwrap();
        drop(control_peer);

        let session = session();
        let outcome = pump().run(&session, local, Endpoint::Framed(&mut channel)).await;
        assert!(matches!(
            outcome.reason,
            TerminationReason::Protocol(ProtocolError::Truncated { expected: 14, received: 7 })
        ));
        assert!(!outcome.close_sent);
        assert!(!outcome.reason.control_channel_usable());
    }

    #[tokio::test]
    async fn test_unknown_command_ends_session_only() {
        let (local, mut local_peer) = duplex(4096);
        let (control, mut control_peer) = duplex(4096);
        let mut channel = FramedChannel::new(control);

        // DATA, then a frame with an unknown command byte, then a CONNECT for later
        control_peer.write_all(&[0x00, 0, 0, 0, 2, b'o', b'k']).await.unwrap();
        control_peer.write_all(&[0x09, 0, 0, 0, 1, 0xff]).await.unwrap();
        control_peer.write_all(&[0x01, 0, 0, 0, 0]).await.unwrap();

        let session = session();
        let outcome = pump().run(&session, local, Endpoint::Framed(&mut channel)).await;
        assert_eq!(outcome.reason, TerminationReason::Protocol(ProtocolError::UnknownCommand(9)));
        assert!(!outcome.close_sent);
        assert!(outcome.reason.control_channel_usable());

        let mut got = Vec::new();
        local_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ok");

        assert_eq!(channel.recv_frame().await.unwrap(), Frame::connect());
    }

    #[tokio::test]
    async fn test_control_channel_eof_is_channel_lost() {
        let (local, _local_peer) = duplex(4096);
        let (control, control_peer) = duplex(4096);
        let mut channel = FramedChannel::new(control);
        drop(control_peer);

        let session = session();
        let outcome = pump().run(&session, local, Endpoint::Framed(&mut channel)).await;
        assert_eq!(outcome.reason, TerminationReason::ChannelLost);
        assert!(!outcome.close_sent);
    }

    #[tokio::test]
    async fn test_alternation_preserves_order() {
        let (local, mut local_peer) = duplex(64 * 1024);
        let (control, control_peer) = duplex(64 * 1024);
        let mut channel = FramedChannel::new(control);
        let mut peer = FramedChannel::new(control_peer);

        let session = session();
        let pump = pump();
        let run = pump.run(&session, local, Endpoint::Framed(&mut channel));

        let script = async {
            // Bursts from both sides separated by quiet gaps
            let mut expected_up = Vec::new();
            let mut expected_down = Vec::new();
            for round in 0u8..5 {
                let up = vec![round; 1000 + round as usize];
                local_peer.write_all(&up).await.unwrap();
                expected_up.extend_from_slice(&up);

                let down = vec![round + 100; 700];
                peer.send_data(&down).await.unwrap();
                expected_down.extend_from_slice(&down);

                tokio::time::sleep(Duration::from_millis(15)).await;
            }

            let mut got_down = vec![0u8; expected_down.len()];
            local_peer.read_exact(&mut got_down).await.unwrap();
            assert_eq!(got_down, expected_down);

            let mut got_up = Vec::new();
            while got_up.len() < expected_up.len() {
                let frame = peer.recv_frame().await.unwrap();
                assert_eq!(frame.command, Command::Data);
                got_up.extend_from_slice(&frame.payload);
            }
            assert_eq!(got_up, expected_up);

            peer.send_control(Command::Close).await.unwrap();
            (expected_up.len() as u64, expected_down.len() as u64)
        };

        let (outcome, (up, down)) = tokio::join!(run, script);
        assert_eq!(outcome.reason, TerminationReason::PeerClose);
        assert_eq!(outcome.bytes_up, up);
        assert_eq!(outcome.bytes_down, down);
    }
}
