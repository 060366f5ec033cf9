//! Control Channel Protocol Types

use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::protocol::constants::*;

/// Frame commands carried on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Payload bytes for the active session
    Data,
    /// Front-listener asks the agent to open the destination connection
    Connect,
    /// Tear down the active session
    Close,
}

impl Command {
    /// Get the wire code for this command
    pub fn code(&self) -> u8 {
        match self {
            Command::Data => CMD_DATA,
            Command::Connect => CMD_CONNECT,
            Command::Close => CMD_CLOSE,
        }
    }

    /// Whether frames with this command are signals without payload
    pub fn is_control(&self) -> bool {
        !matches!(self, Command::Data)
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            CMD_DATA => Ok(Command::Data),
            CMD_CONNECT => Ok(Command::Connect),
            CMD_CLOSE => Ok(Command::Close),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Data => write!(f, "DATA"),
            Command::Connect => write!(f, "CONNECT"),
            Command::Close => write!(f, "CLOSE"),
        }
    }
}

/// One protocol unit on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Bytes,
}

impl Frame {
    /// Create a DATA frame
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            command: Command::Data,
            payload: payload.into(),
        }
    }

    /// Create a CONNECT frame
    pub fn connect() -> Self {
        Self::control(Command::Connect)
    }

    /// Create a CLOSE frame
    pub fn close() -> Self {
        Self::control(Command::Close)
    }

    /// Create a zero-length frame for the given command
    pub fn control(command: Command) -> Self {
        Self {
            command,
            payload: Bytes::new(),
        }
    }

    /// Size of this frame on the wire
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }
}
