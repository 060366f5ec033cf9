//! Control Channel Protocol Constants

// Frame commands
pub const CMD_DATA: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_CLOSE: u8 = 0x02;

// Header layout: command (1 byte) + big-endian payload length (4 bytes)
pub const FRAME_HEADER_LEN: usize = 5;

// Upper bound on a declared DATA payload. Senders never exceed the relay chunk size,
// so anything this large is treated as a corrupted stream.
pub const MAX_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024;

// Default relay chunk size
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
