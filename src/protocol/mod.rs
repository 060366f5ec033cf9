//! Control Channel Protocol
//! 
//! Wire framing used between the tunnel front-listener and the reverse agent.

pub mod channel;
pub mod codec;
pub mod constants;
pub mod types;

pub use channel::FramedChannel;
pub use codec::{decode_frame, encode_frame};
pub use constants::*;
pub use types::*;
