//! Frame Encoding and Decoding

use bytes::{Buf, BufMut, BytesMut};

use super::{Command, Frame};
use crate::error::ProtocolError;
use crate::protocol::constants::*;

/// Append the wire form of `frame` to `dst`
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    dst.reserve(frame.encoded_len());
    dst.put_u8(frame.command.code());
    dst.put_u32(frame.payload.len() as u32);
    dst.extend_from_slice(&frame.payload);
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not hold a complete frame yet; nothing is consumed
/// in that case. A complete frame with an unknown command or a payload on a control
/// command is consumed before the error is returned, so the next frame stays aligned.
/// An oversized length cannot be skipped and leaves `src` untouched.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if src.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let code = src[0];
    let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);

    if len > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }

    let total = FRAME_HEADER_LEN + len as usize;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(FRAME_HEADER_LEN);
    let payload = src.split_to(len as usize).freeze();

    let command = Command::try_from(code)?;
    if command.is_control() && len != 0 {
        return Err(ProtocolError::UnexpectedPayload {
            command: control_name(command),
            len,
        });
    }

    Ok(Some(Frame { command, payload }))
}

/// Error for a stream that ended while `pending` still held part of a frame
pub fn truncation_error(pending: &[u8]) -> ProtocolError {
    let expected = if pending.len() < FRAME_HEADER_LEN {
        FRAME_HEADER_LEN
    } else {
        let len = u32::from_be_bytes([pending[1], pending[2], pending[3], pending[4]]);
        FRAME_HEADER_LEN + len as usize
    };
    ProtocolError::Truncated {
        expected,
        received: pending.len(),
    }
}

fn control_name(command: Command) -> &'static str {
    match command {
        Command::Data => "DATA",
        Command::Connect => "CONNECT",
        Command::Close => "CLOSE",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf);
        buf
    }

    #[test]
    fn test_data_round_trip() {
        for len in [0usize, 1, 5, 4096, 70_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = Frame::data(payload.clone());
            let mut buf = encoded(&frame);
            assert_eq!(buf.len(), FRAME_HEADER_LEN + len);

            let decoded = decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.command, Command::Data);
            assert_eq!(decoded.payload, Bytes::from(payload));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_control_round_trip() {
        for frame in [Frame::connect(), Frame::close()] {
            let mut buf = encoded(&frame);
            assert_eq!(buf.len(), FRAME_HEADER_LEN);
            assert_eq!(decode_frame(&mut buf).unwrap(), Some(frame));
        }
    }

    #[test]
    fn test_wire_layout() {
        let buf = encoded(&Frame::data(&b"abc"[..]));
        assert_eq!(&buf[..], &[0x00, 0x00, 0x00, 0x00, 0x03, b'a', b'b', b'c']);

        let buf = encoded(&Frame::close());
        assert_eq!(&buf[..], &[0x02, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_partial_input_is_not_consumed() {
        let full = encoded(&Frame::data(&b"hello"[..]));

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert_eq!(decode_frame(&mut partial).unwrap(), None);
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = encoded(&Frame::connect());
        encode_frame(&Frame::data(&b"xy"[..]), &mut buf);
        encode_frame(&Frame::close(), &mut buf);

        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::connect()));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::data(&b"xy"[..])));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::close()));
        assert_eq!(decode_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_command_is_skipped() {
        let mut buf = BytesMut::from(&[0x09, 0, 0, 0, 2, 7, 7][..]);
        encode_frame(&Frame::connect(), &mut buf);

        assert_eq!(decode_frame(&mut buf), Err(ProtocolError::UnknownCommand(9)));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::connect()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_command_waits_for_whole_frame() {
        let mut buf = BytesMut::from(&[0x09, 0, 0, 0, 3, 1][..]);
        assert_eq!(decode_frame(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&[2, 3]);
        assert_eq!(decode_frame(&mut buf), Err(ProtocolError::UnknownCommand(9)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_control_payload_is_skipped() {
        let mut buf = BytesMut::from(&[CMD_CLOSE, 0, 0, 0, 2, 1, 2][..]);
        encode_frame(&Frame::data(&b"ok"[..]), &mut buf);

        assert!(matches!(
            decode_frame(&mut buf),
            Err(ProtocolError::UnexpectedPayload { command: "CLOSE", len: 2 })
        ));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::data(&b"ok"[..])));
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        buf.put_u8(CMD_DATA);
        buf.put_u32(MAX_FRAME_PAYLOAD + 1);
        assert_eq!(
            decode_frame(&mut buf),
            Err(ProtocolError::PayloadTooLarge(MAX_FRAME_PAYLOAD + 1))
        );
        assert_eq!(buf.len(), FRAME_HEADER_LEN);
    }

    #[test]
    fn test_truncation_error_sizes() {
        assert_eq!(
            truncation_error(&[0x00, 0x00]),
            ProtocolError::Truncated { expected: 5, received: 2 }
        );
        assert_eq!(
            truncation_error(&[0x00, 0x00, 0x00, 0x00, 0x0a, 1, 2, 3]),
            ProtocolError::Truncated { expected: 15, received: 8 }
        );
    }
}
