//! Peer framing: 4-byte LE payload length, then the bincode-encoded [`Message`].
//!
//! Readers that pull from a stream use [`payload_len`] on the prefix and [`decode_payload`]
//! on the body; buffered readers use [`decode_frame`].

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
/// Ceiling on a frame payload. A piece payload plus its envelope stays well below it.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(FrameEncodeError::TooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame payload of {0} bytes exceeds the ceiling")]
    TooLarge(usize),
}

/// Payload length announced by a prefix, rejected above [`MAX_FRAME_LEN`] before anything is
/// allocated for it.
pub fn payload_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len as usize)
}

pub fn decode_payload(payload: &[u8]) -> Result<Message, FrameDecodeError> {
    Ok(bincode::deserialize(payload)?)
}

/// Decode one frame from the front of `bytes`, returning the message and the bytes consumed.
/// A partial buffer yields `NeedMore`.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let Some((prefix, rest)) = bytes.split_first_chunk::<LEN_SIZE>() else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = payload_len(*prefix)?;
    let Some(payload) = rest.get(..len) else {
        return Err(FrameDecodeError::NeedMore);
    };
    Ok((decode_payload(payload)?, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame payload of {0} bytes exceeds the ceiling")]
    TooLarge(u32),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::Bitfield;
    use crate::content::{self, DEFAULT_PIECE_SIZE};

    fn sample_announce() -> Message {
        Message::Announce {
            content_hash: content::hash(b"blob"),
            bitfield: Bitfield::from_indices(9, [0, 4, 8]),
            signature: vec![1, 2, 3],
        }
    }

    #[test]
    fn announce_survives_framing() {
        let msg = sample_announce();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_frames_need_more() {
        let frame = encode_frame(&sample_announce()).unwrap();
        for cut in [0, 2, LEN_SIZE, frame.len() - 1] {
            assert!(matches!(
                decode_frame(&frame[..cut]),
                Err(FrameDecodeError::NeedMore)
            ));
        }
    }

    #[test]
    fn back_to_back_frames() {
        let a = sample_announce();
        let b = Message::PieceRequest {
            content_hash: content::hash(b"blob"),
            piece_index: 3,
        };
        let fa = encode_frame(&a).unwrap();
        let mut buf = fa.clone();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n1 + n2, buf.len());
        assert!(matches!(m1, Message::Announce { .. }));
        assert!(matches!(m2, Message::PieceRequest { piece_index: 3, .. }));
    }

    #[test]
    fn full_piece_read_as_prefix_then_body() {
        let msg = Message::PieceData {
            content_hash: content::hash(b"blob"),
            piece_index: 0,
            payload: vec![0xab; DEFAULT_PIECE_SIZE + 64],
            piece_hash: content::hash(b"piece"),
        };
        let frame = encode_frame(&msg).unwrap();
        let (prefix, body) = frame.split_first_chunk::<LEN_SIZE>().unwrap();
        assert_eq!(payload_len(*prefix).unwrap(), body.len());
        assert_eq!(decode_payload(body).unwrap(), msg);
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let prefix = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(
            payload_len(prefix),
            Err(FrameDecodeError::TooLarge(_))
        ));
        let mut frame = prefix.to_vec();
        frame.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let mut frame = 3u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&[0xff; 3]);
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::Decode(_))
        ));
    }
}
