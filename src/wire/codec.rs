use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, MessageId};
use crate::{error::PeerError, BlockInfo};

/// The maximum length, in bytes, of a single message's payload (the length
/// prefix's value, not counting the 4 prefix bytes themselves).
///
/// This is comfortably larger than the largest legitimate frame we ever send
/// or expect to receive -- a `Piece` message carrying one 16 KiB block plus
/// its 9 byte header -- and exists only to reject a peer that sends a
/// corrupt or hostile length prefix before we try to buffer it.
pub(crate) const MAX_FRAME_LEN: u32 = 1 << 16;

/// The length prefix, in bytes.
const LEN_PREFIX_LEN: usize = 4;

/// A codec for the peer wire protocol's length-prefixed messages, used for
/// the lifetime of a connection after the initial handshake.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(LEN_PREFIX_LEN);
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.reserve(LEN_PREFIX_LEN + 1);
                buf.put_u32(1);
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.reserve(LEN_PREFIX_LEN + 1 + 4);
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.reserve(LEN_PREFIX_LEN + 1 + bytes.len());
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bytes);
            }
            Message::Request(BlockInfo { piece_index, offset, len }) => {
                buf.reserve(LEN_PREFIX_LEN + 1 + 12);
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_u32(len);
            }
            Message::Piece { piece_index, offset, data } => {
                buf.reserve(LEN_PREFIX_LEN + 1 + 8 + data.len());
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Cancel(BlockInfo { piece_index, offset, len }) => {
                buf.reserve(LEN_PREFIX_LEN + 1 + 12);
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_u32(len);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < LEN_PREFIX_LEN {
            return Ok(None);
        }

        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&buf[..LEN_PREFIX_LEN]);
        let len = u32::from_be_bytes(len_bytes);

        if len == 0 {
            // keep-alive: just the length prefix, no id or payload
            buf.advance(LEN_PREFIX_LEN);
            return Ok(Some(Message::KeepAlive));
        }

        if len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(len));
        }

        let frame_len = LEN_PREFIX_LEN + len as usize;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len);
        frame.advance(LEN_PREFIX_LEN);

        let id = frame[0];
        frame.advance(1);
        let id = MessageId::from_u8(id)
            .ok_or(PeerError::MalformedFrame("unknown message id"))?;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if frame.len() != 4 {
                    return Err(PeerError::MalformedFrame(
                        "have payload must be 4 bytes",
                    ));
                }
                let piece_index = frame.get_u32() as usize;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                Message::Bitfield(crate::Bitfield::from_vec(frame.to_vec()))
            }
            MessageId::Request => {
                if frame.len() != 12 {
                    return Err(PeerError::MalformedFrame(
                        "request payload must be 12 bytes",
                    ));
                }
                let piece_index = frame.get_u32() as usize;
                let offset = frame.get_u32();
                let len = frame.get_u32();
                Message::Request(BlockInfo { piece_index, offset, len })
            }
            MessageId::Piece => {
                if frame.len() < 8 {
                    return Err(PeerError::MalformedFrame(
                        "piece payload must be at least 8 bytes",
                    ));
                }
                let piece_index = frame.get_u32() as usize;
                let offset = frame.get_u32();
                let data = frame.freeze();
                Message::Piece { piece_index, offset, data }
            }
            MessageId::Cancel => {
                if frame.len() != 12 {
                    return Err(PeerError::MalformedFrame(
                        "cancel payload must be 12 bytes",
                    ));
                }
                let piece_index = frame.get_u32() as usize;
                let offset = frame.get_u32();
                let len = frame.get_u32();
                Message::Cancel(BlockInfo { piece_index, offset, len })
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn roundtrip(msg: Message) -> Message {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_keep_alive_roundtrip() {
        assert_eq!(roundtrip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn test_choke_unchoke_roundtrip() {
        assert_eq!(roundtrip(Message::Choke), Message::Choke);
        assert_eq!(roundtrip(Message::Unchoke), Message::Unchoke);
        assert_eq!(roundtrip(Message::Interested), Message::Interested);
        assert_eq!(
            roundtrip(Message::NotInterested),
            Message::NotInterested
        );
    }

    #[test]
    fn test_have_roundtrip() {
        assert_eq!(
            roundtrip(Message::Have { piece_index: 42 }),
            Message::Have { piece_index: 42 }
        );
    }

    #[test]
    fn test_request_and_cancel_roundtrip() {
        let block = BlockInfo { piece_index: 3, offset: 16384, len: 16384 };
        assert_eq!(roundtrip(Message::Request(block)), Message::Request(block));
        assert_eq!(roundtrip(Message::Cancel(block)), Message::Cancel(block));
    }

    #[test]
    fn test_piece_roundtrip() {
        let data = Bytes::from(vec![1, 2, 3, 4]);
        let msg = Message::Piece { piece_index: 1, offset: 0, data };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_frame_too_large_is_rejected() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PeerError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Choke as u8);
        // missing the rest of a hypothetical 5-byte payload
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_malformed_have_payload_is_rejected() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1 + 2);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(7);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PeerError::MalformedFrame(_))
        ));
    }
}
