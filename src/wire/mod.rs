//! The peer wire protocol (BEP 3): handshake framing and the length-prefixed
//! message stream that follows it.
//!
//! A session starts out speaking [`handshake::HandshakeCodec`], a codec for
//! the single fixed-size handshake frame, and then swaps over to
//! [`codec::PeerCodec`] for the rest of the connection's lifetime. The swap
//! reuses the underlying `Framed`'s buffers via `FramedParts`, so no bytes
//! read ahead of the handshake are lost.

mod codec;
mod handshake;
mod message;

pub(crate) use codec::{PeerCodec, MAX_FRAME_LEN};
pub(crate) use handshake::{Handshake, HandshakeCodec, PROTOCOL_STRING};
pub(crate) use message::{Message, MessageId};
