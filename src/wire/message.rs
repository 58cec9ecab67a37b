use crate::{Bitfield, BlockInfo, PieceIndex};
use bytes::Bytes;

/// The message type tag, the first byte of every non-keep-alive message's
/// payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            _ => return None,
        })
    }
}

/// A single peer wire protocol message (BEP 3), decoded from its
/// length-prefixed frame.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    /// Sent with no payload; the frame's length prefix is zero and there is
    /// no id byte.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Announces that the sender has just acquired the given piece.
    Have { piece_index: PieceIndex },
    /// Announces the full set of pieces the sender has.
    Bitfield(Bitfield),
    /// Requests a block of a piece.
    Request(BlockInfo),
    /// A block of a piece, sent in response to a `Request`.
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    /// Cancels a previously sent `Request` that is no longer needed.
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the id of this message, or `None` for `KeepAlive`, which has
    /// no id byte.
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Self::KeepAlive => return None,
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have { .. } => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request(_) => MessageId::Request,
            Self::Piece { .. } => MessageId::Piece,
            Self::Cancel(_) => MessageId::Cancel,
        })
    }
}
