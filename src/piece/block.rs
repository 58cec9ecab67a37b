use std::time::Instant;

/// The status of a single block within an in-progress [`super::Piece`].
#[derive(Clone, Copy, Debug)]
pub(crate) enum BlockStatus {
    /// Not yet requested from any peer.
    Missing,
    /// Requested from a peer at the given time; used to decide when a
    /// request should be reissued or force-reissued (§4.2).
    Requested { since: Instant },
    /// The block's bytes have arrived and been copied into the piece's
    /// assembly buffer.
    Received,
}
