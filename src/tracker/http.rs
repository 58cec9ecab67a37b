use std::net::SocketAddr;

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::{response::HttpAnnounceResponse, AnnounceEvent, AnnounceParams};
use crate::error::TrackerError;

/// `info_hash` and `peer_id` are raw 20-byte strings, not valid UTF-8, so
/// they can't go through `url::Url`'s normal query-string builder (which
/// only accepts `&str`); they're percent-encoded by hand instead, same as
/// every other compliant BitTorrent client.
const RAW_BYTE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn build_announce_url(base: &str, params: &AnnounceParams) -> String {
    let info_hash = percent_encode(&params.info_hash, RAW_BYTE_ENCODE_SET);
    let peer_id = percent_encode(&params.peer_id, RAW_BYTE_ENCODE_SET);

    let mut url = format!(
        "{base}{sep}info_hash={info_hash}&peer_id={peer_id}&port={port}\
         &uploaded={uploaded}&downloaded={downloaded}&left={left}&compact=1",
        base = base,
        sep = if base.contains('?') { '&' } else { '?' },
        info_hash = info_hash,
        peer_id = peer_id,
        port = params.port,
        uploaded = params.uploaded,
        downloaded = params.downloaded,
        left = params.left,
    );
    if let Some(event) = params.event.as_str() {
        url.push_str("&event=");
        url.push_str(event);
    }
    url
}

/// Announces to an HTTP(S) tracker and returns the peers it offers.
pub(crate) async fn announce(
    client: &reqwest::Client,
    base_url: &str,
    params: &AnnounceParams,
) -> Result<(Vec<SocketAddr>, Option<i64>), TrackerError> {
    let url = build_announce_url(base_url, params);
    log::debug!("Announcing to HTTP tracker {}", base_url);

    let bytes = client.get(&url).send().await?.bytes().await?;
    let response: HttpAnnounceResponse = serde_bencode::from_bytes(&bytes)?;

    if let Some(reason) = response.failure_reason {
        log::warn!("Tracker {} reported failure: {}", base_url, reason);
        return Ok((Vec::new(), None));
    }

    let peers = response.peer_addrs()?;
    Ok((peers, response.min_interval.or(response.interval)))
}
