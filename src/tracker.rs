use std::net::Ipv4Addr;

use once_cell::sync::Lazy;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use rand::{Rng, distr::Alphanumeric};
use reqwest::Client;
use tracing::{debug, info};
use url::{ParseError, Url};

use crate::bencode_parser::parse;
use crate::error::TrackerError;
use crate::peer::PeerAddress;
use crate::torrent::TorrentMetadata;

/// Client prefix in Azureus style, followed by 12 random characters.
const PEER_ID_PREFIX: &[u8; 8] = b"-RL0001-";
const COMPACT_PEER_LEN: usize = 6;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!("rs_leech/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
});

/// Creates a fresh 20-byte peer id for this run.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    for (slot, c) in peer_id[8..]
        .iter_mut()
        .zip(rand::rng().sample_iter(&Alphanumeric))
    {
        *slot = c;
    }
    peer_id
}

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

fn build_tracker_url(
    torrent: &TorrentMetadata,
    peer_id: &[u8; 20],
    port: u16,
) -> Result<String, ParseError> {
    let mut base = Url::parse(&torrent.announce)?;

    let info_hash = encode_bytes(&torrent.info_hash);
    let peer_id = encode_bytes(peer_id);

    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
        info_hash, peer_id, port, torrent.length
    );
    if let Some(existing) = base.query().filter(|q| !q.is_empty()) {
        query = format!("{existing}&{query}");
    }

    base.set_query(Some(&query));
    Ok(base.to_string())
}

async fn contact_tracker(tracker_url: &str) -> Result<Vec<u8>, TrackerError> {
    let response = HTTP_CLIENT.get(tracker_url).send().await?;

    if !response.status().is_success() {
        return Err(TrackerError::Status(response.status()));
    }

    let bytes = response.bytes().await?;
    Ok(bytes.to_vec())
}

/// Decodes a compact peer list: 4 bytes of IPv4 and a big-endian port each.
fn extract_peers(bytes: &[u8]) -> Result<Vec<PeerAddress>, TrackerError> {
    if bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(TrackerError::InvalidPeers(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerAddress::new(ip, port)
        })
        .collect())
}

/// Extracts the peers from a bencoded announce response.
pub fn parse_tracker_response(body: &[u8]) -> Result<Vec<PeerAddress>, TrackerError> {
    let value = parse(body)?;
    let dict = value.as_dict()?;

    if let Some(reason) = dict.get(b"failure reason") {
        let reason = String::from_utf8_lossy(reason.as_bytes()?).into_owned();
        return Err(TrackerError::Failure(reason));
    }
    if let Some(interval) = dict.get(b"interval").and_then(|v| v.as_integer().ok()) {
        debug!(interval, "tracker re-announce interval");
    }

    let peers = dict
        .get(b"peers")
        .ok_or(TrackerError::MissingPeers)?
        .as_bytes()?;
    extract_peers(peers)
}

/// Announces to the torrent's tracker and returns the peers it knows.
pub async fn announce(
    torrent: &TorrentMetadata,
    peer_id: &[u8; 20],
    port: u16,
) -> Result<Vec<PeerAddress>, TrackerError> {
    let url = build_tracker_url(torrent, peer_id, port)?;
    debug!(%url, "announcing");

    let response_bytes = contact_tracker(&url).await?;
    let peers = parse_tracker_response(&response_bytes)?;
    info!(peers = peers.len(), tracker = %torrent.announce, "tracker answered");

    Ok(peers)
}
