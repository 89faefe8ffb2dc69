use super::{Announce, AnnounceParams};
use anyhow::{Context, anyhow};
use serde::de::{Error, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use url::Url;

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

// NOTE: `info_hash` and `peer_id` are not serialized with the rest.
// They are raw bytes, and urlencoding libraries escape our encoding
// of them and mess it up; they get appended to the URL by hand.
#[derive(Debug, Clone, Serialize)]
struct QueryParams {
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
}

#[derive(Debug, Clone, Deserialize)]
struct Response {
    // Seconds the client should wait between regular announces.
    interval: u64,

    #[serde(rename = "min interval")]
    min_interval: Option<u64>,

    // Compact form: 6 bytes per peer, 4 for the IPv4 address and 2 for
    // the port, both in network byte order.
    peers: PeerList,
}

#[derive(Debug, Clone, Deserialize)]
struct Failure {
    #[serde(rename = "failure reason")]
    failure_reason: String,
}

pub(crate) async fn announce(url: &Url, params: &AnnounceParams) -> anyhow::Result<Announce> {
    let query = serde_urlencoded::to_string(QueryParams {
        port: params.port,
        uploaded: params.uploaded,
        downloaded: params.downloaded,
        left: params.left,
        compact: 1,
    })
    .context("urlencode announce parameters")?;
    let announce_url = format!(
        "{}?{}&info_hash={}&peer_id={}",
        url,
        query,
        url_encode(&params.info_hash),
        url_encode(&params.peer_id)
    );

    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("build http client")?;
    let response = client
        .get(&announce_url)
        .send()
        .await
        .context("query tracker")?;
    let status = response.status();
    let body = response.bytes().await.context("fetch tracker response")?;

    // Trackers report refusals bencoded in the body, sometimes under a
    // 200 status.
    if let Ok(failure) = serde_bencode::from_bytes::<Failure>(&body) {
        return Err(anyhow!("tracker refused announce: {}", failure.failure_reason));
    }
    if !status.is_success() {
        return Err(anyhow!("tracker answered {status}"));
    }
    let response: Response =
        serde_bencode::from_bytes(&body).context("parse tracker response")?;
    Ok(Announce {
        interval: response.interval,
        min_interval: response.min_interval,
        peers: response.peers.0,
    })
}

/// Percent-encodes all 20 bytes unconditionally, so the tracker sees the
/// binary value byte-for-byte.
pub(crate) fn url_encode(v: &[u8; 20]) -> String {
    // a '%' plus two hex characters per byte
    let mut encoded = String::with_capacity(3 * v.len());
    for &byte in v {
        encoded.push('%');
        encoded.push_str(&hex::encode([byte]));
    }
    encoded
}

#[derive(Debug, Clone)]
pub(crate) struct PeerList(pub Vec<SocketAddrV4>);

impl<'de> Deserialize<'de> for PeerList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(PeerListVisitor)
    }
}

struct PeerListVisitor;

impl<'de> Visitor<'de> for PeerListVisitor {
    type Value = PeerList;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("6 bytes per peer: 4 for the IPv4 address, 2 for the port")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: Error,
    {
        if v.len() % 6 != 0 {
            return Err(E::custom(format!("length is {}", v.len())));
        }
        Ok(PeerList(
            v.chunks_exact(6)
                .map(|slice_6| {
                    let ipv4 = Ipv4Addr::new(slice_6[0], slice_6[1], slice_6[2], slice_6[3]);
                    let port = u16::from_be_bytes([slice_6[4], slice_6[5]]);
                    SocketAddrV4::new(ipv4, port)
                })
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e12:min intervali900e5:peers12:");
        body.extend_from_slice(&[0xC0, 0xA8, 0x00, 0x01, 0x1A, 0xE1]);
        body.extend_from_slice(&[0xC0, 0xA8, 0x00, 0x02, 0x1A, 0xE1]);
        body.extend_from_slice(b"e");
        let response: Response = serde_bencode::from_bytes(&body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.min_interval, Some(900));
        assert_eq!(
            response.peers.0,
            vec![
                SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 6881),
                SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 2), 6881),
            ]
        );
    }

    #[test]
    fn rejects_ragged_peer_bytes() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers5:");
        body.extend_from_slice(&[1, 2, 3, 4, 5]);
        body.extend_from_slice(b"e");
        assert!(serde_bencode::from_bytes::<Response>(&body).is_err());
    }

    #[test]
    fn surfaces_failure_reason() {
        let body = b"d14:failure reason15:torrent unknowne";
        let failure: Failure = serde_bencode::from_bytes(&body[..]).unwrap();
        assert_eq!(failure.failure_reason, "torrent unknown");
    }

    #[test]
    fn url_encodes_every_byte() {
        let mut bytes = [0u8; 20];
        bytes[0] = 0x00;
        bytes[1] = 0x1A;
        bytes[19] = 0xFF;
        let encoded = url_encode(&bytes);
        assert!(encoded.starts_with("%00%1a"));
        assert!(encoded.ends_with("%ff"));
        assert_eq!(encoded.len(), 60);
    }
}
