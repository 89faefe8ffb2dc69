pub mod http;
pub mod udp;

use crate::metainfo::Torrent;
use anyhow::bail;
use rand::Rng;
use std::net::SocketAddrV4;
use std::time::Duration;
use url::Url;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// A successful announce: how long the tracker wants us to wait before
/// re-announcing, and the peers it offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub peers: Vec<SocketAddrV4>,
}

/// The announce parameters shared by both transports. This revision always
/// reports a fresh download: nothing uploaded, nothing fetched, everything
/// still left.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

impl AnnounceParams {
    pub fn fresh(torrent: &Torrent, peer_id: [u8; 20]) -> Self {
        Self {
            info_hash: torrent.info_hash,
            peer_id,
            port: rand::rng().random_range(6881..=6889),
            uploaded: 0,
            downloaded: 0,
            left: torrent.total_length as u64,
        }
    }
}

/// 20-byte client id: the `-ZT6969-` prefix followed by 12 random digits,
/// generated once per run.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-ZT6969-");
    let mut rng = rand::rng();
    for byte in &mut peer_id[8..] {
        *byte = b'0' + rng.random_range(0..10u8);
    }
    peer_id
}

/// Walks the descriptor's tracker URLs in order, giving each up to
/// `max_retries` attempts with `retry_delay` between them, and returns the
/// first peer list obtained. Exhausting every tracker is fatal: without peers
/// there is no download.
pub async fn announce(
    torrent: &Torrent,
    peer_id: [u8; 20],
    max_retries: u32,
    retry_delay: Duration,
) -> anyhow::Result<Announce> {
    let params = AnnounceParams::fresh(torrent, peer_id);
    for tracker in &torrent.announce_urls {
        let url = match Url::parse(tracker) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(%tracker, %err, "skipping unparseable tracker url");
                continue;
            }
        };
        for attempt in 1..=max_retries {
            tracing::info!(%tracker, attempt, "requesting peers");
            let result = match url.scheme() {
                "http" | "https" => http::announce(&url, &params).await,
                "udp" => udp::announce(&url, &params).await,
                other => {
                    tracing::warn!(%tracker, scheme = other, "unsupported tracker scheme");
                    break;
                }
            };
            match result {
                Ok(announce) => {
                    tracing::info!(%tracker, peers = announce.peers.len(), "announce succeeded");
                    return Ok(announce);
                }
                Err(err) => {
                    tracing::warn!(%tracker, attempt, %err, "announce failed");
                    if attempt < max_retries {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }
    }
    bail!("no tracker returned a peer list")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn peer_id_is_prefixed_digits() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], b"-ZT6969-");
        assert!(peer_id[8..].iter().all(u8::is_ascii_digit));
    }

    fn torrent_with_trackers(announce_urls: Vec<String>) -> Torrent {
        Torrent {
            info_hash: [0x11; 20],
            announce_urls,
            name: "f".into(),
            piece_length: 2,
            piece_hashes: vec![[0u8; 20]],
            total_length: 2,
            file_map: vec![FileEntry {
                start: 0,
                end: 2,
                length: 2,
                path: PathBuf::from("f"),
            }],
        }
    }

    #[tokio::test]
    async fn fails_over_to_the_next_tracker() {
        // first tracker accepts and hangs up without answering
        let broken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broken_addr = broken.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = broken.accept().await;
            }
        });

        // second tracker speaks just enough http to deliver two compact peers
        let working = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let working_addr = working.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = working.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request).await.unwrap();
            let mut body = Vec::new();
            body.extend_from_slice(b"d8:intervali1800e5:peers12:");
            body.extend_from_slice(&[0xC0, 0xA8, 0x00, 0x01, 0x1A, 0xE1]);
            body.extend_from_slice(&[0xC0, 0xA8, 0x00, 0x02, 0x1A, 0xE1]);
            body.extend_from_slice(b"e");
            let mut response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes();
            response.extend_from_slice(&body);
            stream.write_all(&response).await.unwrap();
        });

        let torrent = torrent_with_trackers(vec![
            format!("http://{broken_addr}/announce"),
            format!("http://{working_addr}/announce"),
        ]);
        let announce = announce(&torrent, generate_peer_id(), 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(announce.interval, 1800);
        assert_eq!(
            announce.peers,
            vec!["192.168.0.1:6881".parse().unwrap(), "192.168.0.2:6881".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn every_tracker_failing_is_fatal() {
        let torrent = torrent_with_trackers(vec!["gopher://nowhere".into()]);
        let err = announce(&torrent, generate_peer_id(), 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no tracker"));
    }
}
