use crate::assembler::{AssembleTask, Assembler};
use crate::metainfo::Torrent;
use crate::peer;
use crate::piece::Piece;
use crate::tracker;
use anyhow::{Context, bail, ensure};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use kanal::{AsyncReceiver, AsyncSender};
use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

pub const DOWNLOAD_WORKERS: usize = 20;
pub const FAILURE_WORKERS: usize = 20;
// How long a worker naps when every peer is leased out.
const PEER_WAIT: Duration = Duration::from_millis(500);
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

// Leased from the front, returned to the front on success and to the back on
// failure, so the front accumulates peers that actually deliver.
type PeerPool = Arc<Mutex<VecDeque<SocketAddrV4>>>;

/// Announces, then downloads every piece of the torrent into `output_dir`.
pub async fn run(torrent: Arc<Torrent>, output_dir: PathBuf) -> anyhow::Result<()> {
    let peer_id = tracker::generate_peer_id();
    let announce = tracker::announce(
        &torrent,
        peer_id,
        tracker::DEFAULT_MAX_RETRIES,
        tracker::DEFAULT_RETRY_DELAY,
    )
    .await?;
    ensure!(!announce.peers.is_empty(), "tracker returned an empty peer list");
    download_from(torrent, output_dir, peer_id, announce.peers).await
}

/// Downloads every piece from the given peer set. Split out from [`run`] so a
/// peer list can also be supplied without a tracker round-trip.
pub async fn download_from(
    torrent: Arc<Torrent>,
    output_dir: PathBuf,
    peer_id: [u8; 20],
    peers: Vec<SocketAddrV4>,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let piece_count = torrent.piece_count();
    let max_attempts = retry_budget(peers.len());
    let pool: PeerPool = Arc::new(Mutex::new(peers.into_iter().collect()));

    // Seed the queue with every piece and close it; workers drain it dry.
    let (piece_tx, piece_rx) = kanal::unbounded_async::<Piece>();
    for index in 0..piece_count {
        piece_tx
            .send(Piece::new(index, &torrent))
            .await
            .context("seed piece queue")?;
    }
    drop(piece_tx);

    let (failed_tx, failed_rx) = kanal::unbounded_async::<Piece>();
    let (done_tx, mut done_rx) = mpsc::channel::<usize>(piece_count.max(1));
    let cancel = CancellationToken::new();
    let assembler = Assembler::spawn(Arc::clone(&torrent), output_dir);

    let mut workers = FuturesUnordered::new();
    for worker in 0..DOWNLOAD_WORKERS {
        workers.push(tokio::spawn(download_worker(
            worker,
            Arc::clone(&torrent),
            peer_id,
            Arc::clone(&pool),
            max_attempts,
            piece_rx.clone(),
            failed_tx.clone(),
            assembler.sender(),
            done_tx.clone(),
        )));
    }
    for worker in 0..FAILURE_WORKERS {
        workers.push(tokio::spawn(failure_worker(
            worker,
            Arc::clone(&torrent),
            peer_id,
            Arc::clone(&pool),
            failed_rx.clone(),
            failed_tx.clone(),
            assembler.sender(),
            done_tx.clone(),
            cancel.clone(),
        )));
    }
    drop(failed_tx);
    drop(done_tx);

    // Every piece counts as complete once it has been handed to the
    // assembler, whichever pool delivered it.
    let mut completed = 0;
    while completed < piece_count {
        match done_rx.recv().await {
            Some(index) => {
                completed += 1;
                tracing::info!(piece = index, completed, total = piece_count, "piece complete");
            }
            None => bail!("every worker exited before the download completed"),
        }
    }

    cancel.cancel();
    while let Some(joined) = workers.next().await {
        if let Err(err) = joined {
            tracing::error!(%err, "worker panicked");
        }
    }
    assembler.finish().await?;
    tracing::info!(
        pieces = piece_count,
        elapsed = ?started.elapsed(),
        "download complete"
    );
    Ok(())
}

// min(ceil(peers / 2), 10), but always at least one attempt.
pub(crate) fn retry_budget(peer_count: usize) -> usize {
    peer_count.div_ceil(2).clamp(1, 10)
}

async fn download_worker(
    worker: usize,
    torrent: Arc<Torrent>,
    peer_id: [u8; 20],
    pool: PeerPool,
    max_attempts: usize,
    piece_rx: AsyncReceiver<Piece>,
    failed_tx: AsyncSender<Piece>,
    assemble_tx: AsyncSender<AssembleTask>,
    done_tx: mpsc::Sender<usize>,
) {
    while let Ok(piece) = piece_rx.recv().await {
        let mut attempts = 0;
        let mut delivered = false;
        while attempts < max_attempts {
            let leased = pool.lock().await.pop_front();
            let Some(addr) = leased else {
                tokio::time::sleep(PEER_WAIT).await;
                continue;
            };
            attempts += 1;
            match peer::download_piece(addr, &torrent, peer_id, piece).await {
                Ok(bytes) => {
                    pool.lock().await.push_front(addr);
                    tracing::debug!(worker, piece = piece.index(), peer = %addr, "piece downloaded");
                    let task = AssembleTask { piece_index: piece.index(), bytes };
                    if assemble_tx.send(task).await.is_err() {
                        return;
                    }
                    let _ = done_tx.send(piece.index()).await;
                    delivered = true;
                    break;
                }
                Err(err) => {
                    tracing::debug!(
                        worker,
                        piece = piece.index(),
                        peer = %addr,
                        attempts,
                        %err,
                        "piece attempt failed"
                    );
                    pool.lock().await.push_back(addr);
                }
            }
        }
        if !delivered {
            tracing::warn!(worker, piece = piece.index(), "retries exhausted, escalating");
            if failed_tx.send(piece).await.is_err() {
                return;
            }
        }
    }
}

// Safety net for pieces the primary pool gave up on: walk the whole peer list
// in its current order, and put the piece back after a short backoff if nobody
// can serve it yet.
async fn failure_worker(
    worker: usize,
    torrent: Arc<Torrent>,
    peer_id: [u8; 20],
    pool: PeerPool,
    failed_rx: AsyncReceiver<Piece>,
    failed_tx: AsyncSender<Piece>,
    assemble_tx: AsyncSender<AssembleTask>,
    done_tx: mpsc::Sender<usize>,
    cancel: CancellationToken,
) {
    loop {
        let piece = tokio::select! {
            _ = cancel.cancelled() => return,
            piece = failed_rx.recv() => match piece {
                Ok(piece) => piece,
                Err(_) => return,
            },
        };
        let snapshot: Vec<SocketAddrV4> = pool.lock().await.iter().copied().collect();
        let mut delivered = false;
        for addr in snapshot {
            match peer::download_piece(addr, &torrent, peer_id, piece).await {
                Ok(bytes) => {
                    promote(&pool, addr).await;
                    tracing::debug!(worker, piece = piece.index(), peer = %addr, "rescued piece");
                    let task = AssembleTask { piece_index: piece.index(), bytes };
                    if assemble_tx.send(task).await.is_err() {
                        return;
                    }
                    let _ = done_tx.send(piece.index()).await;
                    delivered = true;
                    break;
                }
                Err(err) => {
                    tracing::trace!(worker, piece = piece.index(), peer = %addr, %err, "rescue attempt failed");
                }
            }
        }
        if !delivered {
            tokio::time::sleep(FAILURE_BACKOFF).await;
            if failed_tx.send(piece).await.is_err() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}

// Moves a peer to the front of the pool if it is still there.
async fn promote(pool: &PeerPool, addr: SocketAddrV4) {
    let mut pool = pool.lock().await;
    if let Some(position) = pool.iter().position(|peer| *peer == addr) {
        pool.remove(position);
    }
    pool.push_front(addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;
    use crate::peer::{Message, MessageFramer, MessageTag};
    use futures_util::SinkExt;
    use sha1::{Digest, Sha1};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    #[test]
    fn retry_budget_tracks_half_the_peer_list() {
        assert_eq!(retry_budget(0), 1);
        assert_eq!(retry_budget(1), 1);
        assert_eq!(retry_budget(5), 3);
        assert_eq!(retry_budget(19), 10);
        assert_eq!(retry_budget(100), 10);
    }

    #[tokio::test]
    async fn promote_moves_a_peer_to_the_front() {
        let peers: Vec<SocketAddrV4> = vec![
            "10.0.0.1:6881".parse().unwrap(),
            "10.0.0.2:6881".parse().unwrap(),
            "10.0.0.3:6881".parse().unwrap(),
        ];
        let pool: PeerPool = Arc::new(Mutex::new(peers.clone().into_iter().collect()));
        promote(&pool, peers[2]).await;
        let order: Vec<_> = pool.lock().await.iter().copied().collect();
        assert_eq!(order, vec![peers[2], peers[0], peers[1]]);
    }

    // A loopback peer that seeds the whole torrent for any number of
    // sequential connections.
    fn spawn_seeder(listener: TcpListener, torrent: Arc<Torrent>, data: Arc<Vec<u8>>) {
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let torrent = Arc::clone(&torrent);
                let data = Arc::clone(&data);
                tokio::spawn(async move {
                    let mut stream = stream;
                    let mut handshake = [0u8; 68];
                    stream.read_exact(&mut handshake).await?;
                    stream.write_all(&handshake).await?;
                    let mut stream = Framed::new(stream, MessageFramer);
                    let bitfield = vec![0xFF; torrent.piece_count().div_ceil(8)];
                    loop {
                        let Some(Ok(msg)) = stream.next().await else {
                            return Ok::<(), std::io::Error>(());
                        };
                        match msg.tag() {
                            Some(MessageTag::Interested) => {
                                stream
                                    .send(Message::new(MessageTag::Bitfield, bitfield.clone()))
                                    .await?;
                                stream
                                    .send(Message::new(MessageTag::Unchoke, Vec::new()))
                                    .await?;
                            }
                            Some(MessageTag::Request) => {
                                let index =
                                    u32::from_be_bytes(msg.payload[0..4].try_into().unwrap());
                                let begin =
                                    u32::from_be_bytes(msg.payload[4..8].try_into().unwrap());
                                let length =
                                    u32::from_be_bytes(msg.payload[8..12].try_into().unwrap());
                                let offset =
                                    index as usize * torrent.piece_length + begin as usize;
                                let mut payload = Vec::new();
                                payload.extend_from_slice(&index.to_be_bytes());
                                payload.extend_from_slice(&begin.to_be_bytes());
                                payload.extend_from_slice(
                                    &data[offset..offset + length as usize],
                                );
                                stream.send(Message::new(MessageTag::Piece, payload)).await?;
                            }
                            _ => {}
                        }
                    }
                });
            }
        });
    }

    #[tokio::test]
    async fn downloads_a_multi_file_torrent_from_loopback_seeders() {
        let piece_length = 2 * crate::BLOCK_SIZE;
        let total_length = 2 * piece_length + 777;
        let data: Vec<u8> = (0..total_length).map(|i| (i * 31 % 251) as u8).collect();
        let piece_hashes = data
            .chunks(piece_length)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        let alpha_len = piece_length + 1000;
        let torrent = Arc::new(Torrent {
            info_hash: [0xCD; 20],
            announce_urls: vec!["http://tracker.invalid/announce".into()],
            name: "archive".into(),
            piece_length,
            piece_hashes,
            total_length,
            file_map: vec![
                FileEntry {
                    start: 0,
                    end: alpha_len,
                    length: alpha_len,
                    path: PathBuf::from("archive").join("alpha"),
                },
                FileEntry {
                    start: alpha_len,
                    end: total_length,
                    length: total_length - alpha_len,
                    path: PathBuf::from("archive").join("beta"),
                },
            ],
        });

        let data = Arc::new(data);
        let mut peers = Vec::new();
        for _ in 0..2 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = match listener.local_addr().unwrap() {
                std::net::SocketAddr::V4(addr) => addr,
                std::net::SocketAddr::V6(_) => unreachable!(),
            };
            peers.push(addr);
            spawn_seeder(listener, Arc::clone(&torrent), Arc::clone(&data));
        }

        let dir = tempfile::tempdir().unwrap();
        download_from(
            Arc::clone(&torrent),
            dir.path().to_path_buf(),
            *b"-ZT6969-000000000000",
            peers,
        )
        .await
        .unwrap();

        let alpha = std::fs::read(dir.path().join("archive/alpha")).unwrap();
        let beta = std::fs::read(dir.path().join("archive/beta")).unwrap();
        assert_eq!(alpha, &data[..alpha_len]);
        assert_eq!(beta, &data[alpha_len..]);
    }

    #[tokio::test]
    async fn escalated_pieces_are_rescued_by_the_failure_pool() {
        // one piece, one peer that refuses twice before serving
        let piece_length = 64;
        let data: Vec<u8> = (0..piece_length).map(|i| i as u8).collect();
        let torrent = Arc::new(Torrent {
            info_hash: [0xEF; 20],
            announce_urls: vec!["http://tracker.invalid/announce".into()],
            name: "blob".into(),
            piece_length,
            piece_hashes: vec![Sha1::digest(&data).into()],
            total_length: piece_length,
            file_map: vec![FileEntry {
                start: 0,
                end: piece_length,
                length: piece_length,
                path: PathBuf::from("blob"),
            }],
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            std::net::SocketAddr::V6(_) => unreachable!(),
        };
        let served = Arc::new(data.clone());
        let seeder_torrent = Arc::clone(&torrent);
        tokio::spawn(async move {
            // refuse the first two sessions outright
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                drop(stream);
            }
            spawn_seeder(listener, seeder_torrent, served);
        });

        let dir = tempfile::tempdir().unwrap();
        download_from(
            Arc::clone(&torrent),
            dir.path().to_path_buf(),
            *b"-ZT6969-000000000000",
            vec![addr],
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(dir.path().join("blob")).unwrap(), data);
    }
}
