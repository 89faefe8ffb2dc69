use super::{Announce, AnnounceParams};
use anyhow::{Context, ensure};
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

// Fixed protocol id that opens every BEP 15 conversation.
const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const PHASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Two-phase UDP announce: obtain a connection id, then trade it for a peer
/// list. Each phase gets its own transaction id and a 5 second timeout.
pub(crate) async fn announce(url: &Url, params: &AnnounceParams) -> anyhow::Result<Announce> {
    let host = url.host_str().context("udp tracker url has no host")?;
    let port = url.port().context("udp tracker url has no port")?;
    let socket = UdpSocket::bind("0.0.0.0:0").await.context("bind udp socket")?;
    socket
        .connect((host, port))
        .await
        .context("resolve udp tracker")?;

    let connection_id = connect(&socket).await?;

    let transaction_id: u32 = rand::rng().random();
    let key: u32 = rand::rng().random();
    let request = encode_announce(connection_id, transaction_id, key, params);
    socket.send(&request).await.context("send announce request")?;

    let mut reply = [0u8; 2048];
    let n = timeout(PHASE_TIMEOUT, socket.recv(&mut reply))
        .await
        .context("announce phase timed out")?
        .context("receive announce response")?;
    decode_announce(&reply[..n], transaction_id)
}

async fn connect(socket: &UdpSocket) -> anyhow::Result<u64> {
    let transaction_id: u32 = rand::rng().random();
    let mut request = Vec::with_capacity(16);
    request.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    socket.send(&request).await.context("send connect request")?;

    let mut reply = [0u8; 16];
    let n = timeout(PHASE_TIMEOUT, socket.recv(&mut reply))
        .await
        .context("connect phase timed out")?
        .context("receive connect response")?;
    ensure!(n >= 16, "connect response is {n} bytes, expected 16");
    let action = u32::from_be_bytes(reply[0..4].try_into()?);
    let echoed = u32::from_be_bytes(reply[4..8].try_into()?);
    ensure!(
        echoed == transaction_id,
        "connect transaction id mismatch"
    );
    ensure!(
        action == ACTION_CONNECT,
        "connect reply carries action {action}"
    );
    Ok(u64::from_be_bytes(reply[8..16].try_into()?))
}

// 98-byte announce request, all fields big-endian.
fn encode_announce(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    params: &AnnounceParams,
) -> Vec<u8> {
    let mut request = Vec::with_capacity(98);
    request.extend_from_slice(&connection_id.to_be_bytes());
    request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request.extend_from_slice(&params.info_hash);
    request.extend_from_slice(&params.peer_id);
    request.extend_from_slice(&params.downloaded.to_be_bytes());
    request.extend_from_slice(&params.left.to_be_bytes());
    request.extend_from_slice(&params.uploaded.to_be_bytes());
    // event: none
    request.extend_from_slice(&0u32.to_be_bytes());
    // ip: let the tracker use the packet's source address
    request.extend_from_slice(&0u32.to_be_bytes());
    request.extend_from_slice(&key.to_be_bytes());
    // num_want: as many peers as the tracker will give
    request.extend_from_slice(&(-1i32).to_be_bytes());
    request.extend_from_slice(&params.port.to_be_bytes());
    request
}

fn decode_announce(reply: &[u8], transaction_id: u32) -> anyhow::Result<Announce> {
    ensure!(
        reply.len() >= 20,
        "announce response is {} bytes, expected at least 20",
        reply.len()
    );
    let action = u32::from_be_bytes(reply[0..4].try_into()?);
    let echoed = u32::from_be_bytes(reply[4..8].try_into()?);
    ensure!(
        echoed == transaction_id,
        "announce transaction id mismatch"
    );
    ensure!(
        action == ACTION_ANNOUNCE,
        "announce reply carries action {action}"
    );
    let interval = u32::from_be_bytes(reply[8..12].try_into()?);
    let peers = reply[20..]
        .chunks_exact(6)
        .map(|slice_6| {
            let ipv4 = Ipv4Addr::new(slice_6[0], slice_6[1], slice_6[2], slice_6[3]);
            let port = u16::from_be_bytes([slice_6[4], slice_6[5]]);
            SocketAddrV4::new(ipv4, port)
        })
        .collect();
    Ok(Announce {
        interval: interval as u64,
        min_interval: None,
        peers,
    })
}
