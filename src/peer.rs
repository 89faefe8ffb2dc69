use crate::BLOCK_SIZE;
use crate::bitfield::Bitfield;
use crate::metainfo::Torrent;
use crate::piece::Piece;
use anyhow::{Context, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::io::{Error, ErrorKind};
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tokio_util::codec::{Decoder, Encoder, Framed};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
// How long we tolerate a peer that keeps talking without unchoking us.
const UNCHOKE_BUDGET: Duration = Duration::from_secs(15);

/// Downloads one piece from one peer and verifies it against the expected
/// digest. Every failure is recoverable from the caller's point of view: the
/// socket is gone, the piece is not, and another peer can be tried.
pub async fn download_piece(
    addr: SocketAddrV4,
    torrent: &Torrent,
    peer_id: [u8; 20],
    piece: Piece,
) -> anyhow::Result<Vec<u8>> {
    let mut session = PeerSession::connect(addr, torrent.info_hash, peer_id).await?;
    session
        .stream
        .send(Message::new(MessageTag::Interested, Vec::new()))
        .await
        .context("send interested message")?;
    session.await_unchoke().await?;
    ensure!(
        session.bitfield.has_piece(piece.index()),
        "peer does not have piece {}",
        piece.index()
    );
    session.request_piece(piece).await
}

#[derive(Debug)]
pub(crate) struct PeerSession {
    stream: Framed<TcpStream, MessageFramer>,
    bitfield: Bitfield,
    choked: bool,
}

impl PeerSession {
    /// Opens the socket and performs the 68-byte handshake. The reply must
    /// echo our info-hash in bytes 28..48; anything else is a different
    /// torrent and the session ends here.
    pub(crate) async fn connect(
        addr: SocketAddrV4,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> anyhow::Result<Self> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .context("connect timed out")?
            .context("connect to peer")?;
        let handshake = Handshake::new(info_hash, peer_id);
        stream
            .write_all(&handshake.to_bytes())
            .await
            .context("write handshake")?;
        let mut reply = [0u8; Handshake::LEN];
        timeout(READ_TIMEOUT, stream.read_exact(&mut reply))
            .await
            .context("handshake timed out")?
            .context("read handshake")?;
        ensure!(
            reply[28..48] == info_hash[..],
            "handshake info-hash mismatch"
        );
        Ok(Self {
            stream: Framed::new(stream, MessageFramer),
            bitfield: Bitfield::default(),
            choked: true,
        })
    }

    // Reads framed messages until the peer unchokes us, folding bitfield and
    // have messages into the availability map along the way.
    async fn await_unchoke(&mut self) -> anyhow::Result<()> {
        let deadline = Instant::now() + UNCHOKE_BUDGET;
        while self.choked {
            if Instant::now() >= deadline {
                bail!("peer never unchoked us");
            }
            let msg = self.next_message().await?;
            match msg.tag() {
                Some(MessageTag::Choke) => self.choked = true,
                Some(MessageTag::Unchoke) => self.choked = false,
                Some(MessageTag::Bitfield) => {
                    self.bitfield = Bitfield::from_payload(msg.payload);
                }
                Some(MessageTag::Have) => {
                    if let Ok(index) = <[u8; 4]>::try_from(&msg.payload[..]) {
                        self.bitfield.set_piece(u32::from_be_bytes(index) as usize);
                    }
                }
                _ => {} // discarded
            }
        }
        Ok(())
    }

    // Pipelines every block request, then collects piece messages keyed by
    // offset until the whole piece is held and verified.
    async fn request_piece(&mut self, piece: Piece) -> anyhow::Result<Vec<u8>> {
        for request in block_requests(piece.index(), piece.length()) {
            let begin = request.begin;
            self.stream
                .send(Message::new(MessageTag::Request, request.to_payload()))
                .await
                .with_context(|| format!("request block at offset {begin}"))?;
        }

        let mut blocks: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut received = 0usize;
        while received < piece.length() {
            let msg = self.next_message().await?;
            match msg.tag() {
                Some(MessageTag::Piece) => {
                    let Some(block) = Block::from_payload(&msg.payload) else {
                        bail!("malformed piece message");
                    };
                    if block.index as usize != piece.index() {
                        // a block for a piece we are no longer responsible for
                        continue;
                    }
                    // duplicate delivery replaces the earlier copy
                    if let Some(old) = blocks.insert(block.begin, block.data.to_vec()) {
                        received -= old.len();
                    }
                    received += block.data.len();
                }
                Some(MessageTag::Choke) => self.choked = true,
                _ => {} // discarded
            }
        }

        let mut bytes = Vec::with_capacity(piece.length());
        for data in blocks.values() {
            bytes.extend_from_slice(data);
        }
        ensure!(
            bytes.len() == piece.length(),
            "assembled {} bytes for piece {}, expected {}",
            bytes.len(),
            piece.index(),
            piece.length()
        );
        let hash: [u8; 20] = Sha1::digest(&bytes).into();
        ensure!(
            hash == piece.hash(),
            "piece {} failed hash verification",
            piece.index()
        );
        Ok(bytes)
    }

    async fn next_message(&mut self) -> anyhow::Result<Message> {
        let msg = timeout(READ_TIMEOUT, self.stream.next())
            .await
            .context("peer read timed out")?;
        match msg {
            Some(msg) => msg.context("peer sent an invalid frame"),
            None => bail!("peer closed the connection"),
        }
    }
}

pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub const LEN: usize = 68;

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[0] = 19;
        bytes[1..20].copy_from_slice(b"BitTorrent protocol");
        // bytes 20..28 stay zero: no extensions
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }
}

/// A single block request: `length` never exceeds 16 KiB and the block lies
/// inside the piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    fn to_payload(self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&self.index.to_be_bytes());
        payload.extend_from_slice(&self.begin.to_be_bytes());
        payload.extend_from_slice(&self.length.to_be_bytes());
        payload
    }
}

/// Splits a piece into 16 KiB block requests, the last possibly shorter.
pub(crate) fn block_requests(index: usize, piece_len: usize) -> Vec<BlockRequest> {
    let mut requests = Vec::with_capacity(piece_len.div_ceil(BLOCK_SIZE));
    let mut begin = 0;
    while begin < piece_len {
        let length = BLOCK_SIZE.min(piece_len - begin);
        requests.push(BlockRequest {
            index: index as u32,
            begin: begin as u32,
            length: length as u32,
        });
        begin += length;
    }
    requests
}

// Payload of a `piece` message: <index (4)><begin (4)><data>.
struct Block<'a> {
    index: u32,
    begin: u32,
    data: &'a [u8],
}

impl<'a> Block<'a> {
    fn from_payload(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        Some(Self {
            index: u32::from_be_bytes(payload[..4].try_into().ok()?),
            begin: u32::from_be_bytes(payload[4..8].try_into().ok()?),
            data: &payload[8..],
        })
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(tag: MessageTag, payload: Vec<u8>) -> Self {
        Self {
            id: tag as u8,
            payload,
        }
    }

    /// `None` for ids this engine does not speak; their payloads have already
    /// been consumed by the framer and are simply dropped.
    pub fn tag(&self) -> Option<MessageTag> {
        MessageTag::try_from(self.id).ok()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageTag {
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

impl TryFrom<u8> for MessageTag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageTag::*;
        match value {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            _ => Err(Error::new(ErrorKind::InvalidData, "unknown message id")),
        }
    }
}

// Wire form: <length prefix (4 bytes, big-endian)><message id (1 byte)><payload>.
// A zero length is a keep-alive and never surfaces as a message.
#[derive(Debug)]
pub struct MessageFramer;

// The largest frame we ever solicit is a piece message: one 16 KiB block plus
// nine bytes of header. Anything past a megabyte is a corrupt length prefix.
const MAX_FRAME: usize = (1 << 20) + 9;

impl Decoder for MessageFramer {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Not enough data to read message length.
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            // Keep-alive. Discard and try again in case the buffer
            // holds more messages.
            src.advance(4);
            return self.decode(src);
        }

        if length > MAX_FRAME {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("frame of length {} is too large", length),
            ));
        }

        if src.len() < 4 + length {
            // The full frame has not arrived yet. Reserving here saves
            // repeated growth while the remainder trickles in.
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        // Ids we do not recognize still frame correctly, so they pass
        // through here and get discarded by the session.
        let id = src[4];
        let payload = if length > 1 {
            src[5..4 + length].to_vec()
        } else {
            Vec::new()
        };
        src.advance(4 + length);

        Ok(Some(Message { id, payload }))
    }
}

impl Encoder<Message> for MessageFramer {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() + 1 > MAX_FRAME {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("frame of length {} is too large", item.payload.len() + 1),
            ));
        }

        // "+1" is the message id.
        let length_slice = u32::to_be_bytes(item.payload.len() as u32 + 1);
        dst.reserve(4 + 1 + item.payload.len());
        dst.extend_from_slice(&length_slice);
        dst.put_u8(item.id);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
