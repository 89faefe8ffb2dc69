use anyhow::Context;
use hashes::Hashes;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("torrent file has no usable announce url")]
    MissingAnnounce,
    #[error("piece length must be positive")]
    ZeroPieceLength,
    #[error("multi-file torrent lists no files")]
    NoFiles,
    #[error("info dictionary not found in torrent file")]
    NoInfoDict,
    #[error("{pieces} piece hashes cannot cover {total} bytes in pieces of {piece_length}")]
    PiecePlanMismatch {
        pieces: usize,
        total: usize,
        piece_length: usize,
    },
}

// Serde model of the bencoded file. Only used while deriving a `Torrent`;
// everything downstream works off the descriptor.
#[derive(Debug, Clone, Deserialize)]
struct Metainfo {
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    info: Info,
}

#[derive(Debug, Clone, Deserialize)]
struct Info {
    // Suggested name to save the content as: a file name in the single file
    // case, a directory name in the multiple file case.
    name: String,

    // Number of bytes per piece. All pieces have this length except possibly
    // the last one, which may be truncated.
    #[serde(rename = "piece length")]
    piece_length: usize,

    // Concatenated 20-byte SHA1 digests, one per piece, in piece order.
    pieces: Hashes,

    #[serde(flatten)]
    kind: FileKind,
}

// A torrent carries either a `length` key (single file) or a `files` key
// (directory tree), never both.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FileKind {
    Single { length: usize },
    Multi { files: Vec<FileDict> },
}

#[derive(Debug, Clone, Deserialize)]
struct FileDict {
    length: usize,
    path: Vec<String>,
}

/// One file's slice of the concatenated byte stream, half-open `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub start: usize,
    pub end: usize,
    pub length: usize,
    pub path: PathBuf,
}

/// Everything the engine needs to know about a torrent, derived once from the
/// metainfo file and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Torrent {
    pub info_hash: [u8; 20],
    pub announce_urls: Vec<String>,
    pub name: String,
    pub piece_length: usize,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: usize,
    pub file_map: Vec<FileEntry>,
}

impl Torrent {
    pub async fn read(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path).await.context("open torrent file")?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let metainfo: Metainfo =
            serde_bencode::from_bytes(bytes).context("parse torrent file")?;
        let info_hash = info_hash(bytes)?;
        Ok(Self::derive(metainfo, info_hash)?)
    }

    fn derive(metainfo: Metainfo, info_hash: [u8; 20]) -> Result<Self, MetainfoError> {
        let info = metainfo.info;
        if info.piece_length == 0 {
            return Err(MetainfoError::ZeroPieceLength);
        }

        // Primary announce first, then the tier list flattened in tier order.
        let mut announce_urls = Vec::new();
        if let Some(announce) = metainfo.announce {
            announce_urls.push(announce);
        }
        for tier in metainfo.announce_list.unwrap_or_default() {
            for url in tier {
                if !url.is_empty() && !announce_urls.contains(&url) {
                    announce_urls.push(url);
                }
            }
        }
        if announce_urls.is_empty() {
            return Err(MetainfoError::MissingAnnounce);
        }

        let (total_length, file_map) = match info.kind {
            FileKind::Single { length } => {
                let entry = FileEntry {
                    start: 0,
                    end: length,
                    length,
                    path: PathBuf::from(&info.name),
                };
                (length, vec![entry])
            }
            FileKind::Multi { files } => {
                if files.is_empty() {
                    return Err(MetainfoError::NoFiles);
                }
                let root = PathBuf::from(&info.name);
                let mut global_offset = 0;
                let mut file_map = Vec::with_capacity(files.len());
                for file in files {
                    let mut path = root.clone();
                    for component in &file.path {
                        path.push(component);
                    }
                    file_map.push(FileEntry {
                        start: global_offset,
                        end: global_offset + file.length,
                        length: file.length,
                        path,
                    });
                    global_offset += file.length;
                }
                (global_offset, file_map)
            }
        };

        let piece_hashes = info.pieces.0;
        if piece_hashes.len() != total_length.div_ceil(info.piece_length) {
            return Err(MetainfoError::PiecePlanMismatch {
                pieces: piece_hashes.len(),
                total: total_length,
                piece_length: info.piece_length,
            });
        }

        Ok(Self {
            info_hash,
            announce_urls,
            name: info.name,
            piece_length: info.piece_length,
            piece_hashes,
            total_length,
            file_map,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index` in bytes: `piece_length`, except for the last
    /// piece which only covers what remains of the stream.
    pub fn piece_size(&self, index: usize) -> usize {
        if index + 1 == self.piece_count() {
            self.total_length - (self.piece_count() - 1) * self.piece_length
        } else {
            self.piece_length
        }
    }

    pub fn piece_hash(&self, index: usize) -> [u8; 20] {
        self.piece_hashes[index]
    }
}

impl fmt::Display for Torrent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "name: {}", self.name)?;
        writeln!(f, "info hash: {}", hex::encode(self.info_hash))?;
        writeln!(f, "total length: {} bytes", self.total_length)?;
        writeln!(f, "piece length: {} bytes", self.piece_length)?;
        writeln!(f, "piece count: {}", self.piece_count())?;
        writeln!(f, "trackers:")?;
        for url in &self.announce_urls {
            writeln!(f, "\t{url}")?;
        }
        writeln!(f, "files:")?;
        for file in &self.file_map {
            writeln!(
                f,
                "\t{} ({} bytes at offset {})",
                file.path.display(),
                file.length,
                file.start
            )?;
        }
        Ok(())
    }
}

/// SHA1 over the exact bytes of the `info` value as they appear in the file.
/// Re-encoding the decoded dictionary is not equivalent: key order or integer
/// formatting quirks in the source would change the digest.
pub fn info_hash(bytes: &[u8]) -> Result<[u8; 20], MetainfoError> {
    let span = info_span(bytes).ok_or(MetainfoError::NoInfoDict)?;
    Ok(Sha1::digest(&bytes[span]).into())
}

// Byte range of the value bound to the top-level "info" key.
fn info_span(bytes: &[u8]) -> Option<Range<usize>> {
    if *bytes.first()? != b'd' {
        return None;
    }
    let mut pos = 1;
    while *bytes.get(pos)? != b'e' {
        let (key, key_end) = parse_string(bytes, pos)?;
        let value_end = skip_value(bytes, key_end)?;
        if key == b"info" {
            return Some(key_end..value_end);
        }
        pos = value_end;
    }
    None
}

// A bencode string at `at`: returns its contents and the offset one past it.
fn parse_string(bytes: &[u8], at: usize) -> Option<(&[u8], usize)> {
    let colon = bytes[at..].iter().position(|&b| b == b':')? + at;
    let length: usize = std::str::from_utf8(&bytes[at..colon]).ok()?.parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(length)?;
    bytes.get(start..end).map(|contents| (contents, end))
}

// Offset one past the bencode value starting at `at`.
fn skip_value(bytes: &[u8], at: usize) -> Option<usize> {
    match bytes.get(at)? {
        b'i' => {
            let end = bytes[at + 1..].iter().position(|&b| b == b'e')? + at + 1;
            Some(end + 1)
        }
        // Dictionary keys and values can both be skipped one value at a time,
        // so lists and dictionaries walk the same way.
        b'l' | b'd' => {
            let mut pos = at + 1;
            while *bytes.get(pos)? != b'e' {
                pos = skip_value(bytes, pos)?;
            }
            Some(pos + 1)
        }
        b'0'..=b'9' => parse_string(bytes, at).map(|(_, end)| end),
        _ => None,
    }
}

pub mod hashes {
    use serde::de::{Error, Visitor};
    use serde::{Deserialize, Deserializer};
    use std::fmt;

    #[derive(Debug, Clone)]
    pub struct Hashes(pub Vec<[u8; 20]>);

    impl<'de> Deserialize<'de> for Hashes {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(HashesVisitor)
        }
    }

    struct HashesVisitor;

    impl<'de> Visitor<'de> for HashesVisitor {
        type Value = Hashes;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a byte string whose length is a multiple of 20")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: Error,
        {
            if v.len() % 20 != 0 {
                return Err(E::custom(format!("length is {}", v.len())));
            }
            Ok(Hashes(
                v.chunks_exact(20)
                    .map(|slice_20| slice_20.try_into().expect("chunks are 20 bytes"))
                    .collect(),
            ))
        }
    }
}
