use crate::metainfo::{FileEntry, Torrent};
use anyhow::Context;
use kanal::{AsyncReceiver, AsyncSender};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A verified piece waiting to be placed into the output files.
#[derive(Debug)]
pub struct AssembleTask {
    pub piece_index: usize,
    pub bytes: Vec<u8>,
}

/// Single consumer draining a queue of verified pieces onto disk. Writes run
/// on the blocking pool, so scheduler tasks never wait on the filesystem.
pub struct Assembler {
    task_tx: AsyncSender<AssembleTask>,
    handle: JoinHandle<()>,
}

impl Assembler {
    pub fn spawn(torrent: Arc<Torrent>, output_dir: PathBuf) -> Self {
        let (task_tx, task_rx) = kanal::unbounded_async();
        let handle = tokio::spawn(run(torrent, output_dir, task_rx));
        Self { task_tx, handle }
    }

    pub fn sender(&self) -> AsyncSender<AssembleTask> {
        self.task_tx.clone()
    }

    /// Closes the queue and waits for every submitted piece to be written.
    /// Callers must drop their cloned senders first or this never returns.
    pub async fn finish(self) -> anyhow::Result<()> {
        drop(self.task_tx);
        self.handle.await.context("assembler task panicked")
    }
}

async fn run(torrent: Arc<Torrent>, output_dir: PathBuf, task_rx: AsyncReceiver<AssembleTask>) {
    while let Ok(task) = task_rx.recv().await {
        let piece_index = task.piece_index;
        let torrent = Arc::clone(&torrent);
        let output_dir = output_dir.clone();
        let written =
            tokio::task::spawn_blocking(move || write_piece(&torrent, &output_dir, &task)).await;
        match written {
            Ok(Ok(())) => tracing::debug!(piece = piece_index, "piece written"),
            // A failed write is logged and dropped; this revision does not
            // loop I/O failures back into the piece queue.
            Ok(Err(err)) => tracing::error!(piece = piece_index, %err, "failed to write piece"),
            Err(err) => tracing::error!(piece = piece_index, %err, "write task aborted"),
        }
    }
}

// One file's share of a piece: which slice of the piece lands where.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileWrite {
    path: PathBuf,
    file_length: u64,
    file_offset: u64,
    // byte range within the piece
    start: usize,
    end: usize,
}

// The files overlapping `[piece_start, piece_start + piece_len)`, in stream
// order. Iteration is bounded by the piece's own range, so a short last piece
// simply produces fewer or narrower writes.
fn plan_writes(file_map: &[FileEntry], piece_start: usize, piece_len: usize) -> Vec<FileWrite> {
    let piece_end = piece_start + piece_len;
    // first file whose interval ends past the start of the piece
    let first = file_map.partition_point(|file| file.end <= piece_start);
    let mut writes = Vec::new();
    for file in &file_map[first..] {
        if file.start >= piece_end {
            break;
        }
        let overlap_start = piece_start.max(file.start);
        let overlap_end = piece_end.min(file.end);
        writes.push(FileWrite {
            path: file.path.clone(),
            file_length: file.length as u64,
            file_offset: (overlap_start - file.start) as u64,
            start: overlap_start - piece_start,
            end: overlap_end - piece_start,
        });
    }
    writes
}

fn write_piece(torrent: &Torrent, output_dir: &Path, task: &AssembleTask) -> anyhow::Result<()> {
    let piece_start = task.piece_index * torrent.piece_length;
    for write in plan_writes(&torrent.file_map, piece_start, task.bytes.len()) {
        let path = output_dir.join(&write.path);
        write_range(
            &path,
            write.file_length,
            write.file_offset,
            &task.bytes[write.start..write.end],
        )
        .with_context(|| format!("write piece {} to {}", task.piece_index, path.display()))?;
    }
    Ok(())
}

// Every file is brought to its declared length before its first write, so
// out-of-order pieces always land inside an existing allocation and the file
// never grows past what the descriptor promises.
fn write_range(path: &Path, file_length: u64, offset: u64, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .context("open output file")?;
    if file.metadata().context("stat output file")?.len() != file_length {
        file.set_len(file_length).context("size output file")?;
    }
    file.seek(SeekFrom::Start(offset)).context("seek to piece offset")?;
    file.write_all(bytes).context("write piece bytes")?;
    Ok(())
}
