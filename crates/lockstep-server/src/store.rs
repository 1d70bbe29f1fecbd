//! Append-only per-room record store.
//!
//! Each room has one file, `<data_dir>/<room_id>.jsonl`, holding one JSON
//! `post` envelope per line in acceptance order. Writes go through a
//! single background task fed by a bounded queue, so a slow disk never
//! holds up live delivery. A missing file is an empty history.

use std::path::{Path, PathBuf};

use lockstep_types::{PostEnvelope, RoomId, ServerMessage};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// File extension of room record files.
const RECORD_EXTENSION: &str = "jsonl";

/// Errors raised by the record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing a record file failed.
    #[error("store I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// An envelope could not be serialized.
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The writer queue is full or the writer has stopped.
    #[error("record queue unavailable for room {0}")]
    QueueUnavailable(RoomId),
}

/// One serialized line waiting to be written.
#[derive(Debug)]
struct PendingRecord {
    room_id: RoomId,
    line: String,
}

/// Handle to the record store.
///
/// Cloning is cheap; all clones feed the same writer task.
#[derive(Debug, Clone)]
pub struct EventStore {
    data_dir: PathBuf,
    queue: mpsc::Sender<PendingRecord>,
}

impl EventStore {
    /// Open the store rooted at `data_dir` and start its writer task.
    ///
    /// The writer stops once every handle is dropped and the queue is
    /// drained; await the returned [`JoinHandle`] to flush on shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if `data_dir` cannot be created.
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        queue_capacity: usize,
    ) -> Result<(Self, JoinHandle<()>), StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: data_dir.clone(),
                source,
            })?;

        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let writer = tokio::spawn(run_writer(data_dir.clone(), rx));
        Ok((Self { data_dir, queue }, writer))
    }

    /// Return the directory holding the record files.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Queue `envelope` to be appended to its room's file.
    ///
    /// Returns once the record is queued, not written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialize`] if the envelope cannot be encoded
    /// or [`StoreError::QueueUnavailable`] if the queue is full.
    pub fn append(&self, envelope: &PostEnvelope) -> Result<(), StoreError> {
        let line = serde_json::to_string(&ServerMessage::Post(envelope.clone()))?;
        self.queue
            .try_send(PendingRecord {
                room_id: envelope.room_id.clone(),
                line,
            })
            .map_err(|e| match e {
                TrySendError::Full(record) | TrySendError::Closed(record) => {
                    StoreError::QueueUnavailable(record.room_id)
                }
            })
    }

    /// Read every record persisted for `room_id`, in file order.
    ///
    /// Lines that fail to decode, or belong to another room, are skipped
    /// with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file exists but cannot be read.
    pub async fn load(&self, room_id: &RoomId) -> Result<Vec<PostEnvelope>, StoreError> {
        let path = record_path(&self.data_dir, room_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let mut envelopes = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ServerMessage>(line) {
                Ok(ServerMessage::Post(envelope)) if envelope.room_id == *room_id => {
                    envelopes.push(envelope);
                }
                Ok(_) => {
                    warn!(room_id = %room_id, line = line_no, "skipping foreign record");
                }
                Err(e) => {
                    warn!(room_id = %room_id, line = line_no, error = %e, "skipping malformed record");
                }
            }
        }
        Ok(envelopes)
    }
}

/// Path of the record file for `room_id`.
fn record_path(data_dir: &Path, room_id: &RoomId) -> PathBuf {
    data_dir.join(format!("{room_id}.{RECORD_EXTENSION}"))
}

/// Drain the queue, appending each record to its room file.
async fn run_writer(data_dir: PathBuf, mut rx: mpsc::Receiver<PendingRecord>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = write_record(&data_dir, &record).await {
            error!(room_id = %record.room_id, error = %e, "failed to persist record");
        }
    }
    debug!("record writer stopped");
}

async fn write_record(data_dir: &Path, record: &PendingRecord) -> Result<(), StoreError> {
    let path = record_path(data_dir, &record.room_id);
    let io_err = |source| StoreError::Io {
        path: path.clone(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(io_err)?;
    let mut bytes = record.line.clone().into_bytes();
    bytes.push(b'\n');
    file.write_all(&bytes).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use lockstep_types::StampedMessage;
    use serde_json::json;

    use super::*;

    fn envelope(room: &RoomId, data: &str, time: i64, received_at: i64) -> PostEnvelope {
        PostEnvelope {
            room_id: room.clone(),
            message: StampedMessage {
                data: json!(data),
                time,
                server_received_at: received_at,
            },
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _writer) = EventStore::open(dir.path(), 8).await.unwrap();
        let room = RoomId::parse("abc").unwrap();
        assert!(store.load(&room).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn appended_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let room = RoomId::parse("a1").unwrap();
        let other = RoomId::parse("b2").unwrap();

        let (store, writer) = EventStore::open(dir.path(), 8).await.unwrap();
        store.append(&envelope(&room, "up", 100, 110)).unwrap();
        store.append(&envelope(&other, "down", 150, 160)).unwrap();
        store.append(&envelope(&room, "down", 50, 200)).unwrap();
        drop(store);
        writer.await.unwrap();

        let (store, _writer) = EventStore::open(dir.path(), 8).await.unwrap();
        let loaded = store.load(&room).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], envelope(&room, "up", 100, 110));
        assert_eq!(loaded[1], envelope(&room, "down", 50, 200));
        assert_eq!(store.load(&other).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let room = RoomId::parse("0d").unwrap();
        let good = serde_json::to_string(&ServerMessage::Post(envelope(&room, "ok", 1, 2))).unwrap();
        fs::write(
            record_path(dir.path(), &room),
            format!("not json\n\n{good}\n{{\"type\":\"watch\",\"room_id\":\"0d\"}}\n"),
        )
        .await
        .unwrap();

        let (store, _writer) = EventStore::open(dir.path(), 8).await.unwrap();
        let loaded = store.load(&room).await.unwrap();
        assert_eq!(loaded, vec![envelope(&room, "ok", 1, 2)]);
    }
}
