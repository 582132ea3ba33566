use std::path::{Path, PathBuf};

use chat_relay_protocol::{LogEntry, StreamMessage};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const LOG_EXTENSION: &str = "jsonl";
const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum StreamLogError {
    #[error("invalid request id {request_id:?}: {reason}")]
    InvalidRequestId {
        request_id: String,
        reason: &'static str,
    },
    #[error("stream log for {request_id} already exists at {path}")]
    AlreadyExists { request_id: String, path: PathBuf },
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize log entry for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StreamLogError {
    fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Request ids name files on disk, so they are restricted to a portable
/// alphabet.
pub fn validate_request_id(request_id: &str) -> Result<(), StreamLogError> {
    let reason = if request_id.is_empty() {
        Some("must not be empty")
    } else if request_id.len() > MAX_REQUEST_ID_LEN {
        Some("must be at most 128 characters")
    } else if request_id.starts_with('.') {
        Some("must not start with '.'")
    } else if !request_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("may only contain ASCII letters, digits, '-', '_' and '.'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StreamLogError::InvalidRequestId {
            request_id: request_id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Directory of append-only, one-file-per-request logs. Each line is one
/// JSON-encoded [`LogEntry`].
#[derive(Debug, Clone)]
pub struct StreamLog {
    root: PathBuf,
}

impl StreamLog {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StreamLogError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StreamLogError::io("creating stream log directory", &root, source))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn location(&self, request_id: &str) -> PathBuf {
        self.root.join(format!("{request_id}.{LOG_EXTENSION}"))
    }

    /// Creates the log for a new request. Fails if a log already exists,
    /// so an id is never reused while its history is still on disk.
    pub async fn create(&self, request_id: &str) -> Result<LogWriter, StreamLogError> {
        validate_request_id(request_id)?;
        let path = self.location(request_id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::AlreadyExists {
                    StreamLogError::AlreadyExists {
                        request_id: request_id.to_string(),
                        path: path.clone(),
                    }
                } else {
                    StreamLogError::io("creating stream log", &path, source)
                }
            })?;

        Ok(LogWriter {
            request_id: request_id.to_string(),
            path,
            file,
            next_index: 0,
            torn_tail: false,
        })
    }

    /// Opens an existing log for appending, continuing after its last
    /// readable entry.
    pub async fn reopen(&self, request_id: &str) -> Result<LogWriter, StreamLogError> {
        validate_request_id(request_id)?;
        let entries = self.read(request_id, 0).await?;
        let path = self.location(request_id);
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StreamLogError::io("opening stream log for append", &path, source))?;

        Ok(LogWriter {
            request_id: request_id.to_string(),
            path,
            file,
            next_index: entries.last().map(|entry| entry.index + 1).unwrap_or(0),
            // The previous process may have died mid-record.
            torn_tail: true,
        })
    }

    /// Returns the entries with `index >= from_index`, in order. A missing
    /// log reads as empty. Malformed records are skipped.
    pub async fn read(
        &self,
        request_id: &str,
        from_index: u64,
    ) -> Result<Vec<LogEntry>, StreamLogError> {
        validate_request_id(request_id)?;
        let path = self.location(request_id);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StreamLogError::io("opening stream log", &path, source)),
        };

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut next_expected: u64 = 0;
        let mut line = Vec::new();
        let mut line_number: usize = 0;

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|source| StreamLogError::io("reading stream log", &path, source))?;
            if read == 0 {
                break;
            }
            line_number += 1;

            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }

            let entry = match serde_json::from_slice::<LogEntry>(trimmed) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(
                        request_id,
                        line_number,
                        error = %err,
                        "stream log: skipping malformed record"
                    );
                    continue;
                }
            };

            if entry.index < next_expected {
                tracing::warn!(
                    request_id,
                    line_number,
                    index = entry.index,
                    expected = next_expected,
                    "stream log: skipping out-of-order record"
                );
                continue;
            }
            next_expected = entry.index + 1;

            if entry.index >= from_index {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Deletes a request's log. Deleting a missing log is not an error.
    pub async fn delete(&self, request_id: &str) -> Result<(), StreamLogError> {
        validate_request_id(request_id)?;
        let path = self.location(request_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StreamLogError::io("deleting stream log", &path, source)),
        }
    }

    /// Request ids of every log currently on disk.
    pub async fn list(&self) -> Result<Vec<String>, StreamLogError> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|source| StreamLogError::io("listing stream logs", &self.root, source))?;
        let mut ids = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|source| StreamLogError::io("listing stream logs", &self.root, source))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if validate_request_id(stem).is_ok() {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Single writer for one request's log. Owns index assignment, so indices
/// are contiguous by construction.
#[derive(Debug)]
pub struct LogWriter {
    request_id: String,
    path: PathBuf,
    file: File,
    next_index: u64,
    torn_tail: bool,
}

impl LogWriter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Writes one record and syncs it before returning its index.
    pub async fn append(&mut self, message: &StreamMessage) -> Result<u64, StreamLogError> {
        let index = self.next_index;
        let entry = LogEntry::new(index, message.clone());
        let mut record = Vec::with_capacity(64);
        if self.torn_tail {
            // Terminates a partial record left by a failed write.
            record.push(b'\n');
        }
        serde_json::to_writer(&mut record, &entry).map_err(|source| StreamLogError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        record.push(b'\n');

        if let Err(source) = self.write_record(&record).await {
            self.torn_tail = true;
            return Err(StreamLogError::io("appending to stream log", &self.path, source));
        }

        self.torn_tail = false;
        self.next_index += 1;
        Ok(index)
    }

    async fn write_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.file.write_all(record).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn temp_log() -> (tempfile::TempDir, StreamLog) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let log = StreamLog::open(dir.path().join("streams"))
            .await
            .expect("open stream log");
        (dir, log)
    }

    #[tokio::test]
    async fn append_assigns_contiguous_indices() {
        let (_dir, log) = temp_log().await;
        let mut writer = log.create("r1").await.expect("create log");

        let mut indices = Vec::new();
        for word in ["a", "b", "c"] {
            indices.push(writer.append(&StreamMessage::data(word)).await.expect("append"));
        }
        indices.push(writer.append(&StreamMessage::Done).await.expect("append done"));

        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(writer.next_index(), 4);
    }

    #[tokio::test]
    async fn read_returns_suffix_for_every_offset() {
        let (_dir, log) = temp_log().await;
        let mut writer = log.create("r1").await.expect("create log");
        let messages = vec![
            StreamMessage::data("a"),
            StreamMessage::data(json!({"k": 1})),
            StreamMessage::Done,
        ];
        for message in &messages {
            writer.append(message).await.expect("append");
        }

        for from in 0..=messages.len() {
            let entries = log.read("r1", from as u64).await.expect("read");
            let read: Vec<_> = entries.into_iter().map(|entry| entry.message).collect();
            assert_eq!(read, messages[from..].to_vec(), "suffix from {from}");
        }
        assert!(log.read("r1", 99).await.expect("read past end").is_empty());
    }

    #[tokio::test]
    async fn missing_log_reads_empty() {
        let (_dir, log) = temp_log().await;
        assert!(log.read("nope", 0).await.expect("read missing").is_empty());
        log.delete("nope").await.expect("delete missing");
    }

    #[tokio::test]
    async fn malformed_record_is_skipped() {
        let (_dir, log) = temp_log().await;
        let path = log.location("r1");
        let contents = concat!(
            "{\"index\":0,\"type\":\"data\",\"payload\":\"a\"}\n",
            "{not json\n",
            " \t\n",
            "  {\"index\":1,\"type\":\"data\",\"payload\":\"b\"}\r\n",
            "{\"index\":2,\"type\":\"done\"}\n",
        );
        tokio::fs::write(&path, contents).await.expect("write log");

        let entries = log.read("r1", 0).await.expect("read");
        assert_eq!(
            entries,
            vec![
                LogEntry::new(0, StreamMessage::data("a")),
                LogEntry::new(1, StreamMessage::data("b")),
                LogEntry::new(2, StreamMessage::Done),
            ]
        );
    }

    #[tokio::test]
    async fn create_refuses_existing_log() {
        let (_dir, log) = temp_log().await;
        log.create("r1").await.expect("create log");
        let err = log.create("r1").await.expect_err("second create fails");
        assert!(matches!(err, StreamLogError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn reopen_continues_after_last_entry() {
        let (_dir, log) = temp_log().await;
        let mut writer = log.create("r1").await.expect("create log");
        writer.append(&StreamMessage::data("a")).await.expect("append");
        drop(writer);

        let mut writer = log.reopen("r1").await.expect("reopen");
        assert_eq!(writer.next_index(), 1);
        writer.append(&StreamMessage::Done).await.expect("append done");

        let entries = log.read("r1", 0).await.expect("read");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], LogEntry::new(1, StreamMessage::Done));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let (_dir, log) = temp_log().await;
        log.create("b").await.expect("create b");
        log.create("a").await.expect("create a");
        assert_eq!(log.list().await.expect("list"), vec!["a", "b"]);

        log.delete("a").await.expect("delete");
        assert_eq!(log.list().await.expect("list"), vec!["b"]);
    }

    #[test]
    fn request_id_validation() {
        assert!(validate_request_id("req-1_a.b").is_ok());
        assert!(validate_request_id("").is_err());
        assert!(validate_request_id(".hidden").is_err());
        assert!(validate_request_id("../escape").is_err());
        assert!(validate_request_id("has space").is_err());
        assert!(validate_request_id(&"x".repeat(129)).is_err());
    }
}
