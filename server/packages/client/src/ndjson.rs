use std::io;

use chat_relay_protocol::LogEntry;
use futures::{future, Stream, StreamExt};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

/// Longest stream line accepted. A longer line ends the live stream with an
/// error, which the session recovers from through resume.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a chunked NDJSON body into log entries.
///
/// Malformed lines are skipped with a warning; the cursor check downstream
/// turns the hole into a resume. A read error or an oversized line ends the
/// stream after it is yielded.
pub fn decode_entries<S>(
    chunks: S,
    max_line_bytes: usize,
) -> impl Stream<Item = io::Result<LogEntry>>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    FramedRead::new(
        StreamReader::new(chunks),
        LinesCodec::new_with_max_length(max_line_bytes),
    )
    .filter_map(move |line| {
        future::ready(match line {
            Ok(line) => parse_line(&line).map(Ok),
            Err(LinesCodecError::MaxLineLengthExceeded) => Some(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("stream line longer than {max_line_bytes} bytes"),
            ))),
            Err(LinesCodecError::Io(err)) => Some(Err(err)),
        })
    })
}

fn parse_line(line: &str) -> Option<LogEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<LogEntry>(line) {
        Ok(entry) => Some(entry),
        Err(err) => {
            tracing::warn!(error = %err, bytes = line.len(), "skipping malformed stream line");
            None
        }
    }
}
