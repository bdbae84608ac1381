use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    ConditionalSet {
        key: String,
        ts: Timestamp,
        member: String,
    },
    ReadAll {
        key: String,
    },
    Subscribe {
        key: String,
    },
    Unsubscribe {
        key: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Applied { applied: bool },
    Members { members: Vec<(String, Timestamp)> },
    Subscribed { key: String, count: usize },
    Unsubscribed { key: String, count: usize },
    Message { key: String, payload: String },
    Error { message: String },
}

/// Reads the next message, one JSON object per line.
///
/// Bytes of a line that has not fully arrived are kept in `line`, so a read
/// that loses a `select!` race can be retried with the same buffer without
/// losing data. Blank lines are skipped; end of stream reads as `None`.
pub async fn read_message<R, T>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        let eof = reader.read_until(b'\n', line).await? == 0;
        let decoded = decode_line(line);
        line.clear();
        match decoded? {
            Some(message) => return Ok(Some(message)),
            None if eof => return Ok(None),
            None => {}
        }
    }
}

fn decode_line<T: DeserializeOwned>(line: &[u8]) -> io::Result<Option<T>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(line)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Writes `message` as a single line and flushes it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}
