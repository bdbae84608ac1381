//! Append-only journal backing a durable [`MemoryStore`].
//!
//! Every applied conditional set is appended as one JSON line and synced
//! before the write becomes visible. On open the journal is replayed; a
//! torn final line (a crash mid-append) is cut off, while a corrupt line
//! anywhere else fails the open.
//!
//! [`MemoryStore`]: crate::store::MemoryStore

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

use crate::timestamp::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub key: String,
    pub member: String,
    pub ts: Timestamp,
}

#[derive(Debug)]
pub struct Journal {
    writer: BufWriter<File>,
}

impl Journal {
    /// Opens the journal at `path`, creating it if needed, and returns the
    /// entries already recorded in append order.
    pub fn open(path: impl AsRef<Path>) -> io::Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        let (entries, intact) = replay(&bytes)?;

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if intact < bytes.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() - intact,
                "truncating torn journal tail"
            );
            file.set_len(intact as u64)?;
        }

        info!(path = %path.display(), entries = entries.len(), "journal opened");
        Ok((
            Self {
                writer: BufWriter::new(file),
            },
            entries,
        ))
    }

    /// Appends one entry and syncs it to disk.
    pub fn append(&mut self, entry: &JournalEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        trace!(key = %entry.key, member = %entry.member, ts = %entry.ts, "journal append");
        Ok(())
    }
}

// TODO: compact the journal on open once it holds many superseded entries
// per member; replay cost currently grows with every applied write.

/// Parses complete lines. Returns the entries and the length of the prefix
/// made of complete lines.
fn replay(bytes: &[u8]) -> io::Result<(Vec<JournalEntry>, usize)> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while let Some(len) = bytes[offset..].iter().position(|b| *b == b'\n') {
        let line = &bytes[offset..offset + len];
        if !line.iter().all(u8::is_ascii_whitespace) {
            let entry = serde_json::from_slice(line).map_err(|err| {
                io::Error::new(
                    ErrorKind::InvalidData,
                    format!("corrupt journal line at byte {offset}: {err}"),
                )
            })?;
            entries.push(entry);
        }
        offset += len + 1;
    }
    Ok((entries, offset))
}
