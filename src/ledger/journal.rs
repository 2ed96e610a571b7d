//! Append-only JSON-lines journal backing a [`LedgerStore`](super::LedgerStore).
//!
//! Every mutation is written and flushed before it is applied in memory. On open the
//! journal is read back in order. A torn final line (crash mid-write) is dropped;
//! corruption anywhere else is an error.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::LedgerError;
use crate::model::{EntryId, EntryStatus, LedgerEntry, Metadata};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Record {
    Append {
        entry: LedgerEntry,
    },
    Transition {
        id: EntryId,
        status: EntryStatus,
        metadata: Metadata,
    },
    Annotate {
        id: EntryId,
        metadata: Metadata,
    },
}

#[derive(Debug)]
pub struct Journal {
    writer: Mutex<BufWriter<File>>,
}

impl Journal {
    /// Open (or create) the journal at `path`, returning its existing records.
    pub fn open(path: &Path) -> Result<(Self, Vec<Record>), LedgerError> {
        let (records, keep) = match fs::read_to_string(path) {
            Ok(content) => parse(&content)?,
            Err(e) if e.kind() == ErrorKind::NotFound => (Vec::new(), None),
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Some(len) = keep {
            // new records must not be glued onto the torn line
            file.set_len(len)?;
        }
        let journal = Self {
            writer: Mutex::new(BufWriter::new(file)),
        };
        Ok((journal, records))
    }

    pub fn write(&self, record: &Record) -> Result<(), LedgerError> {
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Parse journal lines. The second value is the byte length to truncate to when the
/// tail was torn.
fn parse(content: &str) -> Result<(Vec<Record>, Option<u64>), LedgerError> {
    let lines: Vec<&str> = content.lines().collect();
    let mut records = Vec::with_capacity(lines.len());
    let mut keep = None;
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(source) if idx + 1 == lines.len() && !content.ends_with('\n') => {
                warn!(line = idx + 1, error = %source, "dropping torn journal tail");
                keep = Some(content.rfind('\n').map_or(0, |pos| pos as u64 + 1));
            }
            Err(source) => {
                return Err(LedgerError::JournalCorrupt {
                    line: idx + 1,
                    source,
                });
            }
        }
    }
    Ok((records, keep))
}
