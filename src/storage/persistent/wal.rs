//! Write-ahead log for subscription and ledger mutations.
//!
//! Every mutation is appended (and optionally fsynced) before it is applied
//! to the in-memory indices; opening the log replays it to rebuild them.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [RECORD 1: codec-framed WalEntry]
//! [RECORD 2: codec-framed WalEntry]
//! ...
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::InstanceId;
use crate::ledger::{CorrelationKey, LedgerEntry};
use crate::subscription::{EventSubscription, SubscriptionId};

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The logged mutation.
    pub kind: WalEntryKind,
}

/// The logged mutation.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    SubscriptionRegister(EventSubscription),
    SubscriptionUnregister { id: SubscriptionId },

    LedgerReserve(LedgerEntry),
    LedgerBind {
        key: CorrelationKey,
        instance_id: InstanceId,
    },
    LedgerRelease { key: CorrelationKey },
    LedgerRemove { key: CorrelationKey },
}

struct WalWriter {
    out: BufWriter<File>,
    sequence: u64,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal writer")
}

/// Append-only mutation log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Open or create a log file, resuming after its last valid record.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let fresh = !path.exists() || fs::metadata(path)?.len() < 5;
        let sequence = if fresh {
            let mut file = File::create(path)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        } else {
            Self::last_valid(path)?
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                out: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    /// Append a mutation; returns its sequence number.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut w = self.writer.lock().map_err(|_| poisoned())?;
        let sequence = w.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        })?;

        w.out.write_all(&encoded)?;
        w.out.flush()?;
        if self.sync_on_write {
            w.out.get_ref().sync_data()?;
        }
        w.sequence = sequence;
        Ok(sequence)
    }

    /// Iterate over all records, for replay.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last appended record.
    pub fn current_sequence(&self) -> u64 {
        self.writer.lock().map(|w| w.sequence).unwrap_or(0)
    }

    /// Log size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Replace the log with `snapshot`, written to a side file and renamed over.
    ///
    /// Callers must hold every index lock so no append races the swap.
    pub fn rewrite(&self, snapshot: Vec<WalEntryKind>) -> IoResult<()> {
        let mut w = self.writer.lock().map_err(|_| poisoned())?;
        w.out.flush()?;

        let tmp = self.path.with_extension("wal.compact");
        let mut sequence = 0;
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            codec::write_header(&mut out)?;
            for kind in snapshot {
                sequence += 1;
                out.write_all(&codec::encode(&WalEntry {
                    sequence,
                    timestamp: Utc::now(),
                    kind,
                })?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        *w = WalWriter {
            out: BufWriter::new(file),
            sequence,
        };
        Ok(())
    }

    /// Truncates a torn tail so new appends follow the last valid record.
    fn last_valid(path: &Path) -> IoResult<u64> {
        let mut iter = WalIterator::new(path)?;
        let mut last = 0;
        let mut valid_end = iter.position()?;
        loop {
            match iter.next() {
                Some(Ok(entry)) => {
                    last = entry.sequence;
                    valid_end = iter.position()?;
                }
                Some(Err(e)) => {
                    tracing::warn!(after_sequence = last, error = %e, "wal corruption detected, truncating tail");
                    break;
                }
                None => break,
            }
        }

        let file_len = fs::metadata(path)?.len();
        if valid_end < file_len {
            OpenOptions::new().write(true).open(path)?.set_len(valid_end)?;
        }
        Ok(last)
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

/// Iterator over log records. Stops at a clean end or a torn tail.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
