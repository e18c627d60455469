//! Append-only audit journal with buffered JSONL persistence.
//!
//! ```text
//! append() ──► seal(prevHash) ──► buffer [ e | e | e ]
//!                                    │
//!                 flush when:        ▼
//!                   1. buffered bytes ≥ flush_threshold
//!                   2. buffered entries ≥ max_buffered_entries
//!                   3. explicit flush() / close() / drop
//!                                    │
//!                                    ▼
//!                       one JSON object per line (JSONL)
//! ```
//!
//! Appends never do I/O below the thresholds. A journal opened on an
//! existing file verifies it and continues its chain.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use concord_core::time::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::chain::{verify_chain, ChainFault};
use super::AuditEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Buffered bytes before an automatic flush. Default: 64KB.
    pub flush_threshold: usize,
    /// Buffered entries before an automatic flush. Default: 256.
    pub max_buffered_entries: usize,
    /// Most recent events kept in memory for inspection. Default: 10,000.
    pub max_retained: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 64 * 1024,
            max_buffered_entries: 256,
            max_retained: 10_000,
        }
    }
}

impl AuditConfig {
    /// Config for testing (small buffers, frequent flushes).
    pub fn for_testing() -> Self {
        Self {
            flush_threshold: 1024,
            max_buffered_entries: 4,
            max_retained: 1_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("cannot serialize event: {0}")]
    Serialize(String),
    #[error("chain broken at index {index} ({fault:?})")]
    ChainBroken { index: usize, fault: ChainFault },
    #[error("audit log is closed")]
    Closed,
}

/// The audit journal.
pub struct AuditLog {
    config: AuditConfig,
    session_id: String,
    client_id: String,
    next_seq: u64,
    last_hash: Option<String>,
    /// Sealed events not yet written.
    buffer: Vec<String>,
    buffer_bytes: usize,
    retained: VecDeque<AuditEvent>,
    sink: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    total_appended: u64,
    total_flushed: u64,
    open: bool,
}

impl AuditLog {
    /// Journal kept only in memory.
    pub fn in_memory(
        config: AuditConfig,
        session_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            buffer: Vec::with_capacity(config.max_buffered_entries),
            config,
            session_id: session_id.into(),
            client_id: client_id.into(),
            next_seq: 0,
            last_hash: None,
            buffer_bytes: 0,
            retained: VecDeque::new(),
            sink: None,
            path: None,
            total_appended: 0,
            total_flushed: 0,
            open: true,
        }
    }

    /// Continue a verified chain in memory.
    pub fn resume(
        config: AuditConfig,
        events: &[AuditEvent],
        session_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Result<Self, AuditError> {
        let report = verify_chain(events);
        if let (Some(index), Some(fault)) = (report.first_bad_index, report.fault) {
            return Err(AuditError::ChainBroken { index, fault });
        }
        let mut log = Self::in_memory(config, session_id, client_id);
        if let Some(last) = events.last() {
            log.next_seq = last.seq + 1;
            log.last_hash = last.hash.clone();
        }
        let keep = events.len().saturating_sub(log.config.max_retained);
        log.retained.extend(events[keep..].iter().cloned());
        Ok(log)
    }

    /// Open (or create) a JSONL journal, continuing any existing chain.
    pub fn open_jsonl(
        path: impl AsRef<Path>,
        config: AuditConfig,
        session_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Result<Self, AuditError> {
        let path = path.as_ref();
        let existing = if path.exists() {
            Self::load_jsonl(path)?
        } else {
            Vec::new()
        };
        let mut log = Self::resume(config, &existing, session_id, client_id)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log.sink = Some(BufWriter::new(file));
        log.path = Some(path.to_path_buf());
        log::info!(
            "audit journal {} opened at seq {}",
            path.display(),
            log.next_seq
        );
        Ok(log)
    }

    /// Read every event of a JSONL file. Blank lines are skipped.
    pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>, AuditError> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|e| AuditError::Parse {
                line: i + 1,
                message: e.to_string(),
            })?;
            events.push(event);
        }
        Ok(events)
    }

    /// Append and seal one event. Flushes when a threshold is crossed.
    pub fn append(
        &mut self,
        event_type: &str,
        ok: bool,
        payload: Value,
    ) -> Result<AuditEvent, AuditError> {
        if !self.open {
            return Err(AuditError::Closed);
        }
        let event = AuditEvent {
            seq: self.next_seq,
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            ts_wall_ms: now_ms(),
            event_type: event_type.to_string(),
            ok,
            payload,
            prev_hash: None,
            hash: None,
        }
        .seal(self.last_hash.clone());

        let line =
            serde_json::to_string(&event).map_err(|e| AuditError::Serialize(e.to_string()))?;
        self.next_seq += 1;
        self.last_hash = event.hash.clone();
        self.buffer_bytes += line.len() + 1;
        self.buffer.push(line);
        self.total_appended += 1;

        self.retained.push_back(event.clone());
        while self.retained.len() > self.config.max_retained {
            self.retained.pop_front();
        }

        if self.needs_flush() {
            self.flush()?;
        }
        Ok(event)
    }

    pub fn needs_flush(&self) -> bool {
        self.buffer_bytes >= self.config.flush_threshold
            || self.buffer.len() >= self.config.max_buffered_entries
    }

    /// Write buffered events to the sink. Returns how many were written.
    ///
    /// In-memory journals just drop the buffer (events stay retained).
    pub fn flush(&mut self) -> Result<usize, AuditError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let lines = std::mem::take(&mut self.buffer);
        if let Some(sink) = self.sink.as_mut() {
            for line in &lines {
                sink.write_all(line.as_bytes())?;
                sink.write_all(b"\n")?;
            }
            sink.flush()?;
        }
        self.buffer_bytes = 0;
        self.total_flushed += lines.len() as u64;
        log::trace!("audit flushed {} events", lines.len());
        Ok(lines.len())
    }

    /// Flush and refuse further appends.
    pub fn close(&mut self) -> Result<(), AuditError> {
        self.flush()?;
        self.open = false;
        Ok(())
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.retained.iter().cloned().collect()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    pub fn total_flushed(&self) -> u64 {
        self.total_flushed
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("audit flush on drop failed: {e}");
        }
    }
}
