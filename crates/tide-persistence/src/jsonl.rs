//! JSON Lines alert store.
//!
//! One `AlertRecord` per line in `alerts_YYYY-MM-DD.jsonl` (UTC date of the
//! flush). Files are only ever appended to, so a torn write costs one line,
//! which `query` skips.
//!
//! Records leave the pending buffer as they are written, so a flush that fails
//! halfway resumes after the last written record. While the disk keeps failing
//! the buffer holds at most `MAX_PENDING_BATCHES` batches and drops the oldest.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::PersistenceResult;
use crate::record::{AlertRecord, RecordFilter};
use crate::store::AlertStore;

const FILE_PREFIX: &str = "alerts_";
const FILE_SUFFIX: &str = ".jsonl";
const MAX_PENDING_BATCHES: usize = 10;

/// Active writer state for the daily file.
struct ActiveWriter {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

struct WriterState {
    buffer: VecDeque<AlertRecord>,
    active: Option<ActiveWriter>,
}

/// Buffered, daily-rotated JSON Lines store.
pub struct JsonLinesStore {
    base_dir: PathBuf,
    max_buffer_size: usize,
    max_pending: usize,
    state: Mutex<WriterState>,
}

impl JsonLinesStore {
    /// Open a store rooted at `base_dir`, creating the directory if needed.
    pub fn open(base_dir: impl AsRef<Path>, max_buffer_size: usize) -> PersistenceResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        info!(dir = %base_dir.display(), "Opened JSON Lines alert store");

        let max_buffer_size = max_buffer_size.max(1);
        Ok(Self {
            base_dir,
            max_buffer_size,
            max_pending: max_buffer_size.saturating_mul(MAX_PENDING_BATCHES),
            state: Mutex::new(WriterState {
                buffer: VecDeque::with_capacity(max_buffer_size),
                active: None,
            }),
        })
    }

    fn file_for(&self, date: &str) -> PathBuf {
        self.base_dir.join(format!("{FILE_PREFIX}{date}{FILE_SUFFIX}"))
    }

    fn open_writer(&self, date: &str) -> PersistenceResult<ActiveWriter> {
        let path = self.file_for(date);
        info!(file = %path.display(), "Opening JSON Lines writer (append mode)");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ActiveWriter {
            writer: BufWriter::new(file),
            date: date.to_string(),
            records_written: 0,
        })
    }

    fn close_writer(active: ActiveWriter) {
        let ActiveWriter {
            mut writer,
            date,
            records_written,
        } = active;
        if let Err(e) = writer.flush() {
            warn!(?e, "Failed to flush writer on close");
        }
        info!(date = %date, records = records_written, "Closed JSON Lines writer");
    }

    fn flush_locked(&self, state: &mut WriterState) -> PersistenceResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        let today = Utc::now().format("%Y-%m-%d").to_string();
        if state.active.as_ref().is_some_and(|w| w.date != today) {
            if let Some(previous) = state.active.take() {
                Self::close_writer(previous);
            }
        }

        if state.active.is_none() {
            state.active = Some(self.open_writer(&today)?);
        }
        let Some(active) = state.active.as_mut() else {
            return Ok(());
        };

        let mut count = 0;
        while let Some(record) = state.buffer.front() {
            match serde_json::to_string(record) {
                Ok(json) => {
                    writeln!(active.writer, "{json}")?;
                    count += 1;
                }
                Err(e) => {
                    warn!(alert_id = %record.alert_id, error = %e, "Dropping unserializable alert record");
                }
            }
            state.buffer.pop_front();
        }
        active.writer.flush()?;

        active.records_written += count;
        debug!(date = %today, records = count, "Flushed alert records to JSON Lines");
        Ok(())
    }

    fn data_files(&self) -> PersistenceResult<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.base_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Records not yet handed to the writer.
    pub fn pending_len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Flush and close the active file.
    pub fn close(&self) -> PersistenceResult<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)?;
        if let Some(active) = state.active.take() {
            Self::close_writer(active);
        }
        Ok(())
    }
}

impl AlertStore for JsonLinesStore {
    fn store(&self, record: AlertRecord) -> PersistenceResult<()> {
        let mut state = self.state.lock();
        if state.buffer.len() >= self.max_pending {
            if let Some(dropped) = state.buffer.pop_front() {
                warn!(
                    alert_id = %dropped.alert_id,
                    max_pending = self.max_pending,
                    "Alert store backlog full, dropping oldest unwritten record"
                );
            }
        }
        state.buffer.push_back(record);
        if state.buffer.len() >= self.max_buffer_size {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Reads every data file plus the unflushed buffer. Corrupt lines are
    /// skipped.
    fn query(&self, filter: &RecordFilter) -> PersistenceResult<Vec<AlertRecord>> {
        let mut matched: Vec<AlertRecord> = {
            let state = self.state.lock();
            state
                .buffer
                .iter()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect()
        };

        for path in self.data_files()? {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AlertRecord>(&line) {
                    Ok(record) if filter.matches(&record) => matched.push(record),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(file = %path.display(), line = line_no + 1, error = %e, "Skipping corrupt alert record");
                    }
                }
            }
        }

        Ok(filter.finish(matched))
    }

    fn flush(&self) -> PersistenceResult<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }
}

impl Drop for JsonLinesStore {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(e) = self.flush_locked(&mut state) {
            warn!(?e, "Failed to flush alert records on drop");
        }
        if let Some(active) = state.active.take() {
            Self::close_writer(active);
        }
    }
}
