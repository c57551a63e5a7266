//! In-memory alert store.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

use crate::error::PersistenceResult;
use crate::record::{AlertRecord, RecordFilter};
use crate::store::AlertStore;

/// Bounded in-memory store. The oldest record is dropped at capacity.
#[derive(Debug)]
pub struct MemoryStore {
    records: Mutex<VecDeque<AlertRecord>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AlertStore for MemoryStore {
    fn store(&self, record: AlertRecord) -> PersistenceResult<()> {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        trace!(alert_id = %record.alert_id, outcome = %record.outcome, "Stored alert record");
        records.push_back(record);
        Ok(())
    }

    fn query(&self, filter: &RecordFilter) -> PersistenceResult<Vec<AlertRecord>> {
        let matched = self
            .records
            .lock()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(filter.finish(matched))
    }
}
