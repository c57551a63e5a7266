//! Store collaborator trait and backend selection.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{PersistenceError, PersistenceResult};
use crate::jsonl::JsonLinesStore;
use crate::memory::MemoryStore;
use crate::record::{AlertRecord, RecordFilter};

/// Persistence collaborator of the dispatcher.
///
/// Methods are synchronous and must not block for long; backends buffer
/// writes and flush in batches.
pub trait AlertStore: Send + Sync {
    /// Persist one terminal outcome.
    fn store(&self, record: AlertRecord) -> PersistenceResult<()>;

    /// Records matching `filter`, newest first.
    fn query(&self, filter: &RecordFilter) -> PersistenceResult<Vec<AlertRecord>>;

    /// Push buffered records to durable storage.
    fn flush(&self) -> PersistenceResult<()> {
        Ok(())
    }
}

/// Storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Jsonl,
}

/// `[persistence]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Directory for `.jsonl` files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Records buffered before a JSON Lines flush. Default: 100.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Records kept by the memory backend. Default: 10,000.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

fn default_data_dir() -> String {
    "data/alerts".to_string()
}

fn default_buffer_size() -> usize {
    100
}

fn default_memory_capacity() -> usize {
    10_000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            data_dir: default_data_dir(),
            buffer_size: default_buffer_size(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> PersistenceResult<()> {
        if self.buffer_size == 0 {
            return Err(PersistenceError::Config(
                "persistence.buffer_size must be positive".to_string(),
            ));
        }
        if self.memory_capacity == 0 {
            return Err(PersistenceError::Config(
                "persistence.memory_capacity must be positive".to_string(),
            ));
        }
        if self.backend == StoreBackend::Jsonl && self.data_dir.trim().is_empty() {
            return Err(PersistenceError::Config(
                "persistence.data_dir is required for the jsonl backend".to_string(),
            ));
        }
        Ok(())
    }
}

/// Open the configured backend.
pub fn open_store(config: &PersistenceConfig) -> PersistenceResult<Arc<dyn AlertStore>> {
    config.validate()?;
    let store: Arc<dyn AlertStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(config.memory_capacity)),
        StoreBackend::Jsonl => Arc::new(JsonLinesStore::open(&config.data_dir, config.buffer_size)?),
    };
    Ok(store)
}
