//! Alert outcome persistence.
//!
//! The dispatcher calls `AlertStore::store` on every terminal outcome and the
//! HTTP API reads back through `AlertStore::query`. Two backends:
//! - `MemoryStore`: bounded ring buffer, newest records kept
//! - `JsonLinesStore`: buffered, daily-rotated `.jsonl` files

pub mod error;
pub mod jsonl;
pub mod memory;
pub mod record;
pub mod store;

pub use error::{PersistenceError, PersistenceResult};
pub use jsonl::JsonLinesStore;
pub use memory::MemoryStore;
pub use record::{AlertRecord, RecordFilter};
pub use store::{open_store, AlertStore, PersistenceConfig, StoreBackend};
