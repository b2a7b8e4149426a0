//! Embedded, single-writer durable store for one stack root
//! (`spec.md` §4.3, §4.6, §6 "Durable state layout").
//!
//! An [`ktl_protocol::external`] consumer typically only needs [`Store`],
//! which bundles the event log, lock lease table, and mirror session/frame
//! tables behind one shared [`Writer`].

pub mod digest;
mod error;
mod event_store;
mod lock_manager;
mod schema;
mod session_store;
mod writer;

use std::path::Path;

pub use error::StoreError;
pub use event_store::EventStore;
pub use lock_manager::LockManager;
pub use session_store::SessionStore;
pub use writer::Writer;

/// Convenience bundle over the three sub-stores, all sharing one
/// [`Writer`] so they serialize through the same connection.
#[derive(Clone)]
pub struct Store {
    pub events: EventStore,
    pub locks: LockManager,
    pub sessions: SessionStore,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let writer = Writer::open(path)?;
        Ok(Self::from_writer(writer))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_writer(Writer::open_in_memory()?))
    }

    fn from_writer(writer: Writer) -> Self {
        Self {
            events: EventStore::new(writer.clone()),
            locks: LockManager::new(writer.clone()),
            sessions: SessionStore::new(writer),
        }
    }
}
