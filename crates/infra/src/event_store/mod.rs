//! Append-only event store boundary.
//!
//! `EventStore` is the storage-agnostic contract. `KeyedEventStore` implements it
//! over any `StorageBackend` (an in-memory one for tests, SQLite for durability).
//! `StoreEventSource` lets projections re-read what they missed.

pub mod backend;
pub mod in_memory;
pub mod keyed;
pub mod source;
pub mod sqlite;
pub mod r#trait;

pub use backend::{BackendError, Item, StorageBackend};
pub use in_memory::InMemoryBackend;
pub use keyed::KeyedEventStore;
pub use source::StoreEventSource;
pub use sqlite::SqliteBackend;
pub use r#trait::{
    EventStore, EventStoreError, EventStream, StoredEvent, UncommittedEvent, load_events,
};
