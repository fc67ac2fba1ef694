// ABOUTME: Persistence layer for beacon, implementing the LogStore capability.
// ABOUTME: Provides a durable SQLite store and a volatile in-memory store.

pub mod memory;
mod pending;
pub mod sqlite;

pub use memory::MemoryLogStore;
pub use sqlite::SqliteLogStore;
