// ABOUTME: Core library for beacon, containing the record types and storage/metadata capabilities.
// ABOUTME: This crate defines the shared data model used by the store, transport, and channel crates.

pub mod log;
pub mod metadata;
pub mod store;

pub use log::{Device, Log, LogContainer};
pub use metadata::{MetadataError, MetadataSource, StaticMetadata};
pub use store::{LogBatch, LogStore, StoreError};
