//! 🔌 Backends — where the real I/O happens.
//!
//! 🚰 Sources pour records in, Stores take documents out. In between, a pure transform
//! and a bulk writer, neither of which knows which backend it is talking to.
//!
//! 🎭 This module is the casting agency. Need to read a pipe-delimited file? Replay lines
//! from memory? Upsert into an Elasticsearch cluster, or into a HashMap pretending to be one?
//! We've got a backend for that.
//!
//! 🧠 Knowledge graph:
//! - Pattern: trait → concrete impls → backend enum that dispatches → built from config
//! - `Source`: `FileSource`, `InMemorySource` → `SourceBackend`
//! - `Store`: `ElasticsearchStore`, `InMemoryStore` → `StoreBackend`
//! - Stores are `&self` + `Clone` because the writer and the bootstrapper each hold one,
//!   and because two runs sharing one store is exactly the race we need to be able to test.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use async_trait::async_trait;
use serde_json::Value;

use crate::common::{BulkOperation, RawRecord, WriteOutcome};
use crate::errors::{PipelineError, StoreError};

pub mod elasticsearch;
pub mod file;
pub mod in_mem;

pub use elasticsearch::{ElasticsearchStore, ElasticsearchStoreConfig};
pub use file::{FileSource, FileSourceConfig};
pub use in_mem::{InMemorySource, InMemoryStore};

// ===== Source Trait and Backend Enum =====

/// 🚰 A lazy, finite, restartable sequence of raw records.
///
/// # Contract 📜
/// - `next_record` returns `Ok(Some(..))` while lines remain and `Ok(None)` at the end.
/// - A line that cannot be read as a record is an `Err(RecordFormat)` carrying its offset.
///   The runner aborts on it. No silent skipping.
/// - `restart` rewinds to the first line for the next pass.
#[async_trait]
pub trait Source: std::fmt::Debug + Send {
    /// 📄 Pull the next record, or `None` when the well is dry.
    async fn next_record(&mut self) -> Result<Option<RawRecord>, PipelineError>;

    /// ⏪ Rewind to the beginning. Every pass reads the whole source.
    async fn restart(&mut self) -> Result<(), PipelineError>;

    /// 📍 Where the records come from, for logs and error messages.
    fn location(&self) -> &str;
}

/// 🎭 The many faces of a Source.
#[derive(Debug)]
pub enum SourceBackend {
    InMemory(InMemorySource),
    File(FileSource),
}

#[async_trait]
impl Source for SourceBackend {
    async fn next_record(&mut self) -> Result<Option<RawRecord>, PipelineError> {
        match self {
            SourceBackend::InMemory(source) => source.next_record().await,
            SourceBackend::File(source) => source.next_record().await,
        }
    }

    async fn restart(&mut self) -> Result<(), PipelineError> {
        match self {
            SourceBackend::InMemory(source) => source.restart().await,
            SourceBackend::File(source) => source.restart().await,
        }
    }

    fn location(&self) -> &str {
        match self {
            SourceBackend::InMemory(source) => source.location(),
            SourceBackend::File(source) => source.location(),
        }
    }
}

// ===== Store Trait and Backend Enum =====

/// 🗄️ The wire contract with the document store.
///
/// # Contract 📜
/// - `index_exists`: boolean by name.
/// - `create_index`: one call, full settings body.
/// - `index_ready`: has the freshly created index converged enough to take writes?
/// - `put_mapping`: additive, one document type at a time.
/// - `bulk`: one round trip, one outcome per operation, same order as the input.
///   Conflict retries happen store-side, up to `retry_on_conflict` extra attempts per item.
///   Item-level trouble is an outcome, not an `Err`; `Err` means the whole call went wrong.
#[async_trait]
pub trait Store: std::fmt::Debug + Send + Sync {
    async fn index_exists(&self, index: &str) -> Result<bool, StoreError>;

    async fn create_index(&self, index: &str, settings: &Value) -> Result<(), StoreError>;

    async fn index_ready(&self, index: &str) -> Result<bool, StoreError>;

    async fn put_mapping(
        &self,
        index: &str,
        doc_type: &str,
        mapping: &Value,
    ) -> Result<(), StoreError>;

    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
        retry_on_conflict: u32,
    ) -> Result<Vec<WriteOutcome>, StoreError>;
}

/// 🎭 The many faces of a Store. Mirrors `SourceBackend` on the other end of the pipeline.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    InMemory(InMemoryStore),
    Elasticsearch(ElasticsearchStore),
}

#[async_trait]
impl Store for StoreBackend {
    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        match self {
            StoreBackend::InMemory(store) => store.index_exists(index).await,
            StoreBackend::Elasticsearch(store) => store.index_exists(index).await,
        }
    }

    async fn create_index(&self, index: &str, settings: &Value) -> Result<(), StoreError> {
        match self {
            StoreBackend::InMemory(store) => store.create_index(index, settings).await,
            StoreBackend::Elasticsearch(store) => store.create_index(index, settings).await,
        }
    }

    async fn index_ready(&self, index: &str) -> Result<bool, StoreError> {
        match self {
            StoreBackend::InMemory(store) => store.index_ready(index).await,
            StoreBackend::Elasticsearch(store) => store.index_ready(index).await,
        }
    }

    async fn put_mapping(
        &self,
        index: &str,
        doc_type: &str,
        mapping: &Value,
    ) -> Result<(), StoreError> {
        match self {
            StoreBackend::InMemory(store) => store.put_mapping(index, doc_type, mapping).await,
            StoreBackend::Elasticsearch(store) => {
                store.put_mapping(index, doc_type, mapping).await
            }
        }
    }

    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
        retry_on_conflict: u32,
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        match self {
            StoreBackend::InMemory(store) => store.bulk(index, operations, retry_on_conflict).await,
            StoreBackend::Elasticsearch(store) => {
                store.bulk(index, operations, retry_on_conflict).await
            }
        }
    }
}
