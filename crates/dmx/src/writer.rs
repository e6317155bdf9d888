//! 📦 The Bulk Merge Writer — buffers operations, ships them in batches, reports every item.
//!
//! 🎬 *[a buffer fills. at exactly `batch_size` operations, it empties.]*
//! *[nobody applauds. this is the correct amount of applause for a flush.]*
//!
//! ## Knowledge Graph 🧠
//! - Owns the in-flight batch (a plain `Vec<BulkOperation>`). Nothing else ever sees it.
//! - `push` appends and flushes at `batch_size`; `flush` ships whatever is buffered.
//! - One flush = one `Store::bulk` call, awaited under `tokio::time::timeout`.
//! - Item trouble (conflicts, rejections) comes back as `WriteOutcome`s, in input order.
//! - A whole-batch failure (timeout, non-2xx, transport hiccup) marks every item `Failed`.
//!   Only an unreachable store is fatal.
//! - The buffer is emptied after every flush, whatever happened to its items. No auto-retry.
//!
//! 🦆 (the duck has no comment at this time)

use std::time::Duration;

use tracing::{debug, warn};

use crate::backends::Store;
use crate::common::{BulkOperation, WriteOutcome};
use crate::errors::{PipelineError, StoreError};

/// 🔧 Knobs for the writer. Built from the `[store]` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    pub index: String,
    /// 📦 Operations per bulk request. At least one, or the buffer would never ship.
    pub batch_size: usize,
    /// ⏱️ Deadline for one flush.
    pub timeout: Duration,
    /// ⚔️ Store-side retries per item on a version conflict.
    pub retry_on_conflict: u32,
}

/// 📊 What one flush produced: `(merge_key, outcome)` pairs in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub items: Vec<(String, WriteOutcome)>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn inserted(&self) -> usize {
        self.count(|outcome| matches!(outcome, WriteOutcome::Inserted))
    }

    pub fn merged(&self) -> usize {
        self.count(|outcome| matches!(outcome, WriteOutcome::Merged))
    }

    pub fn conflicted(&self) -> usize {
        self.count(|outcome| matches!(outcome, WriteOutcome::Conflicted { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, WriteOutcome::Failed { .. }))
    }

    pub fn applied(&self) -> usize {
        self.count(WriteOutcome::is_applied)
    }

    fn count(&self, predicate: impl Fn(&WriteOutcome) -> bool) -> usize {
        self.items
            .iter()
            .filter(|(_, outcome)| predicate(outcome))
            .count()
    }
}

/// 🧮 Running totals across every flush of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterTotals {
    pub attempted: u64,
    pub inserted: u64,
    pub merged: u64,
    pub conflicted: u64,
    pub failed: u64,
    /// 📡 Bulk requests actually sent (or attempted).
    pub batches: u64,
}

impl WriterTotals {
    fn record(&mut self, result: &BatchResult) {
        self.attempted += result.len() as u64;
        self.inserted += result.inserted() as u64;
        self.merged += result.merged() as u64;
        self.conflicted += result.conflicted() as u64;
        self.failed += result.failed() as u64;
        self.batches += 1;
    }

    pub fn applied(&self) -> u64 {
        self.inserted + self.merged
    }
}

/// 📦 Batches operations and merges them into the store.
#[derive(Debug)]
pub struct BulkMergeWriter<S: Store> {
    store: S,
    config: WriterConfig,
    buffer: Vec<BulkOperation>,
    totals: WriterTotals,
}

impl<S: Store> BulkMergeWriter<S> {
    pub fn new(store: S, config: WriterConfig) -> Self {
        // -- a batch size of zero would buffer forever; treat it as one
        let capacity = config.batch_size.max(1);
        Self {
            store,
            config: WriterConfig {
                batch_size: capacity,
                ..config
            },
            buffer: Vec::with_capacity(capacity),
            totals: WriterTotals::default(),
        }
    }

    /// ➕ Buffer one operation. Returns the batch result when this push filled the buffer.
    pub async fn push(
        &mut self,
        operation: BulkOperation,
    ) -> Result<Option<BatchResult>, PipelineError> {
        self.buffer.push(operation);
        if self.buffer.len() >= self.config.batch_size {
            return self.flush().await.map(Some);
        }
        Ok(None)
    }

    /// 🚽 Ship everything buffered as one bulk request.
    ///
    /// 💀 Only `Connection` comes back as an `Err`. Everything else is per-item outcomes.
    pub async fn flush(&mut self) -> Result<BatchResult, PipelineError> {
        if self.buffer.is_empty() {
            return Ok(BatchResult::default());
        }
        let batch = std::mem::take(&mut self.buffer);
        self.buffer.reserve(self.config.batch_size);
        debug!(
            "🚽 flushing {} operation(s) to '{}'",
            batch.len(),
            self.config.index
        );

        let response = tokio::time::timeout(
            self.config.timeout,
            self.store
                .bulk(&self.config.index, &batch, self.config.retry_on_conflict),
        )
        .await;

        let outcomes = match response {
            Ok(Ok(outcomes)) => outcomes,
            Ok(Err(err)) if err.is_connection() => {
                let result = whole_batch_failed(&batch, &err);
                self.totals.record(&result);
                return Err(PipelineError::Connection(err.to_string()));
            }
            Ok(Err(err)) => {
                warn!("💀 bulk request failed as a whole: {err}");
                whole_batch_outcomes(batch.len(), &err)
            }
            Err(_) => {
                let err = StoreError::Timeout(self.config.timeout);
                warn!("⏱️ {err}, marking the batch as failed");
                whole_batch_outcomes(batch.len(), &err)
            }
        };

        let result = BatchResult {
            items: batch
                .into_iter()
                .map(|op| op.merge_key)
                .zip(outcomes)
                .collect(),
        };
        for (merge_key, outcome) in &result.items {
            match outcome {
                WriteOutcome::Conflicted { reason } => {
                    warn!("⚔️ '{merge_key}' still conflicting after retries: {reason}")
                }
                WriteOutcome::Failed { reason } => warn!("💀 '{merge_key}' failed: {reason}"),
                _ => {}
            }
        }
        debug!(
            "📊 batch done: {} inserted, {} merged, {} conflicted, {} failed",
            result.inserted(),
            result.merged(),
            result.conflicted(),
            result.failed()
        );
        self.totals.record(&result);
        Ok(result)
    }

    /// 📏 Operations waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn totals(&self) -> WriterTotals {
        self.totals
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }
}

fn whole_batch_outcomes(len: usize, err: &StoreError) -> Vec<WriteOutcome> {
    vec![WriteOutcome::failed(err.to_string()); len]
}

fn whole_batch_failed(batch: &[BulkOperation], err: &StoreError) -> BatchResult {
    BatchResult {
        items: batch
            .iter()
            .map(|op| (op.merge_key.clone(), WriteOutcome::failed(err.to_string())))
            .collect(),
    }
}
