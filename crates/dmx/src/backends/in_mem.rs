//! # Previously, on dmx...
//!
//! 🎬 The cluster was down. The demo was in ten minutes. Someone said "can't we just pretend?"
//! And so this module was born: a source that replays lines from a `Vec`, and a store that keeps
//! indices in a `HashMap` and behaves, as far as the pipeline can tell, like the real thing.
//!
//! `InMemoryStore` emulates what matters:
//! - upsert: insert the full document when the identity is absent,
//! - shallow merge: overwrite only the top-level fields the payload mentions,
//! - conflict retry: injected version conflicts burn the per-item retry budget before
//!   the item gives up as `Conflicted`,
//! - eventual consistency: readiness probes can be told to say "not yet" a few times.
//!
//! It also keeps a call log, so tests can count creates, mappings and bulk sizes.
//!
//! 🦆 ⚠️ This is NOT for production. This is for tests. And for demos that were
//! supposed to use the real cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::backends::{Source, Store};
use crate::common::{BulkOperation, RawRecord, WriteOutcome};
use crate::errors::{PipelineError, StoreError};

/// 📦 A source that replays lines held in memory, with the same validation as the file one.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    lines: Vec<String>,
    delimiter: u8,
    cursor: usize,
}

impl InMemorySource {
    /// 🚀 Lines in, records out. No disk was harmed.
    pub fn new<I, S>(lines: I, delimiter: u8) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            delimiter,
            cursor: 0,
        }
    }
}

#[async_trait]
impl Source for InMemorySource {
    async fn next_record(&mut self) -> Result<Option<RawRecord>, PipelineError> {
        while let Some(line) = self.lines.get(self.cursor) {
            self.cursor += 1;
            if line.is_empty() {
                continue;
            }
            return RawRecord::parse(self.cursor as u64, line, self.delimiter).map(Some);
        }
        Ok(None)
    }

    async fn restart(&mut self) -> Result<(), PipelineError> {
        self.cursor = 0;
        Ok(())
    }

    fn location(&self) -> &str {
        "memory"
    }
}

/// 📊 What the store has been asked to do. Tests read this to count calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLog {
    pub exists: usize,
    pub creates: usize,
    pub ready_probes: usize,
    pub mappings: Vec<(String, String)>,
    /// Size of each bulk request, in call order.
    pub bulk_sizes: Vec<usize>,
}

#[derive(Debug, Default)]
struct IndexState {
    settings: Value,
    mappings: Vec<(String, Value)>,
    docs: BTreeMap<String, Map<String, Value>>,
}

#[derive(Debug, Default)]
struct StoreState {
    indices: HashMap<String, IndexState>,
    calls: CallLog,
    pending_conflicts: HashMap<String, u32>,
    poisoned_keys: HashMap<String, String>,
    unready_probes: u32,
    stale_exists_checks: u32,
    unreachable: bool,
    bulk_delay: Duration,
    rejected_bulks: Vec<u16>,
}

/// 🗄️ A store that lives in RAM and acts like a small, very agreeable cluster.
///
/// Clone-able: every clone shares the same state, so two runs can race on it and a test can
/// peek inside afterwards.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// ⚔️ The next `count` write attempts on `merge_key` lose a version race.
    pub async fn inject_conflicts(&self, merge_key: &str, count: u32) {
        *self
            .state
            .lock()
            .await
            .pending_conflicts
            .entry(merge_key.to_string())
            .or_default() += count;
    }

    /// 💀 Every write on `merge_key` fails with `reason`, like a mapping that rejects the payload.
    pub async fn poison_key(&self, merge_key: &str, reason: &str) {
        self.state
            .lock()
            .await
            .poisoned_keys
            .insert(merge_key.to_string(), reason.to_string());
    }

    /// ⏳ The next `probes` readiness probes answer "not yet".
    pub async fn delay_readiness(&self, probes: u32) {
        self.state.lock().await.unready_probes = probes;
    }

    /// 🏎️ The next `checks` existence checks answer "no", as if another loader created the
    /// index right after we looked.
    pub async fn miss_existence_checks(&self, checks: u32) {
        self.state.lock().await.stale_exists_checks = checks;
    }

    /// 🔌 Pretend the network cable fell out (or got plugged back in).
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// 🐌 Every bulk call sits on its hands for `delay` before answering.
    pub async fn slow_down_bulk(&self, delay: Duration) {
        self.state.lock().await.bulk_delay = delay;
    }

    /// 🙅 The next bulk call is refused as a whole with `status`.
    pub async fn reject_next_bulk(&self, status: u16) {
        self.state.lock().await.rejected_bulks.push(status);
    }

    /// 🌱 Put a document in place directly, skipping the pipeline.
    pub async fn seed(&self, index: &str, merge_key: &str, document: Value) {
        let fields = match document {
            Value::Object(fields) => fields,
            other => {
                let mut fields = Map::new();
                fields.insert("value".to_string(), other);
                fields
            }
        };
        self.state
            .lock()
            .await
            .indices
            .entry(index.to_string())
            .or_default()
            .docs
            .insert(merge_key.to_string(), fields);
    }

    /// 🔍 The stored document for `merge_key`, if any.
    pub async fn document(&self, index: &str, merge_key: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .and_then(|state| state.docs.get(merge_key))
            .cloned()
            .map(Value::Object)
    }

    /// 📏 How many documents live in `index`.
    pub async fn document_count(&self, index: &str) -> usize {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .map(|state| state.docs.len())
            .unwrap_or(0)
    }

    /// 🧾 The settings body `index` was created with.
    pub async fn settings(&self, index: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .map(|state| state.settings.clone())
    }

    /// 🗺️ The mappings applied to `index`, in application order.
    pub async fn mappings(&self, index: &str) -> Vec<(String, Value)> {
        self.state
            .lock()
            .await
            .indices
            .get(index)
            .map(|state| state.mappings.clone())
            .unwrap_or_default()
    }

    /// 📊 A copy of the call log.
    pub async fn calls(&self) -> CallLog {
        self.state.lock().await.calls.clone()
    }
}

fn guard_reachable(state: &StoreState) -> Result<(), StoreError> {
    if state.unreachable {
        Err(StoreError::Connection(
            "in-memory store is pretending to be unreachable".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// 🔄 Shallow merge: top-level fields in `payload` replace their stored twins, the rest stay.
fn shallow_merge(stored: &mut Map<String, Value>, payload: &Map<String, Value>) {
    for (field, value) in payload {
        stored.insert(field.clone(), value.clone());
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        guard_reachable(&state)?;
        state.calls.exists += 1;
        if state.stale_exists_checks > 0 {
            state.stale_exists_checks -= 1;
            return Ok(false);
        }
        Ok(state.indices.contains_key(index))
    }

    async fn create_index(&self, index: &str, settings: &Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        guard_reachable(&state)?;
        state.calls.creates += 1;
        if state.indices.contains_key(index) {
            return Err(StoreError::Rejected {
                status: 400,
                body: format!("resource_already_exists_exception: index [{index}] already exists"),
            });
        }
        state.indices.insert(
            index.to_string(),
            IndexState {
                settings: settings.clone(),
                ..IndexState::default()
            },
        );
        Ok(())
    }

    async fn index_ready(&self, index: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        guard_reachable(&state)?;
        state.calls.ready_probes += 1;
        if state.unready_probes > 0 {
            state.unready_probes -= 1;
            return Ok(false);
        }
        Ok(state.indices.contains_key(index))
    }

    async fn put_mapping(
        &self,
        index: &str,
        doc_type: &str,
        mapping: &Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        guard_reachable(&state)?;
        state
            .calls
            .mappings
            .push((index.to_string(), doc_type.to_string()));
        let Some(index_state) = state.indices.get_mut(index) else {
            return Err(StoreError::Rejected {
                status: 404,
                body: format!("index_not_found_exception: no such index [{index}]"),
            });
        };
        index_state
            .mappings
            .push((doc_type.to_string(), mapping.clone()));
        Ok(())
    }

    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
        retry_on_conflict: u32,
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        let delay = self.state.lock().await.bulk_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().await;
        guard_reachable(&state)?;
        state.calls.bulk_sizes.push(operations.len());
        if !state.rejected_bulks.is_empty() {
            let status = state.rejected_bulks.remove(0);
            return Err(StoreError::Rejected {
                status,
                body: "in-memory store refused the whole bulk request".to_string(),
            });
        }

        let attempts = retry_on_conflict.saturating_add(1);
        let mut outcomes = Vec::with_capacity(operations.len());
        for op in operations {
            if let Some(reason) = state.poisoned_keys.get(&op.merge_key) {
                outcomes.push(WriteOutcome::failed(reason.clone()));
                continue;
            }

            // ⚔️ each injected conflict eats one attempt of this item's budget
            let pending = state
                .pending_conflicts
                .get(&op.merge_key)
                .copied()
                .unwrap_or(0);
            if pending >= attempts {
                state
                    .pending_conflicts
                    .insert(op.merge_key.clone(), pending - attempts);
                outcomes.push(WriteOutcome::Conflicted {
                    reason: format!(
                        "version_conflict_engine_exception: [{}] still conflicting after {} attempts",
                        op.merge_key, attempts
                    ),
                });
                continue;
            }
            state.pending_conflicts.remove(&op.merge_key);

            // -- ES creates the index on first write; so do we
            let docs = &mut state.indices.entry(index.to_string()).or_default().docs;
            let payload = op.document.fields();
            match docs.get_mut(&op.merge_key) {
                Some(stored) => {
                    shallow_merge(stored, payload);
                    outcomes.push(WriteOutcome::Merged);
                }
                None => {
                    docs.insert(op.merge_key.clone(), payload.clone());
                    outcomes.push(WriteOutcome::Inserted);
                }
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{OpKind, OutputDocument};
    use serde_json::json;

    fn op(key: &str, pairs: &[(&str, &str)]) -> BulkOperation {
        let mut document = OutputDocument::new(key);
        for (k, v) in pairs {
            document.insert_entry(k, v);
        }
        BulkOperation {
            kind: OpKind::MergeOrInsert,
            doc_type: "currency".into(),
            merge_key: key.into(),
            document,
        }
    }

    #[tokio::test]
    async fn the_one_where_the_same_operation_twice_changes_nothing() {
        let store = InMemoryStore::new();
        let once = op("2024-01-05", &[("USD", "1.08")]);

        let first = store.bulk("rates", &[once.clone()], 100).await.expect("💀 bulk");
        assert_eq!(first, vec![WriteOutcome::Inserted]);
        let after_once = store.document("rates", "2024-01-05").await;

        let second = store.bulk("rates", &[once], 100).await.expect("💀 bulk");
        assert_eq!(second, vec![WriteOutcome::Merged]);
        assert_eq!(store.document("rates", "2024-01-05").await, after_once);
    }

    #[tokio::test]
    async fn the_one_where_merging_b_leaves_a_alone() {
        let store = InMemoryStore::new();
        store
            .bulk("rates", &[op("2024-01-05", &[("USD", "1.08")])], 100)
            .await
            .expect("💀 bulk");
        store
            .bulk("rates", &[op("2024-01-05", &[("JPY", "160.2")])], 100)
            .await
            .expect("💀 bulk");

        assert_eq!(
            store.document("rates", "2024-01-05").await,
            Some(json!({
                "date_operation": "2024-01-05",
                "USD": { "libelle": "USD", "value": "1.08" },
                "JPY": { "libelle": "JPY", "value": "160.2" }
            }))
        );
    }

    #[tokio::test]
    async fn the_one_where_conflicts_beyond_the_budget_are_reported() {
        let store = InMemoryStore::new();
        store.inject_conflicts("2024-01-05", 5).await;

        let outcomes = store
            .bulk("rates", &[op("2024-01-05", &[("USD", "1.08")])], 2)
            .await
            .expect("💀 bulk");
        assert!(matches!(outcomes[0], WriteOutcome::Conflicted { .. }));
        assert_eq!(store.document("rates", "2024-01-05").await, None);

        // -- 5 - 3 = 2 conflicts left, a budget of 2 retries (3 attempts) now wins
        let outcomes = store
            .bulk("rates", &[op("2024-01-05", &[("USD", "1.08")])], 2)
            .await
            .expect("💀 bulk");
        assert_eq!(outcomes, vec![WriteOutcome::Inserted]);
    }

    #[tokio::test]
    async fn the_one_where_the_cable_is_unplugged() {
        let store = InMemoryStore::new();
        store.set_unreachable(true).await;
        let err = store.index_exists("rates").await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn the_one_where_the_source_replays_on_restart() {
        let mut source = InMemorySource::new(["2024-01-05|USD:1.08", "", "2024-01-06"], b'|');
        let first = source.next_record().await.expect("💀 read").expect("💀 some");
        assert_eq!(first.offset, 1);
        let second = source.next_record().await.expect("💀 read").expect("💀 some");
        assert_eq!(second.offset, 3);
        assert!(source.next_record().await.expect("💀 read").is_none());

        source.restart().await.expect("💀 restart");
        assert!(source.next_record().await.expect("💀 read").is_some());
    }
}
