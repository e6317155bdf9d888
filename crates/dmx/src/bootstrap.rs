//! 🏗️ Bootstrap — make sure the index exists before anybody writes to it.
//!
//! 🎬 COLD OPEN — INT. CONSTRUCTION SITE — BEFORE DAWN
//!
//! You cannot move furniture into a house that has not been built. You also should not build the
//! house twice because you forgot you already built it yesterday. This module builds the house
//! once, waits for the concrete to set, paints the rooms (mappings), waits again, and on every
//! later visit just checks the house is still there and walks away.
//!
//! ## Knowledge Graph 🧠
//! - `IndexDescriptor`: name, shards, replicas, analysis block, ordered per-type mappings.
//! - `Bootstrapper::ensure_index`: exists? → done. Otherwise create → wait until ready →
//!   settle → mappings in order → settle.
//! - Waits are a `ConvergencePolicy` (bounded retries + settle delay), cancellable via `Shutdown`.
//! - Store failures become `Bootstrap` errors; an unreachable store stays a `Connection` error.
//!
//! 🦆 The duck is a load-bearing duck. Do not remove the duck.

use std::path::Path;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::backends::Store;
use crate::convergence::{ConvergencePolicy, Shutdown};
use crate::errors::PipelineError;

/// 🗺️ The mapping group used when the config does not name one.
pub const DEFAULT_MAPPING_GROUP: &str = "geopro";

/// 📐 Everything needed to create an index from scratch.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptor {
    pub name: String,
    pub shards: u32,
    pub replicas: u32,
    /// 🔤 The `analysis` block of the settings.
    pub analysis: Value,
    /// 🗺️ `(doc_type, mapping)` pairs, applied in this order.
    pub mappings: Vec<(String, Value)>,
}

impl IndexDescriptor {
    /// 🏗️ A descriptor with the `lower_keyword` analyzer and no mappings yet.
    pub fn new(name: impl Into<String>, shards: u32, replicas: u32) -> Self {
        Self {
            name: name.into(),
            shards,
            replicas,
            analysis: lower_keyword_analysis(),
            mappings: Vec::new(),
        }
    }

    pub fn with_mapping(mut self, doc_type: impl Into<String>, mapping: Value) -> Self {
        self.mappings.push((doc_type.into(), mapping));
        self
    }

    pub fn with_mappings(mut self, mappings: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.mappings.extend(mappings);
        self
    }

    /// 📦 The `PUT /{index}` body.
    pub fn settings_body(&self) -> Value {
        json!({
            "settings": {
                "index": {
                    "number_of_shards": self.shards,
                    "number_of_replicas": self.replicas
                },
                "analysis": self.analysis
            }
        })
    }
}

/// 🔤 Case-insensitive exact matching: the whole value is one token, lowercased.
pub fn lower_keyword_analysis() -> Value {
    json!({
        "analyzer": {
            "lower_keyword": {
                "type": "custom",
                "tokenizer": "keyword",
                "filter": "lowercase"
            }
        }
    })
}

/// 📂 Read `{ "<group>": { "<doc_type>": <mapping>, ... } }` and return the group's mappings.
///
/// Doc types come back sorted by name, so the order mappings are applied in never depends on
/// how somebody's editor happened to save the file.
pub async fn load_mappings(
    path: &Path,
    group: &str,
) -> Result<Vec<(String, Value)>, PipelineError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
        PipelineError::Config(format!(
            "could not read mappings file '{}': {err}",
            path.display()
        ))
    })?;
    parse_mappings(&raw, group).map_err(|reason| {
        PipelineError::Config(format!("mappings file '{}': {reason}", path.display()))
    })
}

fn parse_mappings(raw: &str, group: &str) -> Result<Vec<(String, Value)>, String> {
    let parsed: Value = serde_json::from_str(raw).map_err(|err| format!("not JSON ({err})"))?;
    let group_mappings = parsed
        .get(group)
        .ok_or_else(|| format!("no mapping group named '{group}'"))?
        .as_object()
        .ok_or_else(|| format!("mapping group '{group}' is not an object"))?;
    let mut mappings: Vec<(String, Value)> = group_mappings
        .iter()
        .map(|(doc_type, mapping)| (doc_type.clone(), mapping.clone()))
        .collect();
    mappings.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(mappings)
}

/// 🏁 What `ensure_index` ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapAction {
    /// 🏠 The index was already there. Nothing was touched.
    AlreadyPresent,
    /// 🏗️ Created from scratch, with this many mappings applied.
    Created { mappings_applied: usize },
}

/// 🏗️ Idempotent index setup over any [`Store`].
#[derive(Debug)]
pub struct Bootstrapper<S: Store> {
    store: S,
    policy: ConvergencePolicy,
    shutdown: Shutdown,
}

impl<S: Store> Bootstrapper<S> {
    pub fn new(store: S, policy: ConvergencePolicy, shutdown: Shutdown) -> Self {
        Self {
            store,
            policy,
            shutdown,
        }
    }

    /// 🏗️ Make sure `descriptor.name` exists. Create it and its mappings if it does not.
    pub async fn ensure_index(
        &self,
        descriptor: &IndexDescriptor,
    ) -> Result<BootstrapAction, PipelineError> {
        let index = descriptor.name.as_str();
        let exists = self
            .store
            .index_exists(index)
            .await
            .map_err(|err| PipelineError::bootstrap(index, err))?;
        if exists {
            debug!("🏠 index '{index}' already exists, nothing to bootstrap");
            return Ok(BootstrapAction::AlreadyPresent);
        }

        debug!("🏗️ index '{index}' does not exist, creating it");
        match self
            .store
            .create_index(index, &descriptor.settings_body())
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {
                // -- another loader got there between our check and our create; it owns the mappings
                info!("🏠 index '{index}' was created by someone else in the meantime");
                return Ok(BootstrapAction::AlreadyPresent);
            }
            Err(err) => return Err(PipelineError::bootstrap(index, err)),
        }

        let ready = self
            .policy
            .ready
            .wait_until(&self.shutdown, || self.store.index_ready(index))
            .await?
            .map_err(|err| PipelineError::bootstrap(index, err))?;
        if !ready {
            // -- bounded patience ran out; the mappings may still land, the settle delay helps
            warn!(
                "⏳ index '{index}' not reported ready after {} probe(s), carrying on",
                self.policy.ready.attempts
            );
        }
        self.shutdown.sleep(self.policy.settle_delay).await?;

        for (doc_type, mapping) in &descriptor.mappings {
            debug!("🗺️ applying mapping for doc type '{doc_type}' on '{index}'");
            self.store
                .put_mapping(index, doc_type, mapping)
                .await
                .map_err(|err| PipelineError::bootstrap(index, err))?;
        }
        if !descriptor.mappings.is_empty() {
            self.shutdown.sleep(self.policy.settle_delay).await?;
        }

        info!(
            "🏗️ created index '{index}' with {} mapping(s)",
            descriptor.mappings.len()
        );
        Ok(BootstrapAction::Created {
            mappings_applied: descriptor.mappings.len(),
        })
    }
}
