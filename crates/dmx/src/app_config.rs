//! 🔧 App Configuration — the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." — every developer at 6am, rates file in hand 🦆
//!
//! 🏗️ Powered by Figment. Layers, lowest to highest priority:
//! 1. `DMX_*` environment variables, nested with `__` (`DMX_STORE__URL`, `DMX_PIPELINE__PASSES`)
//! 2. the TOML file, if one was given
//! 3. command-line overrides (`--type-doc`, `--source-file`)
//!
//! Every backend keeps its own config struct next to its code; this module only stitches
//! them together and checks that the result holds up before anything touches the network.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{ElasticsearchStoreConfig, FileSourceConfig};
use crate::bootstrap::{DEFAULT_MAPPING_GROUP, IndexDescriptor, load_mappings};
use crate::convergence::{ConvergencePolicy, RetryPolicy};
use crate::errors::PipelineError;
use crate::writer::WriterConfig;

/// 📦 One struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 📡 Where the documents go.
    pub store: ElasticsearchStoreConfig,
    /// 📂 Where the records come from.
    pub source: FileSourceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// 🚰 What the run does with the records.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// 🏷️ Document type stamped on every operation (and the mapping it belongs to).
    #[serde(default)]
    pub doc_type: String,
    /// 🔁 Full reads of the source.
    #[serde(default = "default_passes")]
    pub passes: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            doc_type: String::new(),
            passes: default_passes(),
        }
    }
}

fn default_passes() -> u32 {
    1
}

/// 🏗️ How the index gets built the first time, and how long we wait for it.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// 🗺️ JSON file of mapping groups. No file, no mappings.
    #[serde(default)]
    pub mappings_file: Option<PathBuf>,
    #[serde(default = "default_mapping_group")]
    pub mapping_group: String,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    #[serde(default = "default_ready_backoff_ms")]
    pub ready_backoff_ms: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            mappings_file: None,
            mapping_group: default_mapping_group(),
            settle_delay_ms: default_settle_delay_ms(),
            ready_attempts: default_ready_attempts(),
            ready_backoff_ms: default_ready_backoff_ms(),
        }
    }
}

fn default_mapping_group() -> String {
    DEFAULT_MAPPING_GROUP.to_string()
}

fn default_settle_delay_ms() -> u64 {
    2_000
}

fn default_ready_attempts() -> u32 {
    10
}

fn default_ready_backoff_ms() -> u64 {
    250
}

/// 🎛️ Values from the command line. They beat the file and the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub doc_type: Option<String>,
    pub source_file: Option<String>,
}

impl AppConfig {
    /// ✅ Reject configurations that cannot possibly work, before anything runs.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.store.base_url()?;
        self.source.delimiter_byte()?;
        if self.store.index.trim().is_empty() {
            return Err(PipelineError::Config("store.index must not be empty".into()));
        }
        if self.store.bulk_size == 0 {
            return Err(PipelineError::Config(
                "store.bulk_size must be at least 1".into(),
            ));
        }
        if self.pipeline.passes == 0 {
            return Err(PipelineError::Config(
                "pipeline.passes must be at least 1".into(),
            ));
        }
        if self.pipeline.doc_type.trim().is_empty() {
            return Err(PipelineError::Config(
                "pipeline.doc_type is required (or pass --type-doc)".into(),
            ));
        }
        if self.source.file_name.trim().is_empty() {
            return Err(PipelineError::Config(
                "source.file_name is required (or pass --source-file)".into(),
            ));
        }
        Ok(())
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            index: self.store.index.clone(),
            batch_size: self.store.bulk_size,
            timeout: Duration::from_secs(self.store.timeout_secs),
            retry_on_conflict: self.store.retry_on_conflict,
        }
    }

    pub fn convergence_policy(&self) -> ConvergencePolicy {
        ConvergencePolicy {
            ready: RetryPolicy {
                attempts: self.bootstrap.ready_attempts,
                initial_backoff: Duration::from_millis(self.bootstrap.ready_backoff_ms),
                ..RetryPolicy::default()
            },
            settle_delay: Duration::from_millis(self.bootstrap.settle_delay_ms),
        }
    }

    /// 📐 The index to bootstrap, mappings loaded from the mappings file if there is one.
    pub async fn index_descriptor(&self) -> Result<IndexDescriptor, PipelineError> {
        let descriptor = IndexDescriptor::new(
            self.store.index.clone(),
            self.store.number_of_shards,
            self.store.number_of_replicas,
        );
        match &self.bootstrap.mappings_file {
            Some(path) => {
                let mappings = load_mappings(path, &self.bootstrap.mapping_group).await?;
                Ok(descriptor.with_mappings(mappings))
            }
            None => Ok(descriptor),
        }
    }
}

/// 🚀 Load the config — from env vars, an optional TOML file, and the command line.
///
/// 📐 DESIGN NOTE:
///   - `config_file_name` None  → env vars (+ overrides) only. No file. No assumptions.
///   - `config_file_name` Some  → env vars + TOML file, merged. TOML wins over env.
///   - overrides win over both.
///
/// 💀 Returns an error if the layers don't add up to an `AppConfig`. The message says which
/// layers were involved, so at least you know where to look.
pub fn load_config(
    config_file_name: Option<&Path>,
    overrides: &ConfigOverrides,
) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {}",
        config_file_name
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<environment only>".to_string())
    );
    figment_for(config_file_name, overrides)
        .extract()
        .with_context(|| match config_file_name {
            Some(path) => format!(
                "💀 Failed to parse configuration from file '{}' and environment variables (DMX_*). \
                 The file exists in our hearts, but apparently not in the right shape.",
                path.display()
            ),
            None => "💀 Failed to parse configuration from environment variables (DMX_*). \
                     No file was provided, so this one's all on the environment."
                .to_string(),
        })
}

fn figment_for(config_file_name: Option<&Path>, overrides: &ConfigOverrides) -> Figment {
    let mut config = Figment::new().merge(Env::prefixed("DMX_").split("__"));
    if let Some(file_name) = config_file_name {
        config = config.merge(Toml::file(file_name));
    }
    if let Some(doc_type) = &overrides.doc_type {
        config = config.merge(Serialized::default("pipeline.doc_type", doc_type));
    }
    if let Some(source_file) = &overrides.source_file {
        config = config.merge(Serialized::default("source.file_name", source_file));
    }
    config
}
