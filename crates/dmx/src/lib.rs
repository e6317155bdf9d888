//! 🚀 dmx — dated flat files in, merged search documents out.
//!
//! One line per business date, `date|KEY:value|KEY:value…`, becomes one document keyed by that
//! date and upserted into an Elasticsearch-compatible index. Existing documents are merged, not
//! replaced: loading the euro rates after the yen rates leaves both in place.
//!
//! 🧠 Knowledge graph:
//! - `backends`: `Source` (file, memory) and `Store` (Elasticsearch, memory), trait + enum each
//! - `transforms`: the pure record → document step (`DatedPairs`)
//! - `bootstrap`: idempotent index + mappings creation
//! - `writer`: batching and per-item outcomes
//! - `pipeline`: the state machine that ties them together, and the run summary
//! - `app_config` / `progress` / `convergence` / `errors`: the ambient bits
//!
//! 🦆 The duck is here because every file must have one. This is law.

pub mod app_config;
pub mod backends;
pub mod bootstrap;
pub mod common;
pub mod convergence;
pub mod errors;
pub mod pipeline;
pub mod progress;
pub mod transforms;
pub mod writer;

use tracing::{debug, info};

use crate::app_config::AppConfig;
use crate::backends::{ElasticsearchStore, FileSource, SourceBackend, StoreBackend};
use crate::convergence::Shutdown;
use crate::errors::PipelineError;
use crate::pipeline::{Pipeline, PipelineSettings, RunSummary};
use crate::transforms::DatedPairs;

/// 🚀 Validate, connect, open, and run. Always comes back with a summary; anything that went
/// fatally wrong, before or during the run, is in `RunSummary::fatal`.
pub async fn run(app_config: AppConfig, shutdown: Shutdown) -> RunSummary {
    match prepare(&app_config, shutdown).await {
        Ok(mut pipeline) => pipeline.run().await,
        Err(err) => RunSummary {
            fatal: Some(err),
            ..RunSummary::default()
        },
    }
}

async fn prepare(
    app_config: &AppConfig,
    shutdown: Shutdown,
) -> Result<Pipeline<DatedPairs>, PipelineError> {
    app_config.validate()?;

    let store = ElasticsearchStore::new(app_config.store.clone())?;
    store.ping().await.map_err(PipelineError::handshake)?;

    let source = FileSource::open(app_config.source.clone()).await?;
    let descriptor = app_config.index_descriptor().await?;
    debug!(
        "📐 index '{}' with {} mapping(s) declared",
        descriptor.name,
        descriptor.mappings.len()
    );
    info!(
        "📥 loading '{}' as doc type '{}' into '{}'",
        app_config.source.file_name, app_config.pipeline.doc_type, app_config.store.index
    );

    let settings = PipelineSettings {
        passes: app_config.pipeline.passes,
        writer: app_config.writer_config(),
        descriptor,
        convergence: app_config.convergence_policy(),
    };
    Ok(Pipeline::new(
        StoreBackend::Elasticsearch(store),
        SourceBackend::File(source),
        DatedPairs::new(app_config.pipeline.doc_type.clone()),
        settings,
        shutdown,
    ))
}
