//! 🚰 The Pipeline Runner — read, reshape, buffer, flush, repeat, and keep score.
//!
//! 🎬 COLD OPEN — INT. CONTROL ROOM — 6:04 AM
//!
//! Somebody presses the button. The index gets checked (or built). The file gets read, line by
//! line, each line turned into a document, each document dropped into a batch, each batch merged
//! into the cluster. At the end, a table. Green numbers, hopefully.
//!
//! ## The state machine 🧠
//!
//! ```text
//!   Idle ──▶ Bootstrapping ──▶ Running{1} ──▶ Draining{1} ──▶ Running{2} ──▶ … ──▶ Done
//!     │            │               │               │
//!     └────────────┴───────────────┴───────────────┴──────────▶ Failed
//! ```
//!
//! - A malformed record, a transform error or a cancellation ends the run, but the batch that
//!   was already buffered gets drained first. Everything before the bad line lands.
//! - Per-item conflicts and failures never end the run. They end up in the [`RunSummary`].
//! - An unreachable store ends the run on the spot.
//!
//! 🦆 The duck rides along in the control room. It does not press buttons.

use std::fmt;

use tracing::{debug, error, info};

use crate::backends::{Source, SourceBackend, StoreBackend};
use crate::bootstrap::{BootstrapAction, Bootstrapper, IndexDescriptor};
use crate::convergence::{ConvergencePolicy, Shutdown};
use crate::errors::PipelineError;
use crate::transforms::Transform;
use crate::writer::{BulkMergeWriter, WriterConfig, WriterTotals};

/// 🚦 Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Bootstrapping,
    Running { pass: u32 },
    Draining { pass: u32 },
    Done,
    Failed,
}

impl RunState {
    /// 🏁 Done and Failed are where runs go to rest.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// 🔀 The edges of the state machine. Anything not listed here is a bug in the runner.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (*self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Bootstrapping) => true,
            (Bootstrapping, Running { pass }) => pass == 1,
            (Running { pass: from }, Draining { pass: to }) => from == to,
            (Draining { pass: from }, Running { pass: to }) => to == from + 1,
            (Draining { .. }, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Bootstrapping => write!(f, "Bootstrapping"),
            RunState::Running { pass } => write!(f, "Running(pass {pass})"),
            RunState::Draining { pass } => write!(f, "Draining(pass {pass})"),
            RunState::Done => write!(f, "Done"),
            RunState::Failed => write!(f, "Failed"),
        }
    }
}

/// 🔧 Everything the runner needs to know, already validated.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// 🔁 Full reads of the source. At least one.
    pub passes: u32,
    pub writer: WriterConfig,
    pub descriptor: IndexDescriptor,
    pub convergence: ConvergencePolicy,
}

/// 📊 The score at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub attempted: u64,
    pub inserted: u64,
    pub merged: u64,
    pub conflicted: u64,
    pub failed: u64,
    pub batches: u64,
    pub passes_completed: u32,
    pub records_read: u64,
    /// 🏗️ What bootstrapping did, if it got that far.
    pub bootstrap: Option<BootstrapAction>,
    /// 💀 The error that ended the run early, if any.
    pub fatal: Option<PipelineError>,
}

impl RunSummary {
    pub fn applied(&self) -> u64 {
        self.inserted + self.merged
    }

    /// ✅ No fatal error and every item landed.
    pub fn is_clean(&self) -> bool {
        self.fatal.is_none() && self.conflicted == 0 && self.failed == 0
    }

    /// 🚪 0 clean, 1 fatal, 2 finished with item-level trouble.
    pub fn exit_code(&self) -> i32 {
        if self.fatal.is_some() {
            1
        } else if self.conflicted > 0 || self.failed > 0 {
            2
        } else {
            0
        }
    }

    fn absorb(&mut self, totals: WriterTotals) {
        self.attempted = totals.attempted;
        self.inserted = totals.inserted;
        self.merged = totals.merged;
        self.conflicted = totals.conflicted;
        self.failed = totals.failed;
        self.batches = totals.batches;
    }
}

/// 🚰 One run: a store, a source, a transform, and a state machine to keep them honest.
#[derive(Debug)]
pub struct Pipeline<T: Transform> {
    store: StoreBackend,
    source: SourceBackend,
    transform: T,
    settings: PipelineSettings,
    shutdown: Shutdown,
    state: RunState,
}

impl<T: Transform> Pipeline<T> {
    pub fn new(
        store: StoreBackend,
        source: SourceBackend,
        transform: T,
        settings: PipelineSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            source,
            transform,
            settings,
            shutdown,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// 🚀 Run every pass and report. Never panics, never returns early without a summary:
    /// a fatal error is recorded in `RunSummary::fatal` and the state ends as `Failed`.
    pub async fn run(&mut self) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut writer =
            BulkMergeWriter::new(self.store.clone(), self.settings.writer.clone());

        let outcome = self.drive(&mut writer, &mut summary).await;
        summary.absorb(writer.totals());

        match outcome {
            Ok(()) => info!(
                "🏁 run complete: {} pass(es), {} record(s), {} applied, {} conflicted, {} failed",
                summary.passes_completed,
                summary.records_read,
                summary.applied(),
                summary.conflicted,
                summary.failed
            ),
            Err(err) => {
                error!("💀 run failed in state {}: {err}", self.state);
                self.state = RunState::Failed;
                summary.fatal = Some(err);
            }
        }
        summary
    }

    async fn drive(
        &mut self,
        writer: &mut BulkMergeWriter<StoreBackend>,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        self.transition(RunState::Bootstrapping)?;
        let bootstrapper = Bootstrapper::new(
            self.store.clone(),
            self.settings.convergence.clone(),
            self.shutdown.clone(),
        );
        summary.bootstrap = Some(bootstrapper.ensure_index(&self.settings.descriptor).await?);

        let passes = self.settings.passes.max(1);
        for pass in 1..=passes {
            self.transition(RunState::Running { pass })?;
            info!("🚰 pass {pass}/{passes} reading from '{}'", self.source.location());
            let read = self.run_pass(writer, summary).await;

            self.transition(RunState::Draining { pass })?;
            let drained = writer.flush().await;
            // -- the reading error wins: it is the reason we stopped
            read?;
            drained?;
            summary.passes_completed += 1;
            debug!("✅ pass {pass}/{passes} drained");

            if pass < passes {
                self.source.restart().await?;
            }
        }
        self.transition(RunState::Done)
    }

    async fn run_pass(
        &mut self,
        writer: &mut BulkMergeWriter<StoreBackend>,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        loop {
            self.shutdown.check()?;
            let Some(record) = self.source.next_record().await? else {
                return Ok(());
            };
            summary.records_read += 1;
            for doc in self.transform.transform(&record)? {
                writer.push(doc.into()).await?;
            }
        }
    }

    fn transition(&mut self, next: RunState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("🚦 {} → {}", self.state, next);
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemorySource, InMemoryStore};
    use crate::transforms::DatedPairs;
    use std::time::Duration;

    fn settings(passes: u32, batch_size: usize) -> PipelineSettings {
        PipelineSettings {
            passes,
            writer: WriterConfig {
                index: "rates".into(),
                batch_size,
                timeout: Duration::from_secs(30),
                retry_on_conflict: 100,
            },
            descriptor: IndexDescriptor::new("rates", 1, 0),
            convergence: ConvergencePolicy::immediate(),
        }
    }

    fn pipeline(
        store: &InMemoryStore,
        lines: &[&str],
        passes: u32,
        batch_size: usize,
    ) -> Pipeline<DatedPairs> {
        Pipeline::new(
            StoreBackend::InMemory(store.clone()),
            SourceBackend::InMemory(InMemorySource::new(lines.iter().copied(), b'|')),
            DatedPairs::new("currency"),
            settings(passes, batch_size),
            Shutdown::new(),
        )
    }

    #[test]
    fn the_one_where_the_state_machine_only_goes_forward() {
        use RunState::*;
        assert!(Idle.can_transition_to(Bootstrapping));
        assert!(Bootstrapping.can_transition_to(Running { pass: 1 }));
        assert!(Running { pass: 1 }.can_transition_to(Draining { pass: 1 }));
        assert!(Draining { pass: 1 }.can_transition_to(Running { pass: 2 }));
        assert!(Draining { pass: 2 }.can_transition_to(Done));
        assert!(Running { pass: 3 }.can_transition_to(Failed));

        assert!(!Idle.can_transition_to(Running { pass: 1 }));
        assert!(!Running { pass: 1 }.can_transition_to(Done));
        assert!(!Draining { pass: 1 }.can_transition_to(Running { pass: 3 }));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Bootstrapping));
    }

    #[tokio::test]
    async fn the_one_where_a_clean_run_ends_done_with_exit_code_zero() {
        let store = InMemoryStore::new();
        let mut pipeline = pipeline(
            &store,
            &["2024-01-05|USD:1.08", "2024-01-06|USD:1.09", "2024-01-07|USD:1.10"],
            1,
            2,
        );
        let summary = pipeline.run().await;
        assert_eq!(pipeline.state(), RunState::Done);
        assert_eq!(summary.records_read, 3);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.bootstrap, Some(BootstrapAction::Created { mappings_applied: 0 }));
        assert_eq!(summary.exit_code(), 0);
        // -- one flush at the batch size, one at the end of the pass
        assert_eq!(store.calls().await.bulk_sizes, vec![2, 1]);
    }

    #[tokio::test]
    async fn the_one_where_the_second_pass_merges_what_the_first_inserted() {
        let store = InMemoryStore::new();
        let mut pipeline = pipeline(&store, &["2024-01-05|USD:1.08", "2024-01-06|USD:1.09"], 2, 10);
        let summary = pipeline.run().await;
        assert_eq!(summary.passes_completed, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.merged, 2);
        assert_eq!(store.document_count("rates").await, 2);
    }

    #[tokio::test]
    async fn the_one_where_item_failures_mean_exit_code_two() {
        let store = InMemoryStore::new();
        store.poison_key("2024-01-06", "mapper_parsing_exception").await;
        let mut pipeline = pipeline(&store, &["2024-01-05|USD:1.08", "2024-01-06|USD:1.09"], 1, 10);
        let summary = pipeline.run().await;
        assert_eq!(pipeline.state(), RunState::Done);
        assert!(summary.fatal.is_none());
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.exit_code(), 2);
    }

    #[tokio::test]
    async fn the_one_where_a_bootstrap_failure_writes_nothing() {
        let store = InMemoryStore::new();
        store.set_unreachable(true).await;
        let mut pipeline = pipeline(&store, &["2024-01-05|USD:1.08"], 1, 10);
        let summary = pipeline.run().await;
        assert_eq!(pipeline.state(), RunState::Failed);
        assert!(matches!(summary.fatal, Some(PipelineError::Connection(_))));
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.exit_code(), 1);
    }
}
