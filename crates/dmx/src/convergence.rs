//! ⏳ Convergence — waiting for somebody else's system to make up its mind.
//!
//! Index creation is eventually consistent. Mapping propagation is eventually consistent.
//! "Eventually" is not a number, so this module turns it into one: a bounded [`RetryPolicy`]
//! (count + `tokio-retry` exponential backoff), a settle delay, and a [`Shutdown`] token that can interrupt
//! any of them. All waits go through `tokio::time`, so tests run them on a paused clock.
//!
//! 🦆 The duck waited patiently for this module to be written. The duck is still waiting
//! for the cluster to go green.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, trace};

use crate::errors::PipelineError;

/// 🛑 A cancellation flag shared by everyone in a run.
///
/// Cheap to clone. `trigger()` flips it for every clone, `cancelled()` resolves once it's flipped.
/// The runner checks it between records, the bootstrapper races its sleeps against it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// 🔔 Ask everyone to stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// 👀 Has anyone asked us to stop?
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// ⏳ Resolves once `trigger()` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stop| *stop).await.is_err() {
            // -- the sender lives in our own Arc, so this only happens during teardown
            std::future::pending::<()>().await;
        }
    }

    /// 💤 Sleep for `duration`, unless shutdown wins the race.
    pub async fn sleep(&self, duration: Duration) -> Result<(), PipelineError> {
        if duration.is_zero() {
            return self.check();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(PipelineError::Cancelled),
        }
    }

    /// 🚦 `Err(Cancelled)` if shutdown was requested, `Ok(())` otherwise.
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_triggered() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// 🔄 How many times to ask, and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total probes, first one included. Zero means "don't even ask".
    pub attempts: u32,
    /// Wait after the first failed probe.
    pub initial_backoff: Duration,
    /// Each wait is the previous one times this.
    pub multiplier: u32,
    /// Ceiling on any single wait.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_backoff: Duration::from_millis(250),
            multiplier: 2,
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// 🚧 Why a readiness probe didn't converge on this attempt.
#[derive(Debug)]
enum Unsettled<E> {
    NotYet,
    Probe(E),
}

impl RetryPolicy {
    /// 📉 The waits between probes, as a `tokio-retry` strategy. `ExponentialBackoff` yields
    /// `factor * base^n` milliseconds, so the factor is picked to make the first wait
    /// `initial_backoff`.
    fn strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        let multiplier = u64::from(self.multiplier.max(1));
        let initial_ms = u64::try_from(self.initial_backoff.as_millis()).unwrap_or(u64::MAX);
        ExponentialBackoff::from_millis(multiplier)
            .factor(initial_ms / multiplier)
            .max_delay(self.max_backoff)
    }

    /// ⏱️ The wait after failed probe number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.strategy()
            .nth(attempt as usize)
            .unwrap_or(self.max_backoff)
    }

    /// 🔁 Probe until it says yes, the attempts run out, shutdown is requested, or the probe
    /// itself errors. `Ok(true)` = converged, `Ok(false)` = gave up politely.
    pub async fn wait_until<F, Fut, E>(
        &self,
        shutdown: &Shutdown,
        mut probe: F,
    ) -> Result<Result<bool, E>, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        if self.attempts == 0 {
            return Ok(Ok(false));
        }
        shutdown.check()?;

        // -- first probe is free, every retry after it costs one wait
        let waits = self.strategy().take(self.attempts as usize - 1);
        let action = || {
            let probed = probe();
            async move {
                match probed.await {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        debug!("⏳ not converged yet, backing off");
                        Err(Unsettled::NotYet)
                    }
                    Err(err) => Err(Unsettled::Probe(err)),
                }
            }
        };
        let retried = RetryIf::spawn(waits, action, |why: &Unsettled<E>| {
            matches!(why, Unsettled::NotYet)
        });

        tokio::select! {
            outcome = retried => match outcome {
                Ok(()) => {
                    trace!("✅ converged");
                    Ok(Ok(true))
                }
                Err(Unsettled::NotYet) => Ok(Ok(false)),
                Err(Unsettled::Probe(err)) => Ok(Err(err)),
            },
            _ = shutdown.cancelled() => Err(PipelineError::Cancelled),
        }
    }
}

/// 🧘 The full "let the cluster catch its breath" policy used by the bootstrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergencePolicy {
    /// 🔁 How hard to poll for readiness after creating the index.
    pub ready: RetryPolicy,
    /// 💤 Pause after readiness and again after the mappings go in.
    pub settle_delay: Duration,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            ready: RetryPolicy::default(),
            settle_delay: Duration::from_secs(2),
        }
    }
}

impl ConvergencePolicy {
    /// ⚡ No waiting at all. For tests, and for people who like to live fast.
    pub fn immediate() -> Self {
        Self {
            ready: RetryPolicy {
                attempts: 1,
                initial_backoff: Duration::ZERO,
                multiplier: 1,
                max_backoff: Duration::ZERO,
            },
            settle_delay: Duration::ZERO,
        }
    }
}
