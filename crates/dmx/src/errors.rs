//! 💀 Errors — the taxonomy of everything that can go sideways between a flat file and an index.
//!
//! 🧠 Knowledge graph:
//! - `StoreError`: what the store backends (Elasticsearch over HTTP, the in-memory twin) can say
//!   when a wire call goes wrong. Low level. Speaks in status codes.
//! - `PipelineError`: what the pipeline surfaces to whoever called `run`. Fatal by construction:
//!   per-item write trouble never lands here, it lands in `WriteOutcome` and the run summary.
//! - The CLI edge converts these into `anyhow` with `.context(...)`, same as before.
//!
//! 🦆 The duck has reviewed this enum and found it exhaustive. The duck is usually wrong.

use std::time::Duration;

use thiserror::Error;

/// 📡 Failures of a single wire call against the store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached at all. DNS, TCP, TLS, firewall, vibes.
    #[error("💀 store unreachable: {0}")]
    Connection(String),

    /// The request went out but the response never came back in time. Raised by the writer's
    /// own deadline; reqwest-level timeouts carry no duration and stay `Transport`.
    #[error("⏱️ store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered, and the answer was no.
    #[error("💀 store rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Anything else the HTTP layer threw at us mid-flight.
    #[error("💀 transport error: {0}")]
    Transport(String),

    /// The store answered with something we could not read.
    #[error("💀 could not decode store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// 🔌 True when the store itself is unreachable. These are fatal for the whole run.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }

    /// 🏠 True when a create was refused because the index is already there.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            StoreError::Rejected { status: 400, body } if body.contains("resource_already_exists_exception")
        )
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        // -- 🕵️ sniff the reqwest error like a truffle pig hunting for connection problems
        if err.is_connect() {
            StoreError::Connection(err.to_string())
        } else if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

/// 🚧 Fatal failures of a run. Anything in here ends the pass, and with it the run.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// 🔌 Cannot reach the store. Nothing sensible can happen after this.
    #[error("💀 connection error: {0}")]
    Connection(String),

    /// 🚪 The store answered, but not with a yes: bad credentials, a proxy error page, a 5xx.
    #[error("💀 the store is up but would not play along: {0}")]
    Store(String),

    /// 🏗️ Index or mapping creation failed. Aborts before any write.
    #[error("💀 could not bootstrap index '{index}': {reason}")]
    Bootstrap { index: String, reason: String },

    /// 📂 The source could not be opened (or reopened for the next pass).
    #[error("💀 source '{location}' is unavailable: {reason}")]
    SourceUnavailable { location: String, reason: String },

    /// 🧾 A line that does not look like `date|key:value|...`.
    #[error("💀 malformed record at line {offset}: {reason} (raw: {raw:?})")]
    RecordFormat {
        offset: u64,
        raw: String,
        reason: String,
    },

    /// 🔄 The transform refused a record.
    #[error("💀 transform failed at line {offset}: {reason}")]
    Transform { offset: u64, reason: String },

    /// 🔧 The configuration does not hold together.
    #[error("💀 invalid configuration: {0}")]
    Config(String),

    /// 🛑 Somebody pulled the plug. Politely.
    #[error("🛑 run cancelled")]
    Cancelled,

    /// 🐛 The runner tried to move between states that do not connect.
    #[error("🐛 invalid pipeline transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl PipelineError {
    /// 🔌 Wrap a failed handshake. Only an unreachable store is a connection problem; a store
    /// that answers "no" is a different conversation.
    pub fn handshake(err: StoreError) -> Self {
        if err.is_connection() {
            PipelineError::Connection(err.to_string())
        } else {
            PipelineError::Store(err.to_string())
        }
    }

    /// 🏗️ Wrap a store failure that happened while bootstrapping. Connection trouble stays
    /// connection trouble; everything else is a bootstrap failure for this index.
    pub fn bootstrap(index: &str, err: StoreError) -> Self {
        if err.is_connection() {
            PipelineError::Connection(err.to_string())
        } else {
            PipelineError::Bootstrap {
                index: index.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// 🧾 Shorthand for a malformed record.
    pub fn record_format(offset: u64, raw: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::RecordFormat {
            offset,
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    /// 📂 Shorthand for a source that refuses to open.
    pub fn source_unavailable(location: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::SourceUnavailable {
            location: location.into(),
            reason: reason.into(),
        }
    }
}
