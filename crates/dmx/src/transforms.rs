//! 🔄 Transforms — the part of the pipeline that is allowed to have opinions about shape 🎭
//!
//! 🎬 COLD OPEN — INT. BACK OFFICE — A WHITEBOARD — 6:03 AM
//!
//! On the left: `2024-01-05|USD:1.08|JPY:160.2`. On the right: a JSON document with a date and
//! one little `{libelle, value}` object per currency. In between, someone has drawn an arrow and
//! written "just reshape it" next to it. The arrow is this module.
//!
//! ## Knowledge Graph 🧠
//! - Input: a borrowed, already-validated [`RawRecord`] (the source did the splitting)
//! - Output: zero or more [`TransformedDoc`]s, each carrying its own merge key and doc type
//! - Pure: no I/O, no clock, no randomness. Same record in, same documents out.
//! - Static parameters (the doc type) are bound when the transform is built, not per call.
//!
//! The runner is generic over [`Transform`], monomorphized, no vtables. New file layout? New
//! transform. The writer, the bootstrapper and the store do not care. 🦆

use crate::common::{RawRecord, TransformedDoc};
use crate::errors::PipelineError;

pub mod dated_pairs;

pub use dated_pairs::DatedPairs;

/// 🔄 Turn one raw record into the documents it should produce.
///
/// # Contract 📜
/// - MUST be deterministic and side-effect free.
/// - MUST be total over well-formed records. An `Err` is reserved for records that are
///   well-formed on paper but cannot be mapped; it carries the record's offset and ends the pass.
/// - MAY return an empty `Vec` (nothing to write for this record).
pub trait Transform: Send + Sync {
    fn transform(&self, record: &RawRecord) -> Result<Vec<TransformedDoc>, PipelineError>;
}
