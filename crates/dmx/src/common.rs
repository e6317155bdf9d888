//! 📦 Common data structures — the building blocks of dmx
//!
//! ---
//!
//! 🎬 COLD OPEN — INT. BACK OFFICE — 6:02 AM
//!
//! A flat file lands in the upload folder. Pipes everywhere. `2024-01-05|USD:1.08|JPY:160.2`.
//! Nobody remembers who exports it. Nobody dares to stop exporting it. Every morning it arrives,
//! and every morning someone expects it to be searchable by 6:05.
//!
//! This module defines the humble yet load-bearing structs that carry a line from the file to the
//! index: a [`RawRecord`] as read, an [`OutputDocument`] as reshaped, a [`BulkOperation`] as sent,
//! and a [`WriteOutcome`] as reported. They don't ask questions. They carry the data.
//!
//! 🦆

use memchr::memchr_iter;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::PipelineError;

/// 🗓️ The field every document carries, whatever else it has.
pub const DATE_FIELD: &str = "date_operation";

/// 🏷️ Label key inside each business entry.
pub const LABEL_FIELD: &str = "libelle";

/// 💰 Value key inside each business entry.
pub const VALUE_FIELD: &str = "value";

/// 🧾 One line of the source, split on the delimiter and validated.
///
/// The first field is the business date. The others are `key:value` pairs.
/// Immutable once read: the runner only ever borrows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 📍 1-based line number in the source. Shows up in every error about this record.
    pub offset: u64,
    /// 🧾 The line as read, minus its line ending. For error messages and manual resumes.
    pub raw: String,
    fields: Vec<String>,
}

impl RawRecord {
    /// 🔪 Split `line` on `delimiter` and check it is well-formed.
    ///
    /// Well-formed means: a non-empty date field, and every non-empty pair field has a `:` with
    /// something before it. Empty pair fields (hello, trailing delimiter) are dropped.
    /// Everything after the first `:` is the value, colons included.
    pub fn parse(offset: u64, line: &str, delimiter: u8) -> Result<Self, PipelineError> {
        // ⚠️ non-ASCII delimiters would cut UTF-8 sequences in half
        if !delimiter.is_ascii() {
            return Err(PipelineError::Config(format!(
                "delimiter byte {delimiter:#04x} is not ASCII"
            )));
        }
        let bytes = line.as_bytes();
        let mut fields = Vec::new();
        let mut start = 0usize;
        // -- 🔍 memchr finds the pipes, we just cut along the dotted lines
        for cut in memchr_iter(delimiter, bytes) {
            fields.push(line[start..cut].to_string());
            start = cut + 1;
        }
        fields.push(line[start..].to_string());

        let date = fields.first().map(String::as_str).unwrap_or_default();
        if date.trim().is_empty() {
            return Err(PipelineError::record_format(
                offset,
                line,
                "missing business date in the first field",
            ));
        }

        let mut kept = Vec::with_capacity(fields.len());
        let mut fields = fields.into_iter();
        if let Some(date) = fields.next() {
            kept.push(date);
        }
        for pair in fields {
            if pair.is_empty() {
                continue;
            }
            match pair.split_once(':') {
                Some((DATE_FIELD, _)) => {
                    return Err(PipelineError::record_format(
                        offset,
                        line,
                        format!("pair key '{DATE_FIELD}' would overwrite the business date"),
                    ));
                }
                Some((key, _)) if !key.is_empty() => kept.push(pair),
                Some(_) => {
                    return Err(PipelineError::record_format(
                        offset,
                        line,
                        format!("pair '{pair}' has an empty key"),
                    ));
                }
                None => {
                    return Err(PipelineError::record_format(
                        offset,
                        line,
                        format!("field '{pair}' is not a key:value pair"),
                    ));
                }
            }
        }

        Ok(Self {
            offset,
            raw: line.to_string(),
            fields: kept,
        })
    }

    /// 🗓️ The business date, exactly as it appeared in the file.
    pub fn date(&self) -> &str {
        &self.fields[0]
    }

    /// 🔑 The `key:value` pairs, in file order, already split.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields[1..]
            .iter()
            .filter_map(|pair| pair.split_once(':'))
    }

    /// 📏 Every field, date first.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// 📄 A document headed for the index: `date_operation` plus one `{libelle, value}` per key.
///
/// The merge key is NOT stored in here. It travels next to the document in a [`BulkOperation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OutputDocument(Map<String, Value>);

impl OutputDocument {
    /// 🏗️ A document that knows only its date. The minimum viable document.
    pub fn new(date: &str) -> Self {
        let mut fields = Map::new();
        fields.insert(DATE_FIELD.to_string(), Value::String(date.to_string()));
        Self(fields)
    }

    /// ➕ Add (or replace) one business entry.
    pub fn insert_entry(&mut self, key: &str, value: &str) {
        let mut entry = Map::new();
        entry.insert(LABEL_FIELD.to_string(), Value::String(key.to_string()));
        entry.insert(VALUE_FIELD.to_string(), Value::String(value.to_string()));
        self.0.insert(key.to_string(), Value::Object(entry));
    }

    /// 🗓️ The date this document is about.
    pub fn date(&self) -> Option<&str> {
        self.0.get(DATE_FIELD).and_then(Value::as_str)
    }

    /// 🔍 Borrow the raw JSON object.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// 📦 Give up the raw JSON object.
    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    /// 📦 As a `serde_json::Value`, for wire rendering.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// 🎭 What a bulk operation asks the store to do. Only one kind exists today; the enum is
/// what ends up on the wire, so it stays explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// 🔄 Insert the full document when absent, shallow-merge it when present.
    MergeOrInsert,
}

/// 🔄 One output of a transform: where it goes, what kind of write, and what to write.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedDoc {
    pub op: OpKind,
    pub doc_type: String,
    pub merge_key: String,
    pub document: OutputDocument,
}

/// 📡 One unit of work inside a bulk request.
///
/// The payload carries the document twice on the wire: once as the upsert body (target absent)
/// and once as the merge instruction (target present). Both are derived from `document`.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOperation {
    pub kind: OpKind,
    pub doc_type: String,
    pub merge_key: String,
    pub document: OutputDocument,
}

impl From<TransformedDoc> for BulkOperation {
    fn from(doc: TransformedDoc) -> Self {
        Self {
            kind: doc.op,
            doc_type: doc.doc_type,
            merge_key: doc.merge_key,
            document: doc.document,
        }
    }
}

/// 📊 How a single operation ended up, as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// ✅ The identity did not exist; the full document is now the stored value.
    Inserted,
    /// ✅ The identity existed; the payload fields were merged into it.
    Merged,
    /// ⚔️ Lost the race even after the store burned through its conflict-retry budget.
    Conflicted { reason: String },
    /// 💀 Anything else: malformed payload, rejected batch, timeout.
    Failed { reason: String },
}

impl WriteOutcome {
    /// ✅ Did the write land, one way or the other?
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Inserted | WriteOutcome::Merged)
    }

    /// 💀 Shorthand for a failed item.
    pub fn failed(reason: impl Into<String>) -> Self {
        WriteOutcome::Failed {
            reason: reason.into(),
        }
    }
}
