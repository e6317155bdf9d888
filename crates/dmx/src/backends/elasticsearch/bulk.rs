//! 📡 Bulk wire format — `update` actions with an upsert body and a shallow-merge script.
//!
//! Each operation is two NDJSON lines:
//!
//! ```text
//! {"update":{"_index":"rates","_id":"2024-01-05","retry_on_conflict":100}}
//! {"script":{"lang":"painless","source":"<merge>","params":{"doc":{...}}},"upsert":{...}}
//! ```
//!
//! Absent target: `upsert` becomes the stored document. Present target: the script copies
//! every top-level field of `params.doc` onto `ctx._source` and touches nothing else.
//! Trailing newline on the whole body: required. Three engineers lost weekends to this.

use serde_json::{Map, Value, json};

use crate::common::{BulkOperation, OpKind, WriteOutcome};
use crate::errors::StoreError;

/// 🔄 Top-level copy of `params.doc` onto the stored source. Fields not in the payload survive.
pub(crate) const SHALLOW_MERGE_SCRIPT: &str =
    "for (entry in params.doc.entrySet()) { ctx._source[entry.getKey()] = entry.getValue(); }";

/// 📋 The action line for one operation.
pub(crate) fn render_action(
    op: &BulkOperation,
    index: &str,
    retry_on_conflict: u32,
    legacy_types: bool,
) -> Value {
    let mut meta = Map::new();
    meta.insert("_index".to_string(), json!(index));
    meta.insert("_id".to_string(), json!(op.merge_key));
    if legacy_types {
        meta.insert("_type".to_string(), json!(op.doc_type));
    }
    meta.insert("retry_on_conflict".to_string(), json!(retry_on_conflict));

    let action = match op.kind {
        OpKind::MergeOrInsert => "update",
    };
    let mut envelope = Map::new();
    envelope.insert(action.to_string(), Value::Object(meta));
    Value::Object(envelope)
}

/// 📦 The payload line: merge instruction plus the full document as upsert.
pub(crate) fn render_payload(op: &BulkOperation) -> Value {
    let document = op.document.to_value();
    json!({
        "script": {
            "lang": "painless",
            "source": SHALLOW_MERGE_SCRIPT,
            "params": { "doc": document.clone() }
        },
        "upsert": document
    })
}

/// 🧵 The whole NDJSON body, trailing newline included.
pub(crate) fn render_bulk_body(
    operations: &[BulkOperation],
    index: &str,
    retry_on_conflict: u32,
    legacy_types: bool,
) -> String {
    // 🔧 vibes-based pre-allocation, the allocator has seen worse
    let mut body = String::with_capacity(operations.len() * 384);
    for op in operations {
        body.push_str(&render_action(op, index, retry_on_conflict, legacy_types).to_string());
        body.push('\n');
        body.push_str(&render_payload(op).to_string());
        body.push('\n');
    }
    body
}

/// 🔍 Turn a `_bulk` response body into one outcome per operation, in order.
///
/// Items missing from the response (it happens, usually right before an incident) are
/// reported as failed rather than silently dropped.
pub(crate) fn parse_bulk_response(
    body: &str,
    expected: usize,
) -> Result<Vec<WriteOutcome>, StoreError> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|err| StoreError::Decode(format!("bulk response is not JSON: {err}")))?;
    let items = parsed
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::Decode("bulk response has no 'items' array".to_string()))?;

    let mut outcomes: Vec<WriteOutcome> = items.iter().map(item_outcome).collect();
    if outcomes.len() < expected {
        let missing = expected - outcomes.len();
        outcomes.extend(
            std::iter::repeat_with(|| {
                WriteOutcome::failed("item missing from the bulk response")
            })
            .take(missing),
        );
    }
    outcomes.truncate(expected);
    Ok(outcomes)
}

fn item_outcome(item: &Value) -> WriteOutcome {
    // -- 🎭 {"update": {...}} — one key, whatever the action was
    let Some(result) = item.as_object().and_then(|obj| obj.values().next()) else {
        return WriteOutcome::failed(format!("unreadable bulk item: {item}"));
    };
    let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);

    if let Some(error) = result.get("error") {
        let (kind, reason) = match error {
            Value::Object(fields) => (
                fields.get("type").and_then(Value::as_str).unwrap_or("unknown"),
                fields
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("no reason given"),
            ),
            Value::String(reason) => ("unknown", reason.as_str()),
            _ => ("unknown", "no reason given"),
        };
        let reason = format!("{kind}: {reason}");
        return if status == 409 || kind == "version_conflict_engine_exception" {
            WriteOutcome::Conflicted { reason }
        } else {
            WriteOutcome::Failed { reason }
        };
    }

    match (status, result.get("result").and_then(Value::as_str)) {
        (201, _) | (_, Some("created")) => WriteOutcome::Inserted,
        (200, _) | (_, Some("updated" | "noop")) => WriteOutcome::Merged,
        (other, _) => WriteOutcome::failed(format!("unexpected item status {other}")),
    }
}
