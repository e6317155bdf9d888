//! 🗓️ DatedPairs — one line, one date, one document.
//!
//! `2024-01-05|USD:1.08|JPY:160.2` becomes, under merge key `2024-01-05`:
//!
//! ```json
//! {
//!   "date_operation": "2024-01-05",
//!   "USD": { "libelle": "USD", "value": "1.08" },
//!   "JPY": { "libelle": "JPY", "value": "160.2" }
//! }
//! ```
//!
//! Values stay strings, exactly as read. Nobody here is qualified to decide that "1.080" and
//! "1.08" are the same number. Certainly not at 6 AM.

use super::Transform;
use crate::common::{OpKind, OutputDocument, RawRecord, TransformedDoc};
use crate::errors::PipelineError;

/// 🗓️ Keys every document on the record's business date; one entry per `key:value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatedPairs {
    doc_type: String,
}

impl DatedPairs {
    pub fn new(doc_type: impl Into<String>) -> Self {
        Self {
            doc_type: doc_type.into(),
        }
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }
}

impl Transform for DatedPairs {
    fn transform(&self, record: &RawRecord) -> Result<Vec<TransformedDoc>, PipelineError> {
        let date = record.date();
        let mut document = OutputDocument::new(date);
        // -- later duplicates overwrite earlier ones, last word wins, like every family dinner
        for (key, value) in record.pairs() {
            document.insert_entry(key, value);
        }
        Ok(vec![TransformedDoc {
            op: OpKind::MergeOrInsert,
            doc_type: self.doc_type.clone(),
            merge_key: date.to_string(),
            document,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DATE_FIELD, LABEL_FIELD, VALUE_FIELD};
    use serde_json::json;

    fn record(line: &str) -> RawRecord {
        RawRecord::parse(1, line, b'|').expect("💀 test lines are supposed to be well-formed")
    }

    #[test]
    fn the_one_where_a_lonely_date_still_gets_a_document() {
        let docs = DatedPairs::new("currency")
            .transform(&record("2024-01-05"))
            .expect("💀 transform");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].merge_key, "2024-01-05");
        assert_eq!(
            docs[0].document.to_value(),
            json!({ "date_operation": "2024-01-05" })
        );
    }

    #[test]
    fn the_one_where_n_pairs_make_n_plus_one_keys() {
        let line = "2024-01-05|USD:1.08|JPY:160.2|GBP:0.86|CHF:0.93";
        let docs = DatedPairs::new("currency")
            .transform(&record(line))
            .expect("💀 transform");
        let fields = docs[0].document.fields();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[DATE_FIELD], "2024-01-05");
        for pair in line.split('|').skip(1) {
            let (key, value) = pair.split_once(':').expect("💀 pair");
            assert_eq!(fields[key][LABEL_FIELD], key);
            assert_eq!(fields[key][VALUE_FIELD], value);
        }
    }

    #[test]
    fn the_one_where_the_textbook_line_comes_out_exactly_right() {
        let docs = DatedPairs::new("currency")
            .transform(&record("2024-01-05|USD:1.08|JPY:160.2"))
            .expect("💀 transform");
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.op, OpKind::MergeOrInsert);
        assert_eq!(doc.doc_type, "currency");
        assert_eq!(doc.merge_key, "2024-01-05");
        assert_eq!(
            doc.document.to_value(),
            json!({
                "date_operation": "2024-01-05",
                "USD": { "libelle": "USD", "value": "1.08" },
                "JPY": { "libelle": "JPY", "value": "160.2" }
            })
        );
    }

    #[test]
    fn the_one_where_the_second_usd_wins() {
        let docs = DatedPairs::new("currency")
            .transform(&record("2024-01-05|USD:1.08|USD:1.09"))
            .expect("💀 transform");
        assert_eq!(docs[0].document.fields().len(), 2);
        assert_eq!(docs[0].document.fields()["USD"][VALUE_FIELD], "1.09");
    }

    #[test]
    fn the_one_where_the_same_record_always_gives_the_same_answer() {
        let transform = DatedPairs::new("currency");
        let rec = record("2024-01-05|USD:1.08");
        assert_eq!(
            transform.transform(&rec).expect("💀 first"),
            transform.transform(&rec).expect("💀 second")
        );
    }
}
