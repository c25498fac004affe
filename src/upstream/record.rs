//! Typed accessors over untyped upstream rows.
//!
//! The upstream returns string-keyed JSON maps where absent values are
//! encoded as boolean `false` and relational references come as
//! `[id, label]` pairs. All of that is normalized here so the mapper and
//! worker never touch raw JSON shapes.

use serde_json::{Map, Number, Value};

/// Relational reference to another upstream record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRef {
    pub id: i64,
    pub label: String,
}

/// One upstream row.
#[derive(Debug, Clone)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Wraps a JSON object; anything else is not a row.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Record(map)),
            _ => None,
        }
    }

    /// The row's own id.
    pub fn id(&self) -> Option<i64> {
        self.0.get("id").and_then(Value::as_i64)
    }

    /// Raw field access with the upstream's `false`-as-null convention
    /// already applied.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.0.get(key) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => None,
            Some(value) => Some(value),
        }
    }

    /// String field; `None` when absent or null.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// String field with empty-string fallback.
    pub fn text_or_empty(&self, key: &str) -> String {
        self.text(key).unwrap_or_default().to_string()
    }

    /// Numeric field preserved verbatim.
    pub fn number(&self, key: &str) -> Option<Number> {
        match self.get(key) {
            Some(Value::Number(n)) => Some(n.clone()),
            _ => None,
        }
    }

    /// Relational reference: `[id, label]`, or a bare id.
    pub fn many2one(&self, key: &str) -> Option<RecordRef> {
        match self.get(key)? {
            Value::Array(parts) => {
                let id = parts.first().and_then(Value::as_i64)?;
                let label = parts
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Some(RecordRef { id, label })
            }
            Value::Number(n) => n.as_i64().map(|id| RecordRef {
                id,
                label: String::new(),
            }),
            _ => None,
        }
    }

    /// One-to-many / many-to-many id list, preserving upstream order.
    pub fn id_list(&self, key: &str) -> Vec<i64> {
        match self.get(key) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).expect("object")
    }

    #[test]
    fn false_reads_as_absent() {
        let r = record(json!({"id": 7, "note": false, "email": "a@b.c"}));
        assert_eq!(r.text("note"), None);
        assert_eq!(r.text("email"), Some("a@b.c"));
        assert_eq!(r.text_or_empty("note"), "");
    }

    #[test]
    fn many2one_accepts_pair_and_bare_id() {
        let r = record(json!({
            "partner_id": [5, "Acme Corp"],
            "state_id": 9,
            "country_id": false,
        }));

        let partner = r.many2one("partner_id").expect("pair");
        assert_eq!(partner.id, 5);
        assert_eq!(partner.label, "Acme Corp");

        let state = r.many2one("state_id").expect("bare id");
        assert_eq!(state.id, 9);
        assert_eq!(state.label, "");

        assert_eq!(r.many2one("country_id"), None);
    }

    #[test]
    fn id_list_preserves_order() {
        let r = record(json!({"value_ids": [3, 1, 2]}));
        assert_eq!(r.id_list("value_ids"), vec![3, 1, 2]);
        assert!(r.id_list("missing").is_empty());
    }

    #[test]
    fn numbers_pass_through_verbatim() {
        let r = record(json!({"qty": 2.5, "price": 1999}));
        assert_eq!(r.number("qty").expect("qty").as_f64(), Some(2.5));
        assert_eq!(r.number("price").expect("price").as_i64(), Some(1999));
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(Record::from_value(json!([1, 2])).is_none());
        assert!(Record::from_value(json!("row")).is_none());
    }
}
