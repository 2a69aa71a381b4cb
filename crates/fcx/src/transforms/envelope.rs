//! ✉️ EnvelopeRules: the built-in rule engine.
//!
//! ```text
//! record {name: "Ada", ...}  ──▶  {"fiche": {"type": "<rule set>", "data": {name: "Ada", ..., "_id": <id>}}}
//! ```
//!
//! `_id` is the record's own `_id` (or `id`) when it has one, otherwise the id it was fetched
//! under. Configured fields are coerced to strings on the way through, arrays element-wise.

use serde_json::{Map, Value};

use crate::errors::{IndexerError, IndexerResult};
use crate::registry::RuleSet;
use crate::transforms::{RuleEngine, RulesConfig};

#[derive(Debug, Clone)]
pub struct EnvelopeRules {
    envelope: String,
    stringify_fields: Vec<String>,
}

impl EnvelopeRules {
    pub fn new(config: &RulesConfig) -> Self {
        Self {
            envelope: config.envelope.clone(),
            stringify_fields: config.stringify_fields.clone(),
        }
    }
}

impl Default for EnvelopeRules {
    fn default() -> Self {
        Self::new(&RulesConfig::default())
    }
}

fn stringify(value: &mut Value) {
    match value {
        Value::Null | Value::String(_) => {}
        Value::Array(items) => items.iter_mut().for_each(stringify),
        other => *other = Value::String(other.to_string()),
    }
}

impl RuleEngine for EnvelopeRules {
    fn apply(&self, rule_set: &RuleSet, id: &str, record: &Value) -> IndexerResult<Option<Value>> {
        let mut data: Map<String, Value> = match record {
            Value::Object(fields) if fields.is_empty() => return Ok(None),
            Value::Object(fields) => fields.clone(),
            Value::Null => return Ok(None),
            other => {
                return Err(IndexerError::transform(
                    rule_set.name(),
                    format!("record for '{id}' is not an object: {other}"),
                ));
            }
        };

        let doc_id = ["_id", "id"]
            .iter()
            .find_map(|key| match data.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(Value::String(s.clone())),
                Some(n @ Value::Number(_)) => Some(n.clone()),
                _ => None,
            })
            .unwrap_or_else(|| Value::String(id.to_string()));
        data.insert("_id".to_string(), doc_id);

        for field in &self.stringify_fields {
            if let Some(value) = data.get_mut(field) {
                stringify(value);
            }
        }

        let mut fiche = Map::new();
        fiche.insert("type".to_string(), Value::String(rule_set.name().to_string()));
        fiche.insert("data".to_string(), Value::Object(data));
        let mut document = Map::new();
        document.insert(self.envelope.clone(), Value::Object(fiche));
        Ok(Some(Value::Object(document)))
    }
}
