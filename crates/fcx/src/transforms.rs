//! 🔄 Transforms: raw graph record in, indexable document out.
//!
//! 🎬 The field-mapping rules themselves live outside this crate. What lives here is the seam:
//! a [`RuleEngine`] is handed a [`RuleSet`] handle (already chosen by the registry) and a raw
//! record, and answers with a document, with nothing, or with a `Transform` error.
//!
//! 🧠 Knowledge graph:
//! - `RuleSet` comes from `registry::EntityRegistry::rule_set_for`, never from string guessing.
//! - `indexer::BatchIndexer` holds an `Arc<dyn RuleEngine>` and calls it once per item.
//! - [`EnvelopeRules`] is the built-in engine: wraps the record into the `fiche` envelope so the
//!   pipeline runs end to end without an external mapper bolted on.
//!
//! 🦆

use serde::Deserialize;
use serde_json::Value;

use crate::errors::IndexerResult;
use crate::registry::RuleSet;

pub mod envelope;

pub use envelope::EnvelopeRules;

/// 🔧 The `[rules]` config section.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RulesConfig {
    /// 🎯 Rule set for ids whose type segment is absent or unknown.
    #[serde(default = "default_generic_rule_set")]
    pub generic_rule_set: String,
    /// ✉️ Top-level key every document is wrapped in.
    #[serde(default = "default_envelope")]
    pub envelope: String,
    /// 🧵 Data fields that must always be indexed as strings, however the graph typed them.
    #[serde(default = "default_stringify_fields")]
    pub stringify_fields: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            generic_rule_set: default_generic_rule_set(),
            envelope: default_envelope(),
            stringify_fields: default_stringify_fields(),
        }
    }
}

fn default_generic_rule_set() -> String {
    "generic".to_string()
}

fn default_envelope() -> String {
    "fiche".to_string()
}

// -- 📅 dates come back as numbers, strings, or arrays of both. the mapping wants strings.
fn default_stringify_fields() -> Vec<String> {
    vec!["datering_systematisch".to_string()]
}

/// 🗺️ Turns one raw record into one indexable document under a named rule set.
///
/// # Contract 📜
/// - `Ok(Some(doc))`: index this.
/// - `Ok(None)`: the rule set produced nothing for this record. Not an error, nothing to insert.
/// - `Err(Transform)`: the rule set choked. The whole batch this record rode in with is dropped.
pub trait RuleEngine: std::fmt::Debug + Send + Sync {
    fn apply(&self, rule_set: &RuleSet, id: &str, record: &Value) -> IndexerResult<Option<Value>>;
}
