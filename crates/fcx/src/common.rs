//! 📦 Common data structures: the things that ride the pipeline.
//!
//! 🎬 A record leaves the metadata graph. It is wrapped in a [`WorkItem`], dropped into the
//! queue, scooped into somebody's [`RecordBatch`], run through a rule set and comes out the
//! other side as an [`IndexDocument`] with an `_id` it will carry for the rest of its
//! indexed life. Nobody asked the record. The record does not get a vote.
//!
//! 🦆

use serde_json::Value;

use crate::errors::{IndexerError, IndexerResult};

/// 🎯 One raw record as fetched from the metadata source, plus the id it was fetched under.
///
/// Created by a loader worker, consumed exactly once by exactly one index worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub record: Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, record: Value) -> Self {
        Self {
            id: id.into(),
            record,
        }
    }

    /// 🏷️ The path segment right before the id's last segment: `.../person/P1` → `person`.
    pub fn entity_segment(&self) -> Option<&str> {
        entity_segment(&self.id)
    }

    /// 📊 Stats key for this item. Falls back to `unknown` when the id has no type segment.
    pub fn entity_key(&self) -> String {
        entity_key(&self.id)
    }
}

/// 🔍 `https://graph/people/P1` → `Some("people")`, `P1` → `None`.
pub fn entity_segment(id: &str) -> Option<&str> {
    let mut segments = id.trim_end_matches('/').rsplit('/');
    // -- last segment is the id itself, we want its parent
    segments.next()?;
    segments.next().filter(|segment| !segment.is_empty())
}

pub fn entity_key(id: &str) -> String {
    entity_segment(id).unwrap_or("unknown").to_string()
}

/// 📦 An ordered, worker-local accumulation of [`WorkItem`]s.
///
/// Never shared. Grows by dequeues, gets flushed as a unit, then starts over from zero.
#[derive(Debug, Default)]
pub struct RecordBatch {
    items: Vec<WorkItem>,
}

impl RecordBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = WorkItem>) {
        self.items.extend(items);
    }

    /// 🗑️ Hand the items over and leave an empty batch behind. Clearing is not optional.
    pub fn take(&mut self) -> Vec<WorkItem> {
        std::mem::take(&mut self.items)
    }
}

/// 📄 A rule-set output plus the id read from the configured id field path.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    /// 🆔 `_id` in the bulk action line. Same id twice = overwrite, not duplicate.
    pub id: String,
    /// 🎯 The WorkItem id this document came from. Stats are keyed off this.
    pub source_id: String,
    pub body: Value,
}

impl IndexDocument {
    /// 🏗️ Wrap a transformed body, resolving its id at `id_field_path` (dot-separated).
    ///
    /// 💀 A document without an id cannot be verified after insert, so it is rejected here.
    pub fn new(
        body: Value,
        id_field_path: &str,
        source_id: &str,
        rule_set: &str,
    ) -> IndexerResult<Self> {
        let id = lookup_path(&body, id_field_path)
            .and_then(value_as_id)
            .ok_or_else(|| {
                IndexerError::transform(
                    rule_set,
                    format!("document for '{source_id}' has no id at '{id_field_path}'"),
                )
            })?;
        Ok(Self {
            id,
            source_id: source_id.to_string(),
            body,
        })
    }
}

/// 🔍 Walk a dot-separated path (`fiche.data._id`) through nested objects.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| current.get(segment))
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_the_segment_before_the_id_is_the_entity() {
        assert_eq!(entity_segment("https://graph.example/people/P1"), Some("people"));
        assert_eq!(entity_segment("person/P1"), Some("person"));
        assert_eq!(entity_segment("person/P1/"), Some("person"));
        assert_eq!(entity_segment("P1"), None);
        assert_eq!(entity_segment("/P1"), None);
        assert_eq!(entity_key("P1"), "unknown");
    }

    #[test]
    fn the_one_where_take_leaves_an_empty_batch_behind() {
        let mut batch = RecordBatch::new();
        batch.extend(vec![
            WorkItem::new("person/P1", json!({})),
            WorkItem::new("person/P2", json!({})),
        ]);
        assert_eq!(batch.len(), 2);

        let taken = batch.take();
        assert_eq!(taken.len(), 2);
        assert!(batch.is_empty(), "take() must clear the accumulator");
    }

    #[test]
    fn the_one_where_the_document_id_is_dug_out_of_the_envelope() -> IndexerResult<()> {
        let body = json!({"fiche": {"data": {"_id": "P1", "name": "Ada"}}});
        let doc = IndexDocument::new(body, "fiche.data._id", "person/P1", "person")?;
        assert_eq!(doc.id, "P1");
        assert_eq!(doc.source_id, "person/P1");

        let numeric = json!({"fiche": {"data": {"_id": 42}}});
        assert_eq!(
            IndexDocument::new(numeric, "fiche.data._id", "x/42", "generic")?.id,
            "42"
        );
        Ok(())
    }

    #[test]
    fn the_one_where_a_document_without_an_id_is_a_transform_error() {
        let body = json!({"fiche": {"data": {"name": "nobody"}}});
        let err = IndexDocument::new(body, "fiche.data._id", "person/P9", "person")
            .expect_err("an id-less document must be rejected");
        assert_eq!(err.kind(), "transform");
        assert!(err.to_string().contains("person/P9"));
    }
}
