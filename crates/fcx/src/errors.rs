//! 💀 Errors: a field guide to everything that can go wrong between the graph and the index.
//!
//! 🧠 Four families, four blast radii:
//! - `Fetch`: the metadata source ghosted us. Retried, then dropped. The pool shrugs and moves on.
//! - `Transform`: a rule set choked on a record. The batch is toast, the worker is not.
//! - `IndexWrite`: the bulk call failed, loudly or (worse) quietly. We name names.
//! - `IndexLifecycle`: create/delete/alias went sideways mid-reindex. Run over. Old index keeps serving.
//!
//! Everything else in the app layer rides on `anyhow`. These are the ones somebody has to
//! classify, count, and explain at 3am. 🦆

use thiserror::Error;

/// 🏷️ The taxonomy. Per-item and per-batch variants are absorbed by workers; lifecycle
/// variants stop a reindex run.
#[derive(Error, Debug)]
pub enum IndexerError {
    /// 📡 MetadataSource unreachable or answered with something that isn't a record.
    #[error("failed to fetch '{id}': {reason}")]
    Fetch { id: String, reason: String },

    /// 🔄 Rule engine failure, or a transformed document with no usable id.
    #[error("rule set '{rule_set}' failed: {reason}")]
    Transform { rule_set: String, reason: String },

    /// 🚰 Bulk insert failed outright or only partially landed. `failed_ids` is exact.
    #[error("bulk write into '{index}' lost {} document(s) [{}]: {reason}", failed_ids.len(), failed_ids.join(", "))]
    IndexWrite {
        index: String,
        failed_ids: Vec<String>,
        reason: String,
    },

    /// 🏗️ create / delete / alias / count went wrong on a physical index.
    #[error("index lifecycle '{operation}' on '{index}' failed: {reason}")]
    IndexLifecycle {
        operation: String,
        index: String,
        reason: String,
    },

    /// 🔧 The configuration is lying to us.
    #[error("configuration error: {0}")]
    Config(String),
}

impl IndexerError {
    pub fn fetch(id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Fetch {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transform(rule_set: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transform {
            rule_set: rule_set.into(),
            reason: reason.to_string(),
        }
    }

    pub fn index_write(
        index: impl Into<String>,
        failed_ids: Vec<String>,
        reason: impl ToString,
    ) -> Self {
        Self::IndexWrite {
            index: index.into(),
            failed_ids,
            reason: reason.to_string(),
        }
    }

    pub fn lifecycle(
        operation: impl Into<String>,
        index: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::IndexLifecycle {
            operation: operation.into(),
            index: index.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 🏷️ Short, stable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::Transform { .. } => "transform",
            Self::IndexWrite { .. } => "index_write",
            Self::IndexLifecycle { .. } => "index_lifecycle",
            Self::Config(_) => "config",
        }
    }

    /// 🎯 Ids named by an `IndexWrite`; empty for every other family.
    pub fn failed_ids(&self) -> &[String] {
        match self {
            Self::IndexWrite { failed_ids, .. } => failed_ids,
            _ => &[],
        }
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;
