//! Read-only projection of operations for observers

use crate::coordinator::document::{Progress, StateDocument, WorkloadPhase};
use crate::coordinator::workload::Workload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a current-op style listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub instance_id: String,
    pub kind: String,
    pub phase: String,
    pub generation: u64,
    pub garbage_collectable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
    /// Workload specific fields, gated on the phase reached
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl OperationReport {
    /// Project a committed document plus its live counters.
    pub fn from_document<W: Workload>(
        workload: &W,
        doc: &StateDocument<W::Phase, W::Request>,
        live: &Progress,
    ) -> Self {
        Self {
            instance_id: doc.instance_key.clone(),
            kind: W::KIND.to_string(),
            phase: doc.phase.name().to_string(),
            generation: doc.generation,
            garbage_collectable: doc.garbage_collectable,
            expire_at: doc.expire_at.filter(|_| doc.garbage_collectable),
            fields: workload.report(doc, live),
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}
