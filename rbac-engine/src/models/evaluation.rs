use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ContentTypeId, ObjectId, PkKind};

/// Materialized effective-permission record. Written only by the
/// materializer, never mutated, deleted when it becomes inconsistent with
/// the assignment/registry graph it was derived from.
///
/// Two physical partitions exist for integer vs UUID target resources
/// (`PkKind`); `partition()` picks the right one for a given tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvaluationTuple {
    pub object_role_id: Uuid,
    pub content_type: ContentTypeId,
    pub object_id: ObjectId,
    pub codename: String,
}

impl EvaluationTuple {
    pub fn partition(&self) -> PkKind {
        self.object_id.kind()
    }

    /// Key used for reconciliation diffs: `(object_role, content_type, object_id, codename)`.
    pub fn key(&self) -> (Uuid, ContentTypeId, ObjectId, &str) {
        (self.object_role_id, self.content_type, self.object_id, &self.codename)
    }
}
