use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::{ContentTypeId, ObjectId};

/// Deduplicated `(role_definition, content_type, object_id)` node.
///
/// Immutable except for its `users`/`teams`/`provides_teams` edge sets.
/// Created on the first assignment for its triple; deleted once both
/// `users` and `teams` are empty (§3 lifecycle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRole {
    pub id: Uuid,
    pub role_definition_id: Uuid,
    pub content_type: ContentTypeId,
    pub object_id: ObjectId,
    pub users: HashSet<Uuid>,
    pub teams: HashSet<Uuid>,
    /// Teams whose membership is granted by holding this object role.
    /// Written only by the materializer / team-membership computation.
    pub provides_teams: HashSet<Uuid>,
}

impl ObjectRole {
    pub fn new(id: Uuid, role_definition_id: Uuid, content_type: ContentTypeId, object_id: ObjectId) -> Self {
        Self {
            id,
            role_definition_id,
            content_type,
            object_id,
            users: HashSet::new(),
            teams: HashSet::new(),
            provides_teams: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.teams.is_empty()
    }
}
