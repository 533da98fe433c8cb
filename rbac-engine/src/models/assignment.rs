use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ContentTypeId, ObjectId};

/// Immutable record linking a user to an object role, or, for global roles,
/// directly to a role definition. Both assignment kinds are append-only: the
/// API never mutates one in place, only creates and deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAssignment {
    pub id: Uuid,
    pub role_definition_id: Uuid,
    pub user_id: Uuid,
    /// `None` for a global (singleton) assignment.
    pub object_role_id: Option<Uuid>,
    pub content_type: Option<ContentTypeId>,
    pub object_id: Option<ObjectId>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl UserAssignment {
    pub fn is_global(&self) -> bool {
        self.object_role_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamAssignment {
    pub id: Uuid,
    pub role_definition_id: Uuid,
    pub team_id: Uuid,
    pub object_role_id: Option<Uuid>,
    pub content_type: Option<ContentTypeId>,
    pub object_id: Option<ObjectId>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TeamAssignment {
    pub fn is_global(&self) -> bool {
        self.object_role_id.is_none()
    }
}
