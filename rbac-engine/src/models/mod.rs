pub mod assignment;
pub mod evaluation;
pub mod object_role;
pub mod role_definition;

pub use assignment::{TeamAssignment, UserAssignment};
pub use evaluation::EvaluationTuple;
pub use object_role::ObjectRole;
pub use role_definition::{PermissionAtom, RoleDefinition};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a registered resource kind, assigned by the
/// [`crate::registry::Registry`] at registration time. Equivalent to the
/// source project's `(app_label, model_name)` content type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentTypeId(pub i64);

impl fmt::Display for ContentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resource's primary key, tagged by type so the evaluation cache can be
/// routed to the correct physical partition (see `models::evaluation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectId {
    Integer(i64),
    Uuid(uuid::Uuid),
}

impl ObjectId {
    pub fn kind(&self) -> PkKind {
        match self {
            ObjectId::Integer(_) => PkKind::Integer,
            ObjectId::Uuid(_) => PkKind::Uuid,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Integer(id) => write!(f, "{}", id),
            ObjectId::Uuid(id) => write!(f, "{}", id),
        }
    }
}

/// Primary-key representation a registered model may use. Anything else is
/// rejected at registration time (spec: "a resource whose primary key is
/// neither is rejected at registration").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PkKind {
    Integer,
    Uuid,
}

/// A user or a team: the only two kinds of actor that can hold a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActorRef {
    User(uuid::Uuid),
    Team(uuid::Uuid),
}

impl ActorRef {
    pub fn is_team(&self) -> bool {
        matches!(self, ActorRef::Team(_))
    }
}
