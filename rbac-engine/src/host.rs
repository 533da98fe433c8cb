use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::Result;
use crate::models::{ActorRef, ContentTypeId, ObjectId};

/// Narrow contract the host application's resource tables satisfy so the
/// materializer can walk the parent/child graph without the engine owning
/// those tables itself (§6 "Resource model interface").
///
/// One adapter is bound per registered model. The engine's own tables
/// (role definitions, object roles, assignments, evaluation tuples) are
/// reached through [`crate::store::Store`] instead.
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    /// Ids of this model's rows whose join path (as computed by
    /// [`crate::registry::Registry::children_of`]) resolves to `parent_id`.
    async fn ids_under_parent(&self, parent_id: ObjectId) -> Result<Vec<ObjectId>>;

    /// Id of the parent row reached from `child_id` via `parent_field_name`,
    /// if the model has a parent at all.
    async fn parent_id_of(&self, child_id: ObjectId) -> Result<Option<ObjectId>>;

    /// Every id of this model, used only for the evaluator's superuser
    /// short-circuit in `accessible_ids` (spec §4.7).
    async fn all_ids(&self) -> Result<Vec<ObjectId>>;

    /// Resolves ids to host-owned objects for `accessible_objects`. The
    /// engine never inspects the returned value; it only ever deals in ids
    /// itself (spec §4.7 `accessible_objects`).
    async fn resolve(&self, ids: &[ObjectId]) -> Result<Vec<serde_json::Value>>;
}

/// Precomputed actor attributes the evaluator needs but the engine does not
/// itself store: the superuser/bypass flags from the host's user model
/// (§6 "User model"). The host computes these once per request; the engine
/// never reaches back into the host model to recompute them.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub actor: ActorRef,
    pub is_superuser: bool,
    /// Bypass-action-flag names currently active for this actor, e.g.
    /// `{"is_system_auditor"}` mapped from `bypass_action_flags` config.
    pub active_bypass_flags: HashSet<String>,
}

impl ActorContext {
    pub fn user(user_id: uuid::Uuid) -> Self {
        Self {
            actor: ActorRef::User(user_id),
            is_superuser: false,
            active_bypass_flags: HashSet::new(),
        }
    }

    pub fn team(team_id: uuid::Uuid) -> Self {
        Self {
            actor: ActorRef::Team(team_id),
            is_superuser: false,
            active_bypass_flags: HashSet::new(),
        }
    }

    pub fn with_superuser(mut self, is_superuser: bool) -> Self {
        self.is_superuser = is_superuser;
        self
    }

    pub fn with_bypass_flags(mut self, flags: HashSet<String>) -> Self {
        self.active_bypass_flags = flags;
        self
    }
}

/// Optional hook (spec §4.3 step 7) that mirrors an assignment into an
/// application-owned relationship — e.g. a team-members back-reference —
/// without re-entering the assignment flow. A no-op host simply registers
/// none.
#[async_trait]
pub trait AssignmentTracker: Send + Sync {
    async fn on_give(
        &self,
        role_definition_id: uuid::Uuid,
        actor: ActorRef,
        content_type: Option<ContentTypeId>,
        object_id: Option<ObjectId>,
    ) -> Result<()>;

    async fn on_remove(
        &self,
        role_definition_id: uuid::Uuid,
        actor: ActorRef,
        content_type: Option<ContentTypeId>,
        object_id: Option<ObjectId>,
    ) -> Result<()>;
}
