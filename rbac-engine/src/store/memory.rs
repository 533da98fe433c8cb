use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Store, StoreTransaction};
use crate::error::{EngineError, Result};
use crate::models::{ContentTypeId, EvaluationTuple, ObjectId, ObjectRole, PermissionAtom, RoleDefinition, TeamAssignment, UserAssignment};

/// In-memory [`Store`] used by the engine's own test suite.
///
/// This is a real, correctness-preserving implementation of every operation
/// [`PgStore`](super::PgStore) provides, not a hardcoded stub: the
/// materializer, trigger layer, and evaluator exercise the exact same logic
/// against it as they would against Postgres. Also exposes a handful of
/// fixture-building methods (`register_team`, `team_parent`) a test harness
/// uses to stand in for the host's own team/organization tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default, Clone)]
struct MemoryState {
    role_definitions: HashMap<Uuid, RoleDefinition>,
    object_roles: HashMap<Uuid, ObjectRole>,
    user_assignments: HashMap<Uuid, UserAssignment>,
    team_assignments: HashMap<Uuid, TeamAssignment>,
    evaluation_tuples: HashSet<EvaluationTuple>,
    team_parents: HashMap<Uuid, ObjectId>,
    known_teams: HashSet<Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-fixture helper: registers a team id and its organization parent
    /// (if any) so `teams_with_parent`/`all_team_ids` have something to
    /// return. Real deployments get this from the host's own tables.
    pub fn register_team(&self, team_id: Uuid, parent: Option<ObjectId>) {
        let mut state = self.state.lock().unwrap();
        state.known_teams.insert(team_id);
        if let Some(parent) = parent {
            state.team_parents.insert(team_id, parent);
        }
    }
}

pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    snapshot: MemoryState,
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let snapshot = self.state.lock().unwrap().clone();
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            snapshot,
        }))
    }
}

impl MemoryTransaction {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        *self.state.lock().unwrap() = self.snapshot;
        Ok(())
    }

    async fn find_role_definition_by_permissions(
        &mut self,
        content_type: Option<ContentTypeId>,
        permissions: &BTreeSet<PermissionAtom>,
    ) -> Result<Option<RoleDefinition>> {
        let state = self.lock();
        Ok(state
            .role_definitions
            .values()
            .find(|rd| rd.content_type == content_type && &rd.permissions == permissions)
            .cloned())
    }

    async fn find_role_definition_by_name(&mut self, name: &str) -> Result<Option<RoleDefinition>> {
        let state = self.lock();
        Ok(state.role_definitions.values().find(|rd| rd.name == name).cloned())
    }

    async fn get_role_definition(&mut self, id: Uuid) -> Result<RoleDefinition> {
        self.lock()
            .role_definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("role definition {id}")))
    }

    async fn insert_role_definition(&mut self, role_definition: RoleDefinition) -> Result<RoleDefinition> {
        let mut state = self.lock();
        state.role_definitions.insert(role_definition.id, role_definition.clone());
        Ok(role_definition)
    }

    async fn update_role_definition_permissions(&mut self, id: Uuid, permissions: BTreeSet<PermissionAtom>) -> Result<RoleDefinition> {
        let mut state = self.lock();
        let role_definition = state
            .role_definitions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("role definition {id}")))?;
        role_definition.permissions = permissions;
        Ok(role_definition.clone())
    }

    async fn delete_role_definition(&mut self, id: Uuid) -> Result<()> {
        self.lock().role_definitions.remove(&id);
        Ok(())
    }

    async fn assignment_count_for_role_definition(&mut self, id: Uuid) -> Result<i64> {
        let state = self.lock();
        let user_count = state.user_assignments.values().filter(|a| a.role_definition_id == id).count();
        let team_count = state.team_assignments.values().filter(|a| a.role_definition_id == id).count();
        Ok((user_count + team_count) as i64)
    }

    async fn find_or_create_object_role(
        &mut self,
        role_definition_id: Uuid,
        content_type: ContentTypeId,
        object_id: ObjectId,
    ) -> Result<(ObjectRole, bool)> {
        let mut state = self.lock();
        if let Some(existing) = state
            .object_roles
            .values()
            .find(|r| r.role_definition_id == role_definition_id && r.content_type == content_type && r.object_id == object_id)
            .cloned()
        {
            return Ok((existing, false));
        }
        let object_role = ObjectRole::new(Uuid::new_v4(), role_definition_id, content_type, object_id);
        state.object_roles.insert(object_role.id, object_role.clone());
        Ok((object_role, true))
    }

    async fn find_object_role(
        &mut self,
        role_definition_id: Uuid,
        content_type: ContentTypeId,
        object_id: ObjectId,
    ) -> Result<Option<ObjectRole>> {
        let state = self.lock();
        Ok(state
            .object_roles
            .values()
            .find(|r| r.role_definition_id == role_definition_id && r.content_type == content_type && r.object_id == object_id)
            .cloned())
    }

    async fn get_object_role(&mut self, id: Uuid) -> Result<ObjectRole> {
        self.lock()
            .object_roles
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("object role {id}")))
    }

    async fn delete_object_role(&mut self, id: Uuid) -> Result<()> {
        self.lock().object_roles.remove(&id);
        Ok(())
    }

    async fn object_roles_for_role_definition(&mut self, role_definition_id: Uuid) -> Result<Vec<Uuid>> {
        let state = self.lock();
        Ok(state
            .object_roles
            .values()
            .filter(|r| r.role_definition_id == role_definition_id)
            .map(|r| r.id)
            .collect())
    }

    async fn object_roles_with_codename(&mut self, codename: &str) -> Result<Vec<Uuid>> {
        let state = self.lock();
        Ok(state
            .object_roles
            .values()
            .filter(|r| {
                state
                    .role_definitions
                    .get(&r.role_definition_id)
                    .map(|rd| rd.contains_codename(codename))
                    .unwrap_or(false)
            })
            .map(|r| r.id)
            .collect())
    }

    async fn object_roles_held_by_team(&mut self, team_id: Uuid) -> Result<Vec<Uuid>> {
        let state = self.lock();
        Ok(state.object_roles.values().filter(|r| r.teams.contains(&team_id)).map(|r| r.id).collect())
    }

    async fn set_provides_teams(&mut self, object_role_id: Uuid, teams: HashSet<Uuid>) -> Result<()> {
        let mut state = self.lock();
        if let Some(role) = state.object_roles.get_mut(&object_role_id) {
            role.provides_teams = teams;
        }
        Ok(())
    }

    async fn all_object_role_ids(&mut self) -> Result<Vec<Uuid>> {
        Ok(self.lock().object_roles.keys().copied().collect())
    }

    async fn add_user_assignment(
        &mut self,
        object_role_id: Uuid,
        user_id: Uuid,
        role_definition_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(UserAssignment, bool)> {
        let mut state = self.lock();
        if let Some(existing) = state
            .user_assignments
            .values()
            .find(|a| a.object_role_id == Some(object_role_id) && a.user_id == user_id)
            .cloned()
        {
            return Ok((existing, false));
        }
        let (content_type, object_id) = {
            let role = state
                .object_roles
                .get_mut(&object_role_id)
                .ok_or_else(|| EngineError::NotFound(format!("object role {object_role_id}")))?;
            role.users.insert(user_id);
            (role.content_type, role.object_id)
        };
        let assignment = UserAssignment {
            id: Uuid::new_v4(),
            role_definition_id,
            user_id,
            object_role_id: Some(object_role_id),
            content_type: Some(content_type),
            object_id: Some(object_id),
            created_by,
            created_at: Utc::now(),
        };
        state.user_assignments.insert(assignment.id, assignment.clone());
        Ok((assignment, true))
    }

    async fn remove_user_assignment(&mut self, object_role_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        state
            .user_assignments
            .retain(|_, a| !(a.object_role_id == Some(object_role_id) && a.user_id == user_id));
        if let Some(role) = state.object_roles.get_mut(&object_role_id) {
            role.users.remove(&user_id);
        }
        Ok(())
    }

    async fn add_team_assignment(
        &mut self,
        object_role_id: Uuid,
        team_id: Uuid,
        role_definition_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(TeamAssignment, bool)> {
        let mut state = self.lock();
        if let Some(existing) = state
            .team_assignments
            .values()
            .find(|a| a.object_role_id == Some(object_role_id) && a.team_id == team_id)
            .cloned()
        {
            return Ok((existing, false));
        }
        let (content_type, object_id) = {
            let role = state
                .object_roles
                .get_mut(&object_role_id)
                .ok_or_else(|| EngineError::NotFound(format!("object role {object_role_id}")))?;
            role.teams.insert(team_id);
            (role.content_type, role.object_id)
        };
        let assignment = TeamAssignment {
            id: Uuid::new_v4(),
            role_definition_id,
            team_id,
            object_role_id: Some(object_role_id),
            content_type: Some(content_type),
            object_id: Some(object_id),
            created_by,
            created_at: Utc::now(),
        };
        state.team_assignments.insert(assignment.id, assignment.clone());
        Ok((assignment, true))
    }

    async fn remove_team_assignment(&mut self, object_role_id: Uuid, team_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        state
            .team_assignments
            .retain(|_, a| !(a.object_role_id == Some(object_role_id) && a.team_id == team_id));
        if let Some(role) = state.object_roles.get_mut(&object_role_id) {
            role.teams.remove(&team_id);
        }
        Ok(())
    }

    async fn add_global_user_assignment(
        &mut self,
        role_definition_id: Uuid,
        user_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(UserAssignment, bool)> {
        let mut state = self.lock();
        if let Some(existing) = state
            .user_assignments
            .values()
            .find(|a| a.object_role_id.is_none() && a.role_definition_id == role_definition_id && a.user_id == user_id)
            .cloned()
        {
            return Ok((existing, false));
        }
        let assignment = UserAssignment {
            id: Uuid::new_v4(),
            role_definition_id,
            user_id,
            object_role_id: None,
            content_type: None,
            object_id: None,
            created_by,
            created_at: Utc::now(),
        };
        state.user_assignments.insert(assignment.id, assignment.clone());
        Ok((assignment, true))
    }

    async fn remove_global_user_assignment(&mut self, role_definition_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        state
            .user_assignments
            .retain(|_, a| !(a.object_role_id.is_none() && a.role_definition_id == role_definition_id && a.user_id == user_id));
        Ok(())
    }

    async fn add_global_team_assignment(
        &mut self,
        role_definition_id: Uuid,
        team_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(TeamAssignment, bool)> {
        let mut state = self.lock();
        if let Some(existing) = state
            .team_assignments
            .values()
            .find(|a| a.object_role_id.is_none() && a.role_definition_id == role_definition_id && a.team_id == team_id)
            .cloned()
        {
            return Ok((existing, false));
        }
        let assignment = TeamAssignment {
            id: Uuid::new_v4(),
            role_definition_id,
            team_id,
            object_role_id: None,
            content_type: None,
            object_id: None,
            created_by,
            created_at: Utc::now(),
        };
        state.team_assignments.insert(assignment.id, assignment.clone());
        Ok((assignment, true))
    }

    async fn remove_global_team_assignment(&mut self, role_definition_id: Uuid, team_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        state
            .team_assignments
            .retain(|_, a| !(a.object_role_id.is_none() && a.role_definition_id == role_definition_id && a.team_id == team_id));
        Ok(())
    }

    async fn global_role_definition_ids_for_user(&mut self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let state = self.lock();
        Ok(state
            .user_assignments
            .values()
            .filter(|a| a.object_role_id.is_none() && a.user_id == user_id)
            .map(|a| a.role_definition_id)
            .collect())
    }

    async fn global_role_definition_ids_for_teams(&mut self, team_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let state = self.lock();
        Ok(state
            .team_assignments
            .values()
            .filter(|a| a.object_role_id.is_none() && team_ids.contains(&a.team_id))
            .map(|a| a.role_definition_id)
            .collect())
    }

    async fn evaluation_tuples_for_object_role(&mut self, object_role_id: Uuid) -> Result<Vec<EvaluationTuple>> {
        let state = self.lock();
        Ok(state
            .evaluation_tuples
            .iter()
            .filter(|t| t.object_role_id == object_role_id)
            .cloned()
            .collect())
    }

    async fn apply_evaluation_diff(&mut self, to_add: Vec<EvaluationTuple>, to_delete: Vec<EvaluationTuple>) -> Result<()> {
        let mut state = self.lock();
        for tuple in to_delete {
            state.evaluation_tuples.remove(&tuple);
        }
        for tuple in to_add {
            state.evaluation_tuples.insert(tuple);
        }
        Ok(())
    }

    async fn accessible_ids(
        &mut self,
        content_type: ContentTypeId,
        object_role_ids: &[Uuid],
        codename: &str,
    ) -> Result<Vec<ObjectId>> {
        let state = self.lock();
        let ids: HashSet<ObjectId> = state
            .evaluation_tuples
            .iter()
            .filter(|t| t.content_type == content_type && t.codename == codename && object_role_ids.contains(&t.object_role_id))
            .map(|t| t.object_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn has_tuple(
        &mut self,
        object_role_ids: &[Uuid],
        content_type: ContentTypeId,
        object_id: ObjectId,
        codename: &str,
    ) -> Result<bool> {
        let state = self.lock();
        Ok(state.evaluation_tuples.iter().any(|t| {
            t.content_type == content_type
                && t.object_id == object_id
                && t.codename == codename
                && object_role_ids.contains(&t.object_role_id)
        }))
    }

    async fn all_team_ids(&mut self) -> Result<Vec<Uuid>> {
        Ok(self.lock().known_teams.iter().copied().collect())
    }

    async fn teams_with_parent(&mut self, parent_id: ObjectId) -> Result<Vec<Uuid>> {
        let state = self.lock();
        Ok(state
            .team_parents
            .iter()
            .filter(|(_, parent)| **parent == parent_id)
            .map(|(team_id, _)| *team_id)
            .collect())
    }

    async fn object_role_ids_for_user(&mut self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let state = self.lock();
        Ok(state.object_roles.values().filter(|r| r.users.contains(&user_id)).map(|r| r.id).collect())
    }

    async fn object_role_ids_for_teams(&mut self, team_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let state = self.lock();
        Ok(state
            .object_roles
            .values()
            .filter(|r| team_ids.iter().any(|t| r.teams.contains(t)))
            .map(|r| r.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PermissionAtom;

    #[tokio::test]
    async fn find_or_create_object_role_is_idempotent() {
        let store = MemoryStore::new();
        let role_definition_id = Uuid::new_v4();
        let ct = ContentTypeId(1);
        let object_id = ObjectId::Integer(7);

        let mut tx = store.begin().await.unwrap();
        let (first, created_first) = tx.find_or_create_object_role(role_definition_id, ct, object_id).await.unwrap();
        let (second, created_second) = tx.find_or_create_object_role(role_definition_id, ct, object_id).await.unwrap();
        tx.commit().await.unwrap();

        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn rollback_restores_pre_transaction_state() {
        let store = MemoryStore::new();
        let role_definition_id = Uuid::new_v4();
        let ct = ContentTypeId(1);

        let mut tx = store.begin().await.unwrap();
        tx.insert_role_definition(RoleDefinition {
            id: role_definition_id,
            name: "temp".to_string(),
            description: String::new(),
            managed: false,
            content_type: Some(ct),
            permissions: BTreeSet::from([PermissionAtom::new("view_x", ct)]),
        })
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        let mut tx2 = store.begin().await.unwrap();
        assert!(tx2.find_role_definition_by_name("temp").await.unwrap().is_none());
    }
}
