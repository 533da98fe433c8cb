mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ContentTypeId, EvaluationTuple, ObjectId, ObjectRole, PermissionAtom, RoleDefinition, TeamAssignment, UserAssignment};

/// A relational store capable of producing a [`StoreTransaction`].
///
/// Every write operation the engine performs is expected to run inside one
/// transaction (§5): `give_or_remove_permission` begins one, does its work
/// through the returned handle, and commits (or rolls back on any error)
/// before returning to its caller.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// Unit-of-work handle over the engine's own tables (role definitions,
/// object roles, assignments, evaluation tuples). Resource tables belonging
/// to the host application are reached instead through
/// [`crate::host::ResourceAdapter`].
#[async_trait]
pub trait StoreTransaction: Send {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;

    // -- role definitions --------------------------------------------------
    async fn find_role_definition_by_permissions(
        &mut self,
        content_type: Option<ContentTypeId>,
        permissions: &BTreeSet<PermissionAtom>,
    ) -> Result<Option<RoleDefinition>>;
    async fn find_role_definition_by_name(&mut self, name: &str) -> Result<Option<RoleDefinition>>;
    async fn get_role_definition(&mut self, id: Uuid) -> Result<RoleDefinition>;
    async fn insert_role_definition(&mut self, role_definition: RoleDefinition) -> Result<RoleDefinition>;
    async fn update_role_definition_permissions(&mut self, id: Uuid, permissions: BTreeSet<PermissionAtom>) -> Result<RoleDefinition>;
    async fn delete_role_definition(&mut self, id: Uuid) -> Result<()>;
    async fn assignment_count_for_role_definition(&mut self, id: Uuid) -> Result<i64>;

    // -- object roles --------------------------------------------------------
    async fn find_or_create_object_role(
        &mut self,
        role_definition_id: Uuid,
        content_type: ContentTypeId,
        object_id: ObjectId,
    ) -> Result<(ObjectRole, bool)>;
    async fn find_object_role(
        &mut self,
        role_definition_id: Uuid,
        content_type: ContentTypeId,
        object_id: ObjectId,
    ) -> Result<Option<ObjectRole>>;
    async fn get_object_role(&mut self, id: Uuid) -> Result<ObjectRole>;
    async fn delete_object_role(&mut self, id: Uuid) -> Result<()>;
    async fn object_roles_for_role_definition(&mut self, role_definition_id: Uuid) -> Result<Vec<Uuid>>;
    async fn object_roles_with_codename(&mut self, codename: &str) -> Result<Vec<Uuid>>;
    async fn object_roles_held_by_team(&mut self, team_id: Uuid) -> Result<Vec<Uuid>>;
    async fn set_provides_teams(&mut self, object_role_id: Uuid, teams: HashSet<Uuid>) -> Result<()>;
    async fn all_object_role_ids(&mut self) -> Result<Vec<Uuid>>;

    // -- assignments -----------------------------------------------------
    async fn add_user_assignment(
        &mut self,
        object_role_id: Uuid,
        user_id: Uuid,
        role_definition_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(UserAssignment, bool)>;
    async fn remove_user_assignment(&mut self, object_role_id: Uuid, user_id: Uuid) -> Result<()>;
    async fn add_team_assignment(
        &mut self,
        object_role_id: Uuid,
        team_id: Uuid,
        role_definition_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(TeamAssignment, bool)>;
    async fn remove_team_assignment(&mut self, object_role_id: Uuid, team_id: Uuid) -> Result<()>;

    async fn add_global_user_assignment(
        &mut self,
        role_definition_id: Uuid,
        user_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(UserAssignment, bool)>;
    async fn remove_global_user_assignment(&mut self, role_definition_id: Uuid, user_id: Uuid) -> Result<()>;
    async fn add_global_team_assignment(
        &mut self,
        role_definition_id: Uuid,
        team_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(TeamAssignment, bool)>;
    async fn remove_global_team_assignment(&mut self, role_definition_id: Uuid, team_id: Uuid) -> Result<()>;
    async fn global_role_definition_ids_for_user(&mut self, user_id: Uuid) -> Result<Vec<Uuid>>;
    async fn global_role_definition_ids_for_teams(&mut self, team_ids: &[Uuid]) -> Result<Vec<Uuid>>;

    // -- evaluation cache --------------------------------------------------
    async fn evaluation_tuples_for_object_role(&mut self, object_role_id: Uuid) -> Result<Vec<EvaluationTuple>>;
    async fn apply_evaluation_diff(&mut self, to_add: Vec<EvaluationTuple>, to_delete: Vec<EvaluationTuple>) -> Result<()>;
    async fn accessible_ids(
        &mut self,
        content_type: ContentTypeId,
        object_role_ids: &[Uuid],
        codename: &str,
    ) -> Result<Vec<ObjectId>>;
    async fn has_tuple(
        &mut self,
        object_role_ids: &[Uuid],
        content_type: ContentTypeId,
        object_id: ObjectId,
        codename: &str,
    ) -> Result<bool>;

    // -- teams & actor role sets --------------------------------------------
    async fn all_team_ids(&mut self) -> Result<Vec<Uuid>>;
    async fn teams_with_parent(&mut self, parent_id: ObjectId) -> Result<Vec<Uuid>>;
    async fn object_role_ids_for_user(&mut self, user_id: Uuid) -> Result<Vec<Uuid>>;
    async fn object_role_ids_for_teams(&mut self, team_ids: &[Uuid]) -> Result<Vec<Uuid>>;
}
