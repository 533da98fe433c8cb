use std::collections::BTreeSet;
use std::sync::Arc;
use std::collections::HashMap;

use tracing::instrument;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::host::{AssignmentTracker, ResourceAdapter};
use crate::materializer::Materializer;
use crate::models::{ActorRef, ContentTypeId, ObjectId, PermissionAtom, RoleDefinition};
use crate::registry::Registry;
use crate::store::StoreTransaction;
use crate::team_membership::compute_team_member_roles;
use crate::triggers;
use crate::validators;

/// Write-side service: role-definition lifecycle, the assignment flow
/// (§4.3), and creator-permission seeding (§4.2). Ties together the
/// registry, validators, trigger layer, team-membership computation, and
/// materializer behind the operations the host actually calls.
pub struct RoleDefinitionService<'a> {
    registry: &'a Registry,
    config: &'a EngineConfig,
    adapters: &'a HashMap<String, Arc<dyn ResourceAdapter>>,
    tracker: Option<&'a dyn AssignmentTracker>,
}

impl<'a> RoleDefinitionService<'a> {
    pub fn new(
        registry: &'a Registry,
        config: &'a EngineConfig,
        adapters: &'a HashMap<String, Arc<dyn ResourceAdapter>>,
        tracker: Option<&'a dyn AssignmentTracker>,
    ) -> Self {
        Self { registry, config, adapters, tracker }
    }

    fn materializer(&self) -> Materializer<'a> {
        Materializer::new(self.registry, self.adapters, self.config)
    }

    /// `get_or_create(permissions, name, content_type)` (spec §4.2): finds
    /// an existing definition with an equal permission set (ignoring
    /// `name`), else validates and creates one.
    #[instrument(skip(self, tx, permissions))]
    pub async fn get_or_create(
        &self,
        tx: &mut dyn StoreTransaction,
        name: &str,
        content_type: Option<ContentTypeId>,
        permissions: BTreeSet<PermissionAtom>,
    ) -> Result<RoleDefinition> {
        if let Some(existing) = tx.find_role_definition_by_permissions(content_type, &permissions).await? {
            return Ok(existing);
        }

        validators::validate_permissions_for_model(self.registry, self.config, &permissions, content_type)?;

        if let Some(existing_by_name) = tx.find_role_definition_by_name(name).await? {
            return Err(EngineError::validation(format!(
                "a role definition named '{name}' already exists with a different permission set (id {})",
                existing_by_name.id
            )));
        }

        tx.insert_role_definition(RoleDefinition {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            managed: false,
            content_type,
            permissions,
        })
        .await
    }

    /// `give_permission`/`remove_permission` for an object-scoped role
    /// (spec §4.3). `giving = false` is idempotent: a no-op when the
    /// object role or the actor edge does not exist.
    #[instrument(skip(self, tx))]
    pub async fn give_or_remove_permission(
        &self,
        tx: &mut dyn StoreTransaction,
        role_definition_id: Uuid,
        actor: ActorRef,
        target_content_type: ContentTypeId,
        target_object_id: ObjectId,
        created_by: Option<Uuid>,
        giving: bool,
    ) -> Result<()> {
        let role_definition = tx.get_role_definition(role_definition_id).await?;
        let Some(role_content_type) = role_definition.content_type else {
            return Err(EngineError::validation("give_permission requires an object-scoped role definition; use give_global_permission for a global role"));
        };
        validators::validate_assignment(role_content_type, target_content_type)?;

        let target_model = self
            .registry
            .resource_by_content_type(target_content_type)
            .ok_or_else(|| EngineError::configuration(format!("unknown content type {target_content_type}")))?;
        let team_permission = self.registry.team_permission();
        let has_team_perm = team_permission.as_deref().map(|p| role_definition.contains_codename(p)).unwrap_or(false);

        if giving {
            validators::validate_assignment_enabled(self.registry, self.config, &actor, &target_model.model_name, has_team_perm)?;
        }

        let (object_role, created) = if giving {
            let (role, created) = tx.find_or_create_object_role(role_definition_id, target_content_type, target_object_id).await?;
            (Some(role), created)
        } else {
            (tx.find_object_role(role_definition_id, target_content_type, target_object_id).await?, false)
        };

        let Some(object_role) = object_role else {
            return Ok(());
        };

        let actor_team_id = match actor {
            ActorRef::Team(team_id) => Some(team_id),
            ActorRef::User(_) => None,
        };
        let mut dirty =
            triggers::on_assignment_changed(tx, self.registry, object_role.id, has_team_perm, created, giving, actor_team_id).await?;

        match (actor, giving) {
            (ActorRef::User(user_id), true) => {
                tx.add_user_assignment(object_role.id, user_id, role_definition_id, created_by).await?;
            }
            (ActorRef::User(user_id), false) => {
                tx.remove_user_assignment(object_role.id, user_id).await?;
            }
            (ActorRef::Team(team_id), true) => {
                tx.add_team_assignment(object_role.id, team_id, role_definition_id, created_by).await?;
            }
            (ActorRef::Team(team_id), false) => {
                tx.remove_team_assignment(object_role.id, team_id).await?;
            }
        }

        if !giving {
            let refreshed = tx.get_object_role(object_role.id).await?;
            if refreshed.is_empty() {
                tx.delete_object_role(object_role.id).await?;
                dirty.object_role_ids.remove(&object_role.id);
            }
        }

        if dirty.team_recompute {
            compute_team_member_roles(tx, self.registry).await?;
        }
        self.materializer().compute_object_role_permissions(tx, &dirty.object_role_ids).await?;

        if let Some(tracker) = self.tracker {
            let content_type = Some(target_content_type);
            let object_id = Some(target_object_id);
            if giving {
                tracker.on_give(role_definition_id, actor, content_type, object_id).await?;
            } else {
                tracker.on_remove(role_definition_id, actor, content_type, object_id).await?;
            }
        }

        Ok(())
    }

    /// `give_global_permission(actor)` (spec §4.2): requires
    /// `content_type = null` and system-role enablement; idempotent.
    #[instrument(skip(self, tx))]
    pub async fn give_global_permission(&self, tx: &mut dyn StoreTransaction, role_definition_id: Uuid, actor: ActorRef, created_by: Option<Uuid>) -> Result<()> {
        let role_definition = tx.get_role_definition(role_definition_id).await?;
        if !role_definition.is_global() {
            return Err(EngineError::validation("give_global_permission requires a global (content_type = null) role definition"));
        }
        if !validators::system_roles_enabled(self.config) {
            return Err(EngineError::PermissionDenied("system-wide roles are not enabled".to_string()));
        }

        match actor {
            ActorRef::User(user_id) => {
                if !self.config.allow_singleton_user_roles {
                    return Err(EngineError::PermissionDenied("global user roles are not enabled".to_string()));
                }
                tx.add_global_user_assignment(role_definition_id, user_id, created_by).await?;
            }
            ActorRef::Team(team_id) => {
                if !self.config.allow_singleton_team_roles {
                    return Err(EngineError::PermissionDenied("global team roles are not enabled".to_string()));
                }
                tx.add_global_team_assignment(role_definition_id, team_id, created_by).await?;
            }
        }

        if let Some(tracker) = self.tracker {
            tracker.on_give(role_definition_id, actor, None, None).await?;
        }
        Ok(())
    }

    /// `remove_global_permission`: inverse of the above; idempotent.
    #[instrument(skip(self, tx))]
    pub async fn remove_global_permission(&self, tx: &mut dyn StoreTransaction, role_definition_id: Uuid, actor: ActorRef) -> Result<()> {
        match actor {
            ActorRef::User(user_id) => tx.remove_global_user_assignment(role_definition_id, user_id).await?,
            ActorRef::Team(team_id) => tx.remove_global_team_assignment(role_definition_id, team_id).await?,
        }
        if let Some(tracker) = self.tracker {
            tracker.on_remove(role_definition_id, actor, None, None).await?;
        }
        Ok(())
    }

    /// `give_creator_permissions(actor, object)` (spec §4.2). A no-op
    /// success for superusers (no role created). Finds or creates a role
    /// definition named `<model>-creator-permission` holding
    /// `creator_defaults` actions on `object`'s own type plus `add_*` for
    /// every registered child model of that type; if an unmanaged role
    /// already owns that name with a different permission set, the
    /// seeded role is created `managed = true` instead so the name
    /// collision never blocks seeding.
    #[instrument(skip(self, tx))]
    pub async fn give_creator_permissions(
        &self,
        tx: &mut dyn StoreTransaction,
        user_id: Uuid,
        content_type: ContentTypeId,
        object_id: ObjectId,
        created_by: Option<Uuid>,
        is_superuser: bool,
    ) -> Result<()> {
        if is_superuser {
            return Ok(());
        }

        let model = self
            .registry
            .resource_by_content_type(content_type)
            .ok_or_else(|| EngineError::configuration(format!("unknown content type {content_type}")))?
            .clone();

        let mut permissions = BTreeSet::new();
        for action in &self.config.creator_defaults {
            let codename = format!("{action}_{}", model.model_name);
            if self.registry.catalog().is_known_codename(&model.model_name, &codename) {
                permissions.insert(PermissionAtom::new(codename, content_type));
            }
        }
        permissions.insert(PermissionAtom::new(format!("view_{}", model.model_name), content_type));
        for (_, child) in self.registry.children_of(&model.model_name) {
            permissions.insert(PermissionAtom::new(format!("add_{}", child.model_name), child.content_type_id));
        }

        let role_name = format!("{}-creator-permission", model.model_name);
        let role_definition = match tx.find_role_definition_by_name(&role_name).await? {
            Some(existing) if existing.permissions == permissions => existing,
            Some(_conflicting) => {
                tx.insert_role_definition(RoleDefinition {
                    id: Uuid::new_v4(),
                    name: role_name,
                    description: "seeded creator-permission role".to_string(),
                    managed: true,
                    content_type: Some(content_type),
                    permissions: permissions.clone(),
                })
                .await?
            }
            None => match tx.find_role_definition_by_permissions(Some(content_type), &permissions).await? {
                Some(existing) => existing,
                None => {
                    tx.insert_role_definition(RoleDefinition {
                        id: Uuid::new_v4(),
                        name: role_name,
                        description: "seeded creator-permission role".to_string(),
                        managed: true,
                        content_type: Some(content_type),
                        permissions: permissions.clone(),
                    })
                    .await?
                }
            },
        };

        self.give_or_remove_permission(tx, role_definition.id, ActorRef::User(user_id), content_type, object_id, created_by, true)
            .await
    }

    /// Adds `atom` to an existing role definition's permission set,
    /// re-validates the result, and rematerializes every object role bound
    /// to it (spec §4.2 rule set is enforced "on create, on permission-set
    /// mutation, and on each assignment"; trigger event 2 in §4.6).
    #[instrument(skip(self, tx))]
    pub async fn add_permission(&self, tx: &mut dyn StoreTransaction, role_definition_id: Uuid, atom: PermissionAtom) -> Result<RoleDefinition> {
        let role_definition = self.require_unmanaged(tx, role_definition_id).await?;
        let mut permissions = role_definition.permissions.clone();
        permissions.insert(atom.clone());
        self.mutate_permissions(tx, role_definition_id, role_definition.content_type, permissions, &atom.codename, false).await
    }

    /// Removes `atom` from an existing role definition's permission set.
    /// A no-op if the atom was not present (spec §7 "remove operations...
    /// return silently").
    #[instrument(skip(self, tx))]
    pub async fn remove_permission(&self, tx: &mut dyn StoreTransaction, role_definition_id: Uuid, atom: PermissionAtom) -> Result<RoleDefinition> {
        let role_definition = self.require_unmanaged(tx, role_definition_id).await?;
        if !role_definition.permissions.contains(&atom) {
            return Ok(role_definition);
        }
        let mut permissions = role_definition.permissions.clone();
        permissions.remove(&atom);
        self.mutate_permissions(tx, role_definition_id, role_definition.content_type, permissions, &atom.codename, false).await
    }

    /// Empties a role definition's permission set (`post_clear`): the
    /// removed set is unknown to the trigger layer, so this always forces a
    /// full recompute (spec §4.6 rule 2, DESIGN.md open-question (b)).
    #[instrument(skip(self, tx))]
    pub async fn clear_permissions(&self, tx: &mut dyn StoreTransaction, role_definition_id: Uuid) -> Result<RoleDefinition> {
        self.require_unmanaged(tx, role_definition_id).await?;
        let updated = tx.update_role_definition_permissions(role_definition_id, BTreeSet::new()).await?;
        let dirty = triggers::on_role_definition_permissions_changed(tx, role_definition_id, false, true).await?;
        if dirty.team_recompute {
            compute_team_member_roles(tx, self.registry).await?;
        }
        self.materializer().compute_object_role_permissions(tx, &dirty.object_role_ids).await?;
        Ok(updated)
    }

    async fn require_unmanaged(&self, tx: &mut dyn StoreTransaction, role_definition_id: Uuid) -> Result<RoleDefinition> {
        let role_definition = tx.get_role_definition(role_definition_id).await?;
        if role_definition.managed {
            return Err(EngineError::validation("managed role definitions are immutable from the API"));
        }
        Ok(role_definition)
    }

    async fn mutate_permissions(
        &self,
        tx: &mut dyn StoreTransaction,
        role_definition_id: Uuid,
        content_type: Option<ContentTypeId>,
        permissions: BTreeSet<PermissionAtom>,
        changed_codename: &str,
        cleared: bool,
    ) -> Result<RoleDefinition> {
        validators::validate_permissions_for_model(self.registry, self.config, &permissions, content_type)?;
        let updated = tx.update_role_definition_permissions(role_definition_id, permissions).await?;

        let touches_team_permission = self.registry.team_permission().as_deref() == Some(changed_codename);
        let dirty = triggers::on_role_definition_permissions_changed(tx, role_definition_id, touches_team_permission, cleared).await?;
        if dirty.team_recompute {
            compute_team_member_roles(tx, self.registry).await?;
        }
        self.materializer().compute_object_role_permissions(tx, &dirty.object_role_ids).await?;
        Ok(updated)
    }

    /// Deletes a role definition. Refused for `managed` definitions and for
    /// any definition still referenced by an assignment (spec §3
    /// "Lifecycle").
    #[instrument(skip(self, tx))]
    pub async fn delete_role_definition(&self, tx: &mut dyn StoreTransaction, role_definition_id: Uuid) -> Result<()> {
        let role_definition = tx.get_role_definition(role_definition_id).await?;
        if role_definition.managed {
            return Err(EngineError::validation("managed role definitions can not be deleted"));
        }
        if tx.assignment_count_for_role_definition(role_definition_id).await? > 0 {
            return Err(EngineError::validation("role definition is still referenced by an assignment"));
        }
        tx.delete_role_definition(role_definition_id).await
    }

    /// Trigger event 3 (spec §4.6): a registered resource was reparented.
    #[instrument(skip(self, tx))]
    pub async fn resource_reparented(
        &self,
        tx: &mut dyn StoreTransaction,
        parent_content_type: ContentTypeId,
        old_parent_id: ObjectId,
        new_parent_id: ObjectId,
    ) -> Result<()> {
        let dirty = triggers::on_resource_reparented(tx, self.registry, parent_content_type, old_parent_id, new_parent_id).await?;
        self.materializer().compute_object_role_permissions(tx, &dirty.object_role_ids).await
    }

    /// Trigger event 4 (spec §4.6): a registered resource was created under
    /// an existing parent.
    #[instrument(skip(self, tx))]
    pub async fn resource_created(&self, tx: &mut dyn StoreTransaction, parent_content_type: ContentTypeId, parent_id: ObjectId) -> Result<()> {
        let dirty = triggers::on_resource_created(tx, parent_content_type, parent_id).await?;
        self.materializer().compute_object_role_permissions(tx, &dirty.object_role_ids).await
    }

    /// Trigger event 5 (spec §4.6): `team_id` is about to be deleted by the
    /// host. Must be called *before* the host's own delete so the team's
    /// `provides_teams` membership can be stashed; cascade-deletes the
    /// team's own object roles afterward.
    #[instrument(skip(self, tx))]
    pub async fn team_deleted(&self, tx: &mut dyn StoreTransaction, team_id: Uuid) -> Result<()> {
        let stashed_member_roles = triggers::object_roles_granting_membership_to(tx, team_id).await?;
        let mut dirty = triggers::on_team_deleted(tx, &stashed_member_roles).await?;

        if let Some(team_model_name) = self.registry.team_model_name() {
            if let Some(team_kind) = self.registry.resource(team_model_name) {
                let team_content_type = team_kind.content_type_id;
                for object_role_id in tx.all_object_role_ids().await? {
                    let role = tx.get_object_role(object_role_id).await?;
                    if role.content_type == team_content_type && role.object_id == ObjectId::Uuid(team_id) {
                        tx.delete_object_role(object_role_id).await?;
                        dirty.object_role_ids.remove(&object_role_id);
                    }
                }
            }
        }

        if dirty.team_recompute {
            compute_team_member_roles(tx, self.registry).await?;
        }
        self.materializer().compute_object_role_permissions(tx, &dirty.object_role_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ActorContext;
    use crate::models::PkKind;
    use crate::store::{MemoryStore, Store};
    use crate::evaluator::Evaluator;

    fn registry_with_org_inventory() -> (Registry, ContentTypeId, ContentTypeId) {
        let mut registry = Registry::new();
        let org_ct = registry.register("organization", None, PkKind::Integer, vec![]).unwrap();
        let inv_ct = registry.register("inventory", Some("organization"), PkKind::Integer, vec![]).unwrap();
        (registry, org_ct, inv_ct)
    }

    #[tokio::test]
    async fn creator_permissions_grant_change_view_delete_but_not_update() {
        let (registry, _org_ct, inv_ct) = registry_with_org_inventory();
        let mut config = EngineConfig::default();
        config.creator_defaults = vec!["change".to_string(), "delete".to_string(), "view".to_string()];
        let adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        let service = RoleDefinitionService::new(&registry, &config, &adapters, None);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let rando = Uuid::new_v4();

        service
            .give_creator_permissions(tx.as_mut(), rando, inv_ct, ObjectId::Integer(42), None, false)
            .await
            .unwrap();

        let evaluator = Evaluator::new(&registry, &config, &adapters);
        let actor = ActorContext::user(rando);
        assert!(evaluator.has_obj_perm(tx.as_mut(), &actor, inv_ct, ObjectId::Integer(42), "change").await.unwrap());
        assert!(evaluator.has_obj_perm(tx.as_mut(), &actor, inv_ct, ObjectId::Integer(42), "view").await.unwrap());
        assert!(evaluator.has_obj_perm(tx.as_mut(), &actor, inv_ct, ObjectId::Integer(42), "delete").await.unwrap());
        assert!(!evaluator.has_obj_perm(tx.as_mut(), &actor, inv_ct, ObjectId::Integer(42), "update_inventory").await.is_ok_and(|x| x));

        let rd = tx.find_role_definition_by_name("inventory-creator-permission").await.unwrap();
        assert!(rd.is_some());
    }

    #[tokio::test]
    async fn creator_permissions_is_a_noop_for_superusers() {
        let (registry, _org_ct, inv_ct) = registry_with_org_inventory();
        let config = EngineConfig::default();
        let adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        let service = RoleDefinitionService::new(&registry, &config, &adapters, None);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let admin = Uuid::new_v4();

        service
            .give_creator_permissions(tx.as_mut(), admin, inv_ct, ObjectId::Integer(1), None, true)
            .await
            .unwrap();

        assert!(tx.find_role_definition_by_name("inventory-creator-permission").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn give_then_remove_permission_restores_empty_cache() {
        let (registry, org_ct, _inv_ct) = registry_with_org_inventory();
        let config = EngineConfig::default();
        let adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        let service = RoleDefinitionService::new(&registry, &config, &adapters, None);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let rd = service
            .get_or_create(tx.as_mut(), "org-viewer", Some(org_ct), BTreeSet::from([PermissionAtom::new("view_organization", org_ct)]))
            .await
            .unwrap();

        let user_id = Uuid::new_v4();
        service
            .give_or_remove_permission(tx.as_mut(), rd.id, ActorRef::User(user_id), org_ct, ObjectId::Integer(1), None, true)
            .await
            .unwrap();
        assert!(tx.find_object_role(rd.id, org_ct, ObjectId::Integer(1)).await.unwrap().is_some());

        service
            .give_or_remove_permission(tx.as_mut(), rd.id, ActorRef::User(user_id), org_ct, ObjectId::Integer(1), None, false)
            .await
            .unwrap();
        assert!(tx.find_object_role(rd.id, org_ct, ObjectId::Integer(1)).await.unwrap().is_none());
    }
}
