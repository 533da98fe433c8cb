//! Role-based access control engine: materializes a sparse set of role
//! assignments over a typed, parent/child resource graph into a dense,
//! queryable evaluation cache, honoring permission inheritance, transitive
//! team membership, and incremental invalidation (see `SPEC_FULL.md`).
//!
//! The crate root wires the individual components — [`registry::Registry`],
//! [`materializer::Materializer`], [`team_membership`], [`triggers`],
//! [`evaluator::Evaluator`], [`role_definition_service::RoleDefinitionService`]
//! — behind [`Engine`], the facade a host application actually calls.

pub mod catalog;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod host;
pub mod materializer;
pub mod models;
pub mod registry;
pub mod role_definition_service;
pub mod seeding;
pub mod store;
pub mod team_membership;
pub mod triggers;
pub mod validators;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use host::{ActorContext, AssignmentTracker, ResourceAdapter};
pub use models::{ActorRef, ContentTypeId, ObjectId, PermissionAtom, PkKind, RoleDefinition};
pub use registry::Registry;
pub use store::Store;

use evaluator::Evaluator;
use role_definition_service::RoleDefinitionService;

/// Public facade exposed to the host application (spec §6 "Public
/// operations"). Owns the finalized registry, policy configuration, the
/// per-model resource adapters, an optional assignment tracker, and a
/// handle to the store. Every public method opens one transaction, does
/// its work, and commits — or rolls back on any error (spec §5).
pub struct Engine {
    registry: Registry,
    config: EngineConfig,
    adapters: HashMap<String, Arc<dyn ResourceAdapter>>,
    tracker: Option<Arc<dyn AssignmentTracker>>,
    store: Arc<dyn Store>,
}

impl Engine {
    /// Builds an `Engine` over an already-[`finalize`](Registry::finalize)d
    /// registry. Registering a model after this point is a fatal
    /// `ConfigurationError` (spec §4.1).
    pub fn new(registry: Registry, config: EngineConfig, store: Arc<dyn Store>) -> Result<Self> {
        if !registry.is_finalized() {
            return Err(EngineError::configuration("Engine requires a finalized registry"));
        }
        config
            .validate()
            .map_err(EngineError::configuration)?;
        Ok(Self {
            registry,
            config,
            adapters: HashMap::new(),
            tracker: None,
            store,
        })
    }

    /// Binds the [`ResourceAdapter`] a registered model's rows are reached
    /// through (spec §6 "Resource model interface").
    pub fn with_adapter(mut self, model_name: impl Into<String>, adapter: Arc<dyn ResourceAdapter>) -> Self {
        self.adapters.insert(model_name.into(), adapter);
        self
    }

    /// Registers the optional tracker mirroring assignments into an
    /// application-owned relationship (spec §4.3 step 7).
    pub fn with_tracker(mut self, tracker: Arc<dyn AssignmentTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn service(&self) -> RoleDefinitionService<'_> {
        RoleDefinitionService::new(&self.registry, &self.config, &self.adapters, self.tracker.as_deref())
    }

    fn evaluator(&self) -> Evaluator<'_> {
        Evaluator::new(&self.registry, &self.config, &self.adapters)
    }

    /// One-shot startup seeding of `config.role_precreate` templates (spec
    /// §6 `role_precreate`). Call once after construction, before serving
    /// requests.
    pub async fn seed(&self) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let result = seeding::seed_managed_roles(tx.as_mut(), &self.registry, &self.config).await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// `get_or_create(permissions, name, content_type)` (spec §4.2).
    pub async fn get_or_create_role_definition(
        &self,
        name: &str,
        content_type: Option<ContentTypeId>,
        permissions: BTreeSet<PermissionAtom>,
    ) -> Result<RoleDefinition> {
        let mut tx = self.store.begin().await?;
        match self.service().get_or_create(tx.as_mut(), name, content_type, permissions).await {
            Ok(role_definition) => {
                tx.commit().await?;
                Ok(role_definition)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// `give_permission(role_definition, actor, object)` (spec §4.3).
    pub async fn give_permission(
        &self,
        role_definition_id: Uuid,
        actor: ActorRef,
        content_type: ContentTypeId,
        object_id: ObjectId,
        created_by: Option<Uuid>,
    ) -> Result<()> {
        self.assign(role_definition_id, actor, content_type, object_id, created_by, true).await
    }

    /// `remove_permission(role_definition, actor, object)` (spec §4.3),
    /// idempotent.
    pub async fn remove_permission(
        &self,
        role_definition_id: Uuid,
        actor: ActorRef,
        content_type: ContentTypeId,
        object_id: ObjectId,
    ) -> Result<()> {
        self.assign(role_definition_id, actor, content_type, object_id, None, false).await
    }

    async fn assign(
        &self,
        role_definition_id: Uuid,
        actor: ActorRef,
        content_type: ContentTypeId,
        object_id: ObjectId,
        created_by: Option<Uuid>,
        giving: bool,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let result = self
            .service()
            .give_or_remove_permission(tx.as_mut(), role_definition_id, actor, content_type, object_id, created_by, giving)
            .await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Adds a permission atom to an existing, unmanaged role definition and
    /// rematerializes every object role bound to it (spec §4.2, §4.6 rule 2).
    pub async fn add_permission_to_role(&self, role_definition_id: Uuid, atom: PermissionAtom) -> Result<RoleDefinition> {
        let mut tx = self.store.begin().await?;
        match self.service().add_permission(tx.as_mut(), role_definition_id, atom).await {
            Ok(role_definition) => {
                tx.commit().await?;
                Ok(role_definition)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Removes a permission atom from an existing, unmanaged role
    /// definition; a no-op if it was not present.
    pub async fn remove_permission_from_role(&self, role_definition_id: Uuid, atom: PermissionAtom) -> Result<RoleDefinition> {
        let mut tx = self.store.begin().await?;
        match self.service().remove_permission(tx.as_mut(), role_definition_id, atom).await {
            Ok(role_definition) => {
                tx.commit().await?;
                Ok(role_definition)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Empties a role definition's permission set, forcing a full
    /// recompute of every object role bound to it (spec §4.6 rule 2 /
    /// `post_clear`).
    pub async fn clear_role_permissions(&self, role_definition_id: Uuid) -> Result<RoleDefinition> {
        let mut tx = self.store.begin().await?;
        match self.service().clear_permissions(tx.as_mut(), role_definition_id).await {
            Ok(role_definition) => {
                tx.commit().await?;
                Ok(role_definition)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Deletes a role definition. Refused for `managed` definitions or any
    /// definition still referenced by an assignment (spec §3 "Lifecycle").
    pub async fn delete_role_definition(&self, role_definition_id: Uuid) -> Result<()> {
        let mut tx = self.store.begin().await?;
        match self.service().delete_role_definition(tx.as_mut(), role_definition_id).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Trigger event 3 (spec §4.6): call after the host saves a registered
    /// resource whose parent foreign key changed.
    pub async fn notify_resource_reparented(
        &self,
        parent_content_type: ContentTypeId,
        old_parent_id: ObjectId,
        new_parent_id: ObjectId,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let result = self.service().resource_reparented(tx.as_mut(), parent_content_type, old_parent_id, new_parent_id).await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Trigger event 4 (spec §4.6): call after the host creates a
    /// registered resource under an existing parent.
    pub async fn notify_resource_created(&self, parent_content_type: ContentTypeId, parent_id: ObjectId) -> Result<()> {
        let mut tx = self.store.begin().await?;
        match self.service().resource_created(tx.as_mut(), parent_content_type, parent_id).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Trigger event 5 (spec §4.6): call *before* the host deletes a team
    /// row, so its transitive membership grants can be stashed first.
    pub async fn notify_team_deleted(&self, team_id: Uuid) -> Result<()> {
        let mut tx = self.store.begin().await?;
        match self.service().team_deleted(tx.as_mut(), team_id).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// `give_global_permission(actor)` (spec §4.2).
    pub async fn give_global_permission(&self, role_definition_id: Uuid, actor: ActorRef, created_by: Option<Uuid>) -> Result<()> {
        let mut tx = self.store.begin().await?;
        match self.service().give_global_permission(tx.as_mut(), role_definition_id, actor, created_by).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// `remove_global_permission(actor)`, idempotent.
    pub async fn remove_global_permission(&self, role_definition_id: Uuid, actor: ActorRef) -> Result<()> {
        let mut tx = self.store.begin().await?;
        match self.service().remove_global_permission(tx.as_mut(), role_definition_id, actor).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// `give_creator_permissions(actor, object)` (spec §4.2).
    pub async fn give_creator_permissions(
        &self,
        user_id: Uuid,
        content_type: ContentTypeId,
        object_id: ObjectId,
        created_by: Option<Uuid>,
        is_superuser: bool,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let result = self
            .service()
            .give_creator_permissions(tx.as_mut(), user_id, content_type, object_id, created_by, is_superuser)
            .await;
        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// `has_obj_perm(actor, object, code)` (spec §4.7).
    pub async fn has_obj_perm(&self, actor_context: &ActorContext, content_type: ContentTypeId, object_id: ObjectId, code: &str) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let result = self.evaluator().has_obj_perm(tx.as_mut(), actor_context, content_type, object_id, code).await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// `accessible_ids(type, actor, code)` (spec §4.7).
    pub async fn accessible_ids(&self, actor_context: &ActorContext, content_type: ContentTypeId, code: &str) -> Result<Vec<ObjectId>> {
        let mut tx = self.store.begin().await?;
        let result = self.evaluator().accessible_ids(tx.as_mut(), actor_context, content_type, code).await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// `accessible_objects(type, actor, code)` (spec §4.7).
    pub async fn accessible_objects(&self, actor_context: &ActorContext, content_type: ContentTypeId, code: &str) -> Result<Vec<serde_json::Value>> {
        let mut tx = self.store.begin().await?;
        let result = self.evaluator().accessible_objects(tx.as_mut(), actor_context, content_type, code).await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// `singleton_permissions(actor)` (spec §4.7).
    pub async fn singleton_permissions(&self, actor: ActorRef) -> Result<HashSet<String>> {
        let mut tx = self.store.begin().await?;
        let result = self.evaluator().singleton_permissions(tx.as_mut(), actor).await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemoryStore;

    fn registry_with_org_inventory() -> (Registry, ContentTypeId, ContentTypeId) {
        let mut registry = Registry::new();
        let org_ct = registry.register("organization", None, PkKind::Integer, vec![]).unwrap();
        let inv_ct = registry.register("inventory", Some("organization"), PkKind::Integer, vec![]).unwrap();
        registry.finalize();
        (registry, org_ct, inv_ct)
    }

    #[tokio::test]
    async fn engine_refuses_an_unfinalized_registry() {
        let registry = Registry::new();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let result = Engine::new(registry, EngineConfig::default(), store);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn give_then_check_permission_round_trips() {
        let (registry, org_ct, _inv_ct) = registry_with_org_inventory();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let engine = Engine::new(registry, EngineConfig::default(), store).unwrap();

        let rd = engine
            .get_or_create_role_definition("org-viewer", Some(org_ct), BTreeSet::from([PermissionAtom::new("view_organization", org_ct)]))
            .await
            .unwrap();

        let user_id = Uuid::new_v4();
        engine.give_permission(rd.id, ActorRef::User(user_id), org_ct, ObjectId::Integer(1), None).await.unwrap();

        let actor = ActorContext::user(user_id);
        assert!(engine.has_obj_perm(&actor, org_ct, ObjectId::Integer(1), "view").await.unwrap());
        assert!(!engine.has_obj_perm(&actor, org_ct, ObjectId::Integer(1), "change").await.unwrap());

        let ids = engine.accessible_ids(&actor, org_ct, "view_organization").await.unwrap();
        assert_eq!(ids, vec![ObjectId::Integer(1)]);
    }
}
