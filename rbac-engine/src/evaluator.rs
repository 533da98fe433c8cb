use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::instrument;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::host::{ActorContext, ResourceAdapter};
use crate::models::{ActorRef, ContentTypeId, ObjectId};
use crate::registry::Registry;
use crate::store::StoreTransaction;
use crate::validators::validate_codename_for_model;

/// Read-side query API (spec §4.7). Holds no mutable state: every call
/// takes the transaction it should read through.
pub struct Evaluator<'a> {
    registry: &'a Registry,
    config: &'a EngineConfig,
    adapters: &'a HashMap<String, Arc<dyn ResourceAdapter>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(registry: &'a Registry, config: &'a EngineConfig, adapters: &'a HashMap<String, Arc<dyn ResourceAdapter>>) -> Self {
        Self { registry, config, adapters }
    }

    fn model_name_for(&self, content_type: ContentTypeId) -> Result<&str> {
        self.registry
            .resource_by_content_type(content_type)
            .map(|kind| kind.model_name.as_str())
            .ok_or_else(|| EngineError::configuration(format!("unknown content type {content_type}")))
    }

    fn adapter_for(&self, model_name: &str) -> Result<&Arc<dyn ResourceAdapter>> {
        self.adapters
            .get(model_name)
            .ok_or_else(|| EngineError::configuration(format!("no resource adapter registered for {model_name}")))
    }

    /// Object role ids the actor directly holds. Team-granted permissions
    /// are already folded into the evaluation tuples stored under these
    /// ids by the materializer, so no further team walk is needed here
    /// (spec §4.7 `has_roles`).
    async fn held_object_role_ids(&self, tx: &mut dyn StoreTransaction, actor: ActorRef) -> Result<Vec<Uuid>> {
        match actor {
            ActorRef::User(user_id) => tx.object_role_ids_for_user(user_id).await,
            ActorRef::Team(team_id) => tx.object_role_ids_for_teams(&[team_id]).await,
        }
    }

    /// Teams whose membership is granted to `actor` by the object roles it
    /// directly holds — the input to the on-demand global-permission join
    /// (spec §4.7 "Global permissions ... computed on demand ... plus
    /// global role assignments for teams whose membership the user holds
    /// (via provides_teams)").
    async fn granted_teams(&self, tx: &mut dyn StoreTransaction, actor: ActorRef) -> Result<HashSet<Uuid>> {
        let mut teams = HashSet::new();
        for object_role_id in self.held_object_role_ids(tx, actor).await? {
            let role = tx.get_object_role(object_role_id).await?;
            teams.extend(role.provides_teams);
        }
        Ok(teams)
    }

    /// The full on-demand global-permission set for `actor` (spec §4.7
    /// `singleton_permissions`). Global roles are never materialized into
    /// the cache, so this always recomputes from the assignment tables.
    #[instrument(skip(self, tx))]
    pub async fn singleton_permissions(&self, tx: &mut dyn StoreTransaction, actor: ActorRef) -> Result<HashSet<String>> {
        let mut role_definition_ids = HashSet::new();

        match actor {
            ActorRef::User(user_id) => {
                role_definition_ids.extend(tx.global_role_definition_ids_for_user(user_id).await?);
            }
            ActorRef::Team(team_id) => {
                role_definition_ids.extend(tx.global_role_definition_ids_for_teams(&[team_id]).await?);
            }
        }

        let granted_teams = self.granted_teams(tx, actor).await?;
        if !granted_teams.is_empty() {
            let team_ids: Vec<Uuid> = granted_teams.into_iter().collect();
            role_definition_ids.extend(tx.global_role_definition_ids_for_teams(&team_ids).await?);
        }

        let mut codenames = HashSet::new();
        for role_definition_id in role_definition_ids {
            let role_definition = tx.get_role_definition(role_definition_id).await?;
            codenames.extend(role_definition.permissions.into_iter().map(|perm| perm.codename));
        }
        Ok(codenames)
    }

    /// `has_obj_perm(actor, object, code)` (spec §4.7). `code` may be a
    /// bare action, a dotted name, or a fully-qualified codename; it is
    /// normalized against `content_type`'s model before any check runs.
    #[instrument(skip(self, tx, actor_context))]
    pub async fn has_obj_perm(
        &self,
        tx: &mut dyn StoreTransaction,
        actor_context: &ActorContext,
        content_type: ContentTypeId,
        object_id: ObjectId,
        code: &str,
    ) -> Result<bool> {
        if actor_context.is_superuser {
            return Ok(true);
        }

        let model_name = self.model_name_for(content_type)?;
        let codename = validate_codename_for_model(self.registry, code, model_name)?;

        for (action, flag) in &self.config.bypass_action_flags {
            if actor_context.active_bypass_flags.contains(flag) && codename.starts_with(&format!("{action}_")) {
                return Ok(true);
            }
        }

        if self.singleton_permissions(tx, actor_context.actor).await?.contains(&codename) {
            return Ok(true);
        }

        let held = self.held_object_role_ids(tx, actor_context.actor).await?;
        tx.has_tuple(&held, content_type, object_id, &codename).await
    }

    /// `accessible_ids(type, actor, code)` (spec §4.7): distinct object ids
    /// of `content_type` the actor may exercise `code` on. Short-circuits
    /// to every id of the type when a superuser flag applies.
    #[instrument(skip(self, tx, actor_context))]
    pub async fn accessible_ids(
        &self,
        tx: &mut dyn StoreTransaction,
        actor_context: &ActorContext,
        content_type: ContentTypeId,
        code: &str,
    ) -> Result<Vec<ObjectId>> {
        let model_name = self.model_name_for(content_type)?;
        let codename = validate_codename_for_model(self.registry, code, model_name)?;

        if actor_context.is_superuser {
            return self.adapter_for(model_name)?.all_ids().await;
        }

        for (action, flag) in &self.config.bypass_action_flags {
            if actor_context.active_bypass_flags.contains(flag) && codename.starts_with(&format!("{action}_")) {
                return self.adapter_for(model_name)?.all_ids().await;
            }
        }

        let held = self.held_object_role_ids(tx, actor_context.actor).await?;
        tx.accessible_ids(content_type, &held, &codename).await
    }

    /// `accessible_objects(type, actor, code)`: `accessible_ids` resolved
    /// through the host's `ResourceAdapter::resolve` hook into full objects.
    #[instrument(skip(self, tx, actor_context))]
    pub async fn accessible_objects(
        &self,
        tx: &mut dyn StoreTransaction,
        actor_context: &ActorContext,
        content_type: ContentTypeId,
        code: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let model_name = self.model_name_for(content_type)?.to_string();
        let ids = self.accessible_ids(tx, actor_context, content_type, code).await?;
        self.adapter_for(&model_name)?.resolve(&ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PermissionAtom, PkKind, RoleDefinition};
    use crate::store::{MemoryStore, Store};
    use std::collections::BTreeSet;

    struct NoopAdapter;

    #[async_trait::async_trait]
    impl ResourceAdapter for NoopAdapter {
        async fn ids_under_parent(&self, _parent_id: ObjectId) -> Result<Vec<ObjectId>> {
            Ok(vec![])
        }
        async fn parent_id_of(&self, _child_id: ObjectId) -> Result<Option<ObjectId>> {
            Ok(None)
        }
        async fn all_ids(&self) -> Result<Vec<ObjectId>> {
            Ok(vec![ObjectId::Integer(1), ObjectId::Integer(2), ObjectId::Integer(3)])
        }
        async fn resolve(&self, ids: &[ObjectId]) -> Result<Vec<serde_json::Value>> {
            Ok(ids.iter().map(|id| serde_json::json!({ "id": id.to_string() })).collect())
        }
    }

    fn registry_with_inventory() -> (Registry, ContentTypeId) {
        let mut registry = Registry::new();
        registry.register("organization", None, PkKind::Integer, vec![]).unwrap();
        let inv_ct = registry.register("inventory", Some("organization"), PkKind::Integer, vec![]).unwrap();
        (registry, inv_ct)
    }

    #[tokio::test]
    async fn superuser_bypasses_all_checks() {
        let (registry, inv_ct) = registry_with_inventory();
        let config = EngineConfig::default();
        let mut adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        adapters.insert("inventory".to_string(), Arc::new(NoopAdapter));
        let evaluator = Evaluator::new(&registry, &config, &adapters);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let actor = ActorContext::user(Uuid::new_v4()).with_superuser(true);

        assert!(evaluator
            .has_obj_perm(tx.as_mut(), &actor, inv_ct, ObjectId::Integer(1), "change_inventory")
            .await
            .unwrap());
        let ids = evaluator.accessible_ids(tx.as_mut(), &actor, inv_ct, "change_inventory").await.unwrap();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn has_obj_perm_true_when_evaluation_tuple_exists() {
        let (registry, inv_ct) = registry_with_inventory();
        let config = EngineConfig::default();
        let adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        let evaluator = Evaluator::new(&registry, &config, &adapters);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let rd_id = Uuid::new_v4();
        tx.insert_role_definition(RoleDefinition {
            id: rd_id,
            name: "inv-viewer".to_string(),
            description: String::new(),
            managed: false,
            content_type: Some(inv_ct),
            permissions: BTreeSet::from([PermissionAtom::new("view_inventory", inv_ct)]),
        })
        .await
        .unwrap();
        let (role, _) = tx.find_or_create_object_role(rd_id, inv_ct, ObjectId::Integer(7)).await.unwrap();
        let user_id = Uuid::new_v4();
        tx.add_user_assignment(role.id, user_id, rd_id, None).await.unwrap();
        tx.apply_evaluation_diff(
            vec![crate::models::EvaluationTuple {
                object_role_id: role.id,
                content_type: inv_ct,
                object_id: ObjectId::Integer(7),
                codename: "view_inventory".to_string(),
            }],
            vec![],
        )
        .await
        .unwrap();

        let actor = ActorContext::user(user_id);
        assert!(evaluator.has_obj_perm(tx.as_mut(), &actor, inv_ct, ObjectId::Integer(7), "view").await.unwrap());
        assert!(!evaluator.has_obj_perm(tx.as_mut(), &actor, inv_ct, ObjectId::Integer(7), "change").await.unwrap());
    }

    #[tokio::test]
    async fn bypass_action_flag_short_circuits_matching_action() {
        let (registry, inv_ct) = registry_with_inventory();
        let mut config = EngineConfig::default();
        config.bypass_action_flags.insert("view".to_string(), "is_system_auditor".to_string());
        let adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        let evaluator = Evaluator::new(&registry, &config, &adapters);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let actor = ActorContext::user(Uuid::new_v4())
            .with_bypass_flags(HashSet::from(["is_system_auditor".to_string()]));

        assert!(evaluator.has_obj_perm(tx.as_mut(), &actor, inv_ct, ObjectId::Integer(1), "view").await.unwrap());
    }
}
