use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::host::ResourceAdapter;
use crate::models::{ContentTypeId, EvaluationTuple, ObjectId, ObjectRole};
use crate::registry::Registry;
use crate::store::StoreTransaction;

/// A single expected effective-permission record, before it is stamped with
/// the object role that will own it in the evaluation cache.
type ExpectedTuple = (String, ContentTypeId, ObjectId);

/// Recomputes the evaluation cache from the assignment/object-role graph
/// (spec §4.4). Holds no mutable state of its own; every method takes the
/// [`StoreTransaction`] it should read and write through.
pub struct Materializer<'a> {
    registry: &'a Registry,
    adapters: &'a HashMap<String, Arc<dyn ResourceAdapter>>,
    config: &'a EngineConfig,
}

impl<'a> Materializer<'a> {
    pub fn new(registry: &'a Registry, adapters: &'a HashMap<String, Arc<dyn ResourceAdapter>>, config: &'a EngineConfig) -> Self {
        Self { registry, adapters, config }
    }

    /// Walks the registry's parent chain from `to_model` back up to
    /// `from_model`, returning the models in traversal order
    /// (`[from_model, ..., to_model]`). `None` if `to_model` is not a
    /// descendant of `from_model`.
    fn model_chain(&self, from_model: &str, to_model: &str) -> Option<Vec<String>> {
        if from_model == to_model {
            return Some(vec![from_model.to_string()]);
        }
        let mut chain = vec![to_model.to_string()];
        let mut current = to_model.to_string();
        for _ in 0..=self.registry_len() {
            let parent = self.registry.parent_of(&current)?;
            chain.push(parent.model_name.clone());
            if parent.model_name == from_model {
                chain.reverse();
                return Some(chain);
            }
            current = parent.model_name.clone();
        }
        None
    }

    fn registry_len(&self) -> usize {
        // Bound on the number of hops a well-formed (cycle-free) registry
        // chain can have; used only to cap the model_chain walk.
        self.adapters.len() + 1
    }

    /// Enumerates ids of `to_model` reachable from `from_id` (an instance of
    /// `from_model`) by chaining single-hop [`ResourceAdapter::ids_under_parent`]
    /// calls, composing the `__`-joined Django filter paths of the source
    /// project into an explicit walk.
    async fn descendant_ids(&self, from_model: &str, from_id: ObjectId, to_model: &str) -> Result<Vec<ObjectId>> {
        if from_model == to_model {
            return Ok(vec![from_id]);
        }
        let chain = self
            .model_chain(from_model, to_model)
            .ok_or_else(|| EngineError::configuration(format!("{to_model} is not a descendant of {from_model}")))?;

        let mut current_ids = vec![from_id];
        for model in chain.iter().skip(1) {
            let adapter = self
                .adapters
                .get(model)
                .ok_or_else(|| EngineError::configuration(format!("no resource adapter registered for {model}")))?;
            let mut next_ids = Vec::new();
            for id in &current_ids {
                next_ids.extend(adapter.ids_under_parent(*id).await?);
            }
            current_ids = next_ids;
        }
        Ok(current_ids)
    }

    /// Permissions `role` confers by its own permission set alone, ignoring
    /// any team-membership inheritance (mirrors `expected_direct_permissions`).
    #[instrument(skip(self, tx), fields(object_role_id = %role.id))]
    pub async fn expected_direct_permissions(
        &self,
        tx: &mut dyn StoreTransaction,
        role: &ObjectRole,
    ) -> Result<HashSet<ExpectedTuple>> {
        let role_definition = tx.get_role_definition(role.role_definition_id).await?;
        let role_model = self
            .registry
            .resource_by_content_type(role.content_type)
            .ok_or_else(|| EngineError::configuration(format!("unknown content type {}", role.content_type)))?
            .model_name
            .clone();

        let mut expected = HashSet::new();
        let mut id_cache: HashMap<ContentTypeId, Vec<ObjectId>> = HashMap::new();

        for perm in &role_definition.permissions {
            if perm.content_type == role.content_type {
                expected.insert((perm.codename.clone(), role.content_type, role.object_id));
                continue;
            }

            let Some(target_kind) = self.registry.resource_by_content_type(perm.content_type) else {
                warn!("{} listed {} but its content type is not registered, ignoring", role_definition.name, perm.codename);
                continue;
            };
            let target_model = target_kind.model_name.clone();

            // Parent-level emission: unconditional for add_*, opt-in for
            // everything else via cache_parent_permissions (spec Open
            // Question (c)).
            if perm.is_add_permission() || self.config.cache_parent_permissions {
                expected.insert((perm.codename.clone(), role.content_type, role.object_id));
            }

            if perm.is_add_permission() {
                let Some(parent_of_target) = self.registry.parent_of(&target_model) else {
                    continue;
                };
                if parent_of_target.model_name == role_model {
                    // Direct child: the parent-level tuple above already
                    // covers this, no per-object expansion needed.
                    continue;
                }
                let intermediate_model = parent_of_target.model_name.clone();
                let intermediate_ct = parent_of_target.content_type_id;

                let ids = match id_cache.get(&intermediate_ct) {
                    Some(ids) => ids.clone(),
                    None => {
                        let fetched = self.descendant_ids(&role_model, role.object_id, &intermediate_model).await?;
                        id_cache.insert(intermediate_ct, fetched.clone());
                        fetched
                    }
                };
                for id in ids {
                    expected.insert((perm.codename.clone(), intermediate_ct, id));
                }
            } else {
                if !self.registry.is_descendant_of(&target_model, &role_model) {
                    warn!("{} listed {} but model is not a descendant, ignoring", role_definition.name, perm.codename);
                    continue;
                }
                let ids = match id_cache.get(&perm.content_type) {
                    Some(ids) => ids.clone(),
                    None => {
                        let fetched = self.descendant_ids(&role_model, role.object_id, &target_model).await?;
                        id_cache.insert(perm.content_type, fetched.clone());
                        fetched
                    }
                };
                for id in ids {
                    expected.insert((perm.codename.clone(), perm.content_type, id));
                }
            }
        }
        Ok(expected)
    }

    /// Full expected evaluation set for `role`: its own direct permissions,
    /// plus — for every team `role` grants membership in — the direct
    /// permissions of every object role that team holds as an actor
    /// (mirrors `needed_cache_updates`'s `provides_teams` loop exactly).
    pub async fn expected_permissions(&self, tx: &mut dyn StoreTransaction, role: &ObjectRole) -> Result<HashSet<ExpectedTuple>> {
        let mut expected = self.expected_direct_permissions(tx, role).await?;
        for team_id in &role.provides_teams {
            for object_role_id in tx.object_roles_held_by_team(*team_id).await? {
                let team_role = tx.get_object_role(object_role_id).await?;
                expected.extend(self.expected_direct_permissions(tx, &team_role).await?);
            }
        }
        Ok(expected)
    }

    /// Reconciles the evaluation cache for every object role in `dirty`:
    /// computes `expected`, diffs it against what is currently stored, and
    /// applies one bulk add/delete per object role.
    #[instrument(skip(self, tx, dirty))]
    pub async fn compute_object_role_permissions(&self, tx: &mut dyn StoreTransaction, dirty: &HashSet<Uuid>) -> Result<()> {
        for object_role_id in dirty {
            let role = tx.get_object_role(*object_role_id).await?;
            let expected = self.expected_permissions(tx, &role).await?;
            let existing = tx.evaluation_tuples_for_object_role(*object_role_id).await?;

            let existing_keys: HashSet<ExpectedTuple> =
                existing.iter().map(|t| (t.codename.clone(), t.content_type, t.object_id)).collect();

            let to_add: Vec<EvaluationTuple> = expected
                .difference(&existing_keys)
                .map(|(codename, content_type, object_id)| EvaluationTuple {
                    object_role_id: *object_role_id,
                    content_type: *content_type,
                    object_id: *object_id,
                    codename: codename.clone(),
                })
                .collect();

            let to_delete: Vec<EvaluationTuple> = existing
                .into_iter()
                .filter(|t| !expected.contains(&(t.codename.clone(), t.content_type, t.object_id)))
                .collect();

            if !to_add.is_empty() || !to_delete.is_empty() {
                tx.apply_evaluation_diff(to_add, to_delete).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PermissionAtom, PkKind, RoleDefinition};
    use crate::store::{MemoryStore, Store};
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// In-memory [`ResourceAdapter`] driven by an explicit parent-id map,
    /// standing in for a host application's resource tables in tests.
    struct FakeAdapter {
        children_by_parent: Mutex<HashMap<ObjectId, Vec<ObjectId>>>,
    }

    impl FakeAdapter {
        fn new(edges: Vec<(ObjectId, ObjectId)>) -> Self {
            let mut map: HashMap<ObjectId, Vec<ObjectId>> = HashMap::new();
            for (parent, child) in edges {
                map.entry(parent).or_default().push(child);
            }
            Self { children_by_parent: Mutex::new(map) }
        }
    }

    #[async_trait::async_trait]
    impl ResourceAdapter for FakeAdapter {
        async fn ids_under_parent(&self, parent_id: ObjectId) -> Result<Vec<ObjectId>> {
            Ok(self.children_by_parent.lock().unwrap().get(&parent_id).cloned().unwrap_or_default())
        }

        async fn parent_id_of(&self, _child_id: ObjectId) -> Result<Option<ObjectId>> {
            Ok(None)
        }

        async fn all_ids(&self) -> Result<Vec<ObjectId>> {
            Ok(self.children_by_parent.lock().unwrap().values().flatten().copied().collect())
        }

        async fn resolve(&self, ids: &[ObjectId]) -> Result<Vec<serde_json::Value>> {
            Ok(ids.iter().map(|id| serde_json::json!({ "id": id.to_string() })).collect())
        }
    }

    fn org_inventory_host_registry() -> (Registry, ContentTypeId, ContentTypeId, ContentTypeId) {
        let mut registry = Registry::new();
        let org_ct = registry.register("organization", None, PkKind::Integer, vec![]).unwrap();
        let inv_ct = registry.register("inventory", Some("organization"), PkKind::Integer, vec![]).unwrap();
        let host_ct = registry.register("host", Some("inventory"), PkKind::Integer, vec![]).unwrap();
        (registry, org_ct, inv_ct, host_ct)
    }

    async fn insert_role_definition(
        tx: &mut dyn StoreTransaction,
        content_type: Option<ContentTypeId>,
        permissions: Vec<PermissionAtom>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        tx.insert_role_definition(RoleDefinition {
            id,
            name: format!("rd-{id}"),
            description: String::new(),
            managed: false,
            content_type,
            permissions: permissions.into_iter().collect::<BTreeSet<_>>(),
        })
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn direct_permission_emits_one_tuple_on_the_object_itself() {
        let (registry, org_ct, _inv_ct, _host_ct) = org_inventory_host_registry();
        let adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        let config = EngineConfig::default();
        let materializer = Materializer::new(&registry, &adapters, &config);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let rd_id = insert_role_definition(tx.as_mut(), Some(org_ct), vec![PermissionAtom::new("view_organization", org_ct)]).await;
        let (role, _) = tx.find_or_create_object_role(rd_id, org_ct, ObjectId::Integer(1)).await.unwrap();

        let expected = materializer.expected_direct_permissions(tx.as_mut(), &role).await.unwrap();
        assert!(expected.contains(&("view_organization".to_string(), org_ct, ObjectId::Integer(1))));
    }

    #[tokio::test]
    async fn add_permission_on_direct_child_only_emits_parent_tuple() {
        let (registry, org_ct, inv_ct, _host_ct) = org_inventory_host_registry();
        let adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        let config = EngineConfig::default();
        let materializer = Materializer::new(&registry, &adapters, &config);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let rd_id = insert_role_definition(
            tx.as_mut(),
            Some(org_ct),
            vec![PermissionAtom::new("view_organization", org_ct), PermissionAtom::new("add_inventory", inv_ct)],
        )
        .await;
        let (role, _) = tx.find_or_create_object_role(rd_id, org_ct, ObjectId::Integer(1)).await.unwrap();

        let expected = materializer.expected_direct_permissions(tx.as_mut(), &role).await.unwrap();
        assert!(expected.contains(&("add_inventory".to_string(), org_ct, ObjectId::Integer(1))));
        assert!(!expected.iter().any(|(_, ct, _)| *ct == inv_ct));
    }

    #[tokio::test]
    async fn add_permission_on_grandchild_propagates_to_intermediate_parent() {
        let (registry, org_ct, inv_ct, host_ct) = org_inventory_host_registry();
        let mut adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        adapters.insert(
            "inventory".to_string(),
            Arc::new(FakeAdapter::new(vec![(ObjectId::Integer(1), ObjectId::Integer(10)), (ObjectId::Integer(1), ObjectId::Integer(11))])),
        );
        let config = EngineConfig::default();
        let materializer = Materializer::new(&registry, &adapters, &config);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let rd_id = insert_role_definition(
            tx.as_mut(),
            Some(org_ct),
            vec![PermissionAtom::new("view_organization", org_ct), PermissionAtom::new("add_host", host_ct)],
        )
        .await;
        let (role, _) = tx.find_or_create_object_role(rd_id, org_ct, ObjectId::Integer(1)).await.unwrap();

        let expected = materializer.expected_direct_permissions(tx.as_mut(), &role).await.unwrap();
        // add_host on an org role grants "add a host" on each inventory under
        // the org, not on any host directly (hosts do not exist to add yet).
        assert!(expected.contains(&("add_host".to_string(), inv_ct, ObjectId::Integer(10))));
        assert!(expected.contains(&("add_host".to_string(), inv_ct, ObjectId::Integer(11))));
        assert!(!expected.iter().any(|(_, ct, _)| *ct == host_ct));
    }

    #[tokio::test]
    async fn non_add_child_permission_propagates_to_each_descendant() {
        let (registry, org_ct, inv_ct, _host_ct) = org_inventory_host_registry();
        let mut adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        adapters.insert(
            "inventory".to_string(),
            Arc::new(FakeAdapter::new(vec![(ObjectId::Integer(1), ObjectId::Integer(10)), (ObjectId::Integer(1), ObjectId::Integer(11))])),
        );
        let config = EngineConfig::default();
        let materializer = Materializer::new(&registry, &adapters, &config);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let rd_id = insert_role_definition(
            tx.as_mut(),
            Some(org_ct),
            vec![PermissionAtom::new("view_organization", org_ct), PermissionAtom::new("view_inventory", inv_ct)],
        )
        .await;
        let (role, _) = tx.find_or_create_object_role(rd_id, org_ct, ObjectId::Integer(1)).await.unwrap();

        let expected = materializer.expected_direct_permissions(tx.as_mut(), &role).await.unwrap();
        assert!(expected.contains(&("view_inventory".to_string(), inv_ct, ObjectId::Integer(10))));
        assert!(expected.contains(&("view_inventory".to_string(), inv_ct, ObjectId::Integer(11))));
    }

    #[tokio::test]
    async fn team_provides_teams_pulls_in_the_team_actor_roles_direct_permissions() {
        let (registry, org_ct, inv_ct, _host_ct) = org_inventory_host_registry();
        let adapters: HashMap<String, Arc<dyn ResourceAdapter>> = HashMap::new();
        let config = EngineConfig::default();
        let materializer = Materializer::new(&registry, &adapters, &config);

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let inv_rd = insert_role_definition(tx.as_mut(), Some(inv_ct), vec![PermissionAtom::new("view_inventory", inv_ct)]).await;
        let (inv_role, _) = tx.find_or_create_object_role(inv_rd, inv_ct, ObjectId::Integer(100)).await.unwrap();
        let team_id = Uuid::new_v4();
        tx.add_team_assignment(inv_role.id, team_id, inv_rd, None).await.unwrap();

        let member_rd = insert_role_definition(tx.as_mut(), Some(org_ct), vec![]).await;
        let (mut member_role, _) = tx.find_or_create_object_role(member_rd, org_ct, ObjectId::Integer(1)).await.unwrap();
        member_role.provides_teams.insert(team_id);
        tx.set_provides_teams(member_role.id, member_role.provides_teams.clone()).await.unwrap();

        let expected = materializer.expected_permissions(tx.as_mut(), &member_role).await.unwrap();
        assert!(expected.contains(&("view_inventory".to_string(), inv_ct, ObjectId::Integer(100))));
    }
}
