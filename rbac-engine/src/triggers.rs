use std::collections::HashSet;

use tracing::instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::models::ObjectId;
use crate::registry::Registry;
use crate::store::StoreTransaction;

/// Result of a trigger computation: the object roles that need
/// rematerializing and whether team membership must be recomputed first
/// (spec §4.5 "must happen strictly before the object-role materializer").
#[derive(Debug, Default, Clone)]
pub struct DirtySet {
    pub object_role_ids: HashSet<Uuid>,
    pub team_recompute: bool,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_team_recompute(mut self) -> Self {
        self.team_recompute = true;
        self
    }

    fn extend(&mut self, ids: impl IntoIterator<Item = Uuid>) {
        self.object_role_ids.extend(ids);
    }
}

/// Collects, for `team_id`, every object role that transitively grants it
/// membership (directly or via `provides_teams` on some ancestor role),
/// by scanning the whole object-role table. Used when a team-actor
/// assignment changes: removing a team's grant may cascade to everything
/// that currently reaches that team (spec §4.6 rule 1).
pub async fn object_roles_granting_membership_to(tx: &mut dyn StoreTransaction, team_id: Uuid) -> Result<HashSet<Uuid>> {
    let mut out = HashSet::new();
    for object_role_id in tx.all_object_role_ids().await? {
        let role = tx.get_object_role(object_role_id).await?;
        if role.provides_teams.contains(&team_id) {
            out.insert(object_role_id);
        }
    }
    Ok(out)
}

/// Object roles held by `team_id` as a team actor: the descendants a
/// membership change cascades into via `provides_teams` (spec §4.6 rule 1).
async fn descendants_of_team(tx: &mut dyn StoreTransaction, team_id: Uuid) -> Result<HashSet<Uuid>> {
    Ok(tx.object_roles_held_by_team(team_id).await?.into_iter().collect())
}

/// Event 1: an assignment (user or team) was created or removed on
/// `object_role_id`, whose role definition holds `permissions` and targets
/// `actor_team_id` if the actor is a team. `created` is true when this call
/// follows `find_or_create_object_role` actually inserting a new row rather
/// than reusing an existing one; `giving` is true for a grant, false for a
/// revoke. Whenever the role carries the team permission on a freshly
/// created object role, or a team actor is given a role, the roles reachable
/// through `object_role_id`'s own `provides_teams` closure must also be
/// dirtied, since they may now see a new (or newly-absent) transitive member
/// (spec §4.6 rule 1).
#[instrument(skip(tx, registry))]
pub async fn on_assignment_changed(
    tx: &mut dyn StoreTransaction,
    registry: &Registry,
    object_role_id: Uuid,
    role_definition_permissions_contain_team_perm: bool,
    created: bool,
    giving: bool,
    actor_team_id: Option<Uuid>,
) -> Result<DirtySet> {
    let _ = registry;
    let mut dirty = DirtySet::new();
    dirty.extend([object_role_id]);

    if let Some(team_id) = actor_team_id {
        dirty.extend(object_roles_granting_membership_to(tx, team_id).await?);
        dirty.extend(descendants_of_team(tx, team_id).await?);
    }

    if (role_definition_permissions_contain_team_perm && created) || (giving && actor_team_id.is_some()) {
        dirty.extend(descendants_of_role(tx, object_role_id).await?);
    }

    if role_definition_permissions_contain_team_perm {
        dirty.team_recompute = true;
    }

    Ok(dirty)
}

/// Event 2: a role definition's permission set changed. `cleared` is true
/// for a `post_clear` signal, where the removed set is unknown and a full
/// recompute is the only sound response (spec §4.6 rule 2, DESIGN.md (b)).
#[instrument(skip(tx))]
pub async fn on_role_definition_permissions_changed(
    tx: &mut dyn StoreTransaction,
    role_definition_id: Uuid,
    touches_team_permission: bool,
    cleared: bool,
) -> Result<DirtySet> {
    let mut dirty = DirtySet::new();

    if cleared {
        dirty.extend(tx.all_object_role_ids().await?);
        dirty.team_recompute = true;
        return Ok(dirty);
    }

    let bound_roles = tx.object_roles_for_role_definition(role_definition_id).await?;
    dirty.extend(bound_roles.iter().copied());

    if touches_team_permission {
        dirty.team_recompute = true;
        for object_role_id in &bound_roles {
            dirty.extend(descendants_of_role(tx, *object_role_id).await?);
        }
    }

    Ok(dirty)
}

/// Object roles reachable from `object_role_id` through the teams it grants
/// membership into: for each team in `provides_teams`, every object role
/// that team itself holds (spec §4.6, `ObjectRole.descendent_roles()`).
async fn descendants_of_role(tx: &mut dyn StoreTransaction, object_role_id: Uuid) -> Result<HashSet<Uuid>> {
    let role = tx.get_object_role(object_role_id).await?;
    let mut out = HashSet::new();
    for team_id in &role.provides_teams {
        out.extend(descendants_of_team(tx, *team_id).await?);
    }
    Ok(out)
}

/// Event 3: a registered resource was reparented from `old_parent_id` to
/// `new_parent_id` (both ids of the *parent* model, which may itself be a
/// team). Dirty set includes object roles bound to either parent, plus the
/// object roles of any team that transitively grants access to either
/// (spec §4.6 rule 3).
#[instrument(skip(tx, registry))]
pub async fn on_resource_reparented(
    tx: &mut dyn StoreTransaction,
    registry: &Registry,
    parent_content_type: crate::models::ContentTypeId,
    old_parent_id: ObjectId,
    new_parent_id: ObjectId,
) -> Result<DirtySet> {
    let _ = registry;
    let mut dirty = DirtySet::new();

    for parent_id in [old_parent_id, new_parent_id] {
        for object_role_id in tx.all_object_role_ids().await? {
            let role = tx.get_object_role(object_role_id).await?;
            if role.content_type == parent_content_type && role.object_id == parent_id {
                dirty.extend([object_role_id]);
                for team_id in &role.teams {
                    dirty.extend(object_roles_granting_membership_to(tx, *team_id).await?);
                }
            }
        }
    }

    Ok(dirty)
}

/// Event 4: a registered resource was created under `parent_id` (of
/// `parent_content_type`). If the parent already has object roles bound to
/// it, include them so the new child's permissions materialize immediately
/// (spec §4.6 rule 4).
#[instrument(skip(tx))]
pub async fn on_resource_created(
    tx: &mut dyn StoreTransaction,
    parent_content_type: crate::models::ContentTypeId,
    parent_id: ObjectId,
) -> Result<DirtySet> {
    let mut dirty = DirtySet::new();
    for object_role_id in tx.all_object_role_ids().await? {
        let role = tx.get_object_role(object_role_id).await?;
        if role.content_type == parent_content_type && role.object_id == parent_id {
            dirty.extend([object_role_id]);
        }
    }
    Ok(dirty)
}

/// Event 5: `team_id` was deleted. `stashed_member_roles` is the team's
/// `member_roles` set captured *before* the delete (the caller must read it
/// first, since after cascade-delete there is nothing left to read from).
/// Dirty set is the descendants of those roles; team-recompute is always
/// set because the team graph itself changed (spec §4.6 rule 5).
#[instrument(skip(tx, stashed_member_roles))]
pub async fn on_team_deleted(tx: &mut dyn StoreTransaction, stashed_member_roles: &HashSet<Uuid>) -> Result<DirtySet> {
    let mut dirty = DirtySet::new().with_team_recompute();
    for object_role_id in stashed_member_roles {
        let role = tx.get_object_role(*object_role_id).await?;
        dirty.extend([role.id]);
        for team_id in &role.teams {
            dirty.extend(descendants_of_team(tx, *team_id).await?);
        }
    }
    Ok(dirty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentTypeId, PermissionAtom, PkKind, RoleDefinition};
    use crate::registry::Registry;
    use crate::store::{MemoryStore, Store};
    use std::collections::BTreeSet;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register("organization", None, PkKind::Integer, vec![]).unwrap();
        registry.register("inventory", Some("organization"), PkKind::Integer, vec![]).unwrap();
        registry
    }

    async fn insert_rd(tx: &mut dyn StoreTransaction, content_type: Option<ContentTypeId>) -> Uuid {
        let id = Uuid::new_v4();
        tx.insert_role_definition(RoleDefinition {
            id,
            name: format!("rd-{id}"),
            description: String::new(),
            managed: false,
            content_type,
            permissions: BTreeSet::from([PermissionAtom::new("view_x", content_type.unwrap_or(ContentTypeId(99)))]),
        })
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn assignment_changed_on_team_actor_includes_granting_ancestors() {
        let registry = registry();
        let org_ct = registry.resource("organization").unwrap().content_type_id;
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let rd = insert_rd(tx.as_mut(), Some(org_ct)).await;
        let (ancestor_role, _) = tx.find_or_create_object_role(rd, org_ct, ObjectId::Integer(1)).await.unwrap();
        let team_id = Uuid::new_v4();
        let mut provides = HashSet::new();
        provides.insert(team_id);
        tx.set_provides_teams(ancestor_role.id, provides).await.unwrap();

        let (target_role, _) = tx.find_or_create_object_role(rd, org_ct, ObjectId::Integer(2)).await.unwrap();
        tx.add_team_assignment(target_role.id, team_id, rd, None).await.unwrap();

        let dirty = on_assignment_changed(tx.as_mut(), &registry, target_role.id, false, false, true, Some(team_id))
            .await
            .unwrap();
        assert!(dirty.object_role_ids.contains(&target_role.id));
        assert!(dirty.object_role_ids.contains(&ancestor_role.id));
    }

    #[tokio::test]
    async fn permissions_cleared_triggers_full_recompute() {
        let registry = registry();
        let org_ct = registry.resource("organization").unwrap().content_type_id;
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let rd = insert_rd(tx.as_mut(), Some(org_ct)).await;
        let (role_a, _) = tx.find_or_create_object_role(rd, org_ct, ObjectId::Integer(1)).await.unwrap();
        let other_rd = insert_rd(tx.as_mut(), Some(org_ct)).await;
        let (role_b, _) = tx.find_or_create_object_role(other_rd, org_ct, ObjectId::Integer(2)).await.unwrap();

        let dirty = on_role_definition_permissions_changed(tx.as_mut(), rd, false, true).await.unwrap();
        assert!(dirty.object_role_ids.contains(&role_a.id));
        assert!(dirty.object_role_ids.contains(&role_b.id));
        assert!(dirty.team_recompute);
    }

    #[tokio::test]
    async fn reparented_resource_dirties_old_and_new_parent_roles() {
        let registry = registry();
        let org_ct = registry.resource("organization").unwrap().content_type_id;
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let rd = insert_rd(tx.as_mut(), Some(org_ct)).await;
        let (old_role, _) = tx.find_or_create_object_role(rd, org_ct, ObjectId::Integer(1)).await.unwrap();
        let (new_role, _) = tx.find_or_create_object_role(rd, org_ct, ObjectId::Integer(2)).await.unwrap();

        let dirty = on_resource_reparented(tx.as_mut(), &registry, org_ct, ObjectId::Integer(1), ObjectId::Integer(2))
            .await
            .unwrap();
        assert!(dirty.object_role_ids.contains(&old_role.id));
        assert!(dirty.object_role_ids.contains(&new_role.id));
    }
}
