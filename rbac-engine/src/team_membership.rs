use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::Result;
use crate::registry::Registry;
use crate::store::StoreTransaction;

/// Recursive ancestor walk over the team-team membership graph built by
/// [`compute_team_member_roles`]. `seen` prevents infinite recursion on a
/// cycle (`A -> B -> C -> A`); termination is bounded by the team count.
fn all_team_parents(team_id: Uuid, team_team_parents: &HashMap<Uuid, Vec<Uuid>>, seen: &mut HashSet<Uuid>) -> HashSet<Uuid> {
    let mut parents = HashSet::new();
    let Some(candidates) = team_team_parents.get(&team_id) else {
        return parents;
    };
    for &parent_id in candidates {
        if seen.contains(&parent_id) {
            continue;
        }
        parents.insert(parent_id);
        seen.insert(parent_id);
        parents.extend(all_team_parents(parent_id, team_team_parents, seen));
    }
    parents
}

/// Recomputes `ObjectRole.provides_teams` for every team in the system
/// (spec §4.5, grounded on `caching.py::compute_team_member_roles`).
///
/// This always runs globally rather than incrementally: the transitive
/// closure over an arbitrary team graph is cheap at the scale this engine
/// targets, and recomputing narrowly invites the exact staleness bugs a
/// cache is supposed to avoid.
pub async fn compute_team_member_roles(tx: &mut dyn StoreTransaction, registry: &Registry) -> Result<()> {
    let Some(team_permission) = registry.team_permission() else {
        return Ok(());
    };
    let Some(team_model) = registry.team_model_name() else {
        return Ok(());
    };
    let team_ct = registry.resource(team_model).map(|r| r.content_type_id);
    let org_model = registry.parent_of(team_model).map(|r| r.model_name.clone());
    let org_ct = org_model.as_deref().and_then(|m| registry.resource(m)).map(|r| r.content_type_id);

    let object_role_ids = tx.object_roles_with_codename(&team_permission).await?;

    // direct_member_roles[team_id] = object role ids that, directly (one
    // hop), grant membership in team_id.
    let mut direct_member_roles: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    // team_team_parents[team_id] = actor teams that hold, as a team actor, an
    // object role targeting team_id with the team-membership permission.
    let mut team_team_parents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

    for object_role_id in &object_role_ids {
        let object_role = tx.get_object_role(*object_role_id).await?;

        if Some(object_role.content_type) == team_ct {
            let ObjectIdAsTeam(team_id) = match object_role.object_id.try_into() {
                Ok(id) => id,
                Err(_) => continue,
            };
            direct_member_roles.entry(team_id).or_default().push(*object_role_id);
            for actor_team in &object_role.teams {
                team_team_parents.entry(team_id).or_default().push(*actor_team);
            }
        } else if org_ct.is_some() && Some(object_role.content_type) == org_ct {
            for team_id in tx.teams_with_parent(object_role.object_id).await? {
                direct_member_roles.entry(team_id).or_default().push(*object_role_id);
                for actor_team in &object_role.teams {
                    team_team_parents.entry(team_id).or_default().push(*actor_team);
                }
            }
        } else {
            tracing::warn!(
                "object role {object_role_id} grants team membership via an unsupported content type, skipping"
            );
        }
    }

    let mut all_member_roles: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
    for (&team_id, member_roles) in &direct_member_roles {
        let mut set: HashSet<Uuid> = member_roles.iter().copied().collect();
        let mut seen = HashSet::new();
        for parent_team_id in all_team_parents(team_id, &team_team_parents, &mut seen) {
            if let Some(parent_roles) = direct_member_roles.get(&parent_team_id) {
                set.extend(parent_roles.iter().copied());
            }
        }
        all_member_roles.insert(team_id, set);
    }

    // Invert: all_member_roles[team] -> object_role.provides_teams.
    let mut provides_by_object_role: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
    for (&team_id, roles) in &all_member_roles {
        for &object_role_id in roles {
            provides_by_object_role.entry(object_role_id).or_default().insert(team_id);
        }
    }

    for object_role_id in &object_role_ids {
        let teams = provides_by_object_role.remove(object_role_id).unwrap_or_default();
        tx.set_provides_teams(*object_role_id, teams).await?;
    }

    Ok(())
}

/// `ObjectId` is either an integer or a UUID; team ids in this engine are
/// always UUIDs (§2 "User model" / `ActorRef`), so a team/org target's id is
/// always the UUID variant. This is a narrow, local conversion rather than a
/// general `ObjectId -> Uuid` API since nothing else in the crate needs it.
struct ObjectIdAsTeam(Uuid);

impl TryFrom<crate::models::ObjectId> for ObjectIdAsTeam {
    type Error = ();

    fn try_from(value: crate::models::ObjectId) -> std::result::Result<Self, Self::Error> {
        match value {
            crate::models::ObjectId::Uuid(id) => Ok(ObjectIdAsTeam(id)),
            crate::models::ObjectId::Integer(_) => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObjectId, PermissionAtom, PkKind, RoleDefinition};
    use crate::store::{MemoryStore, Store};
    use std::collections::BTreeSet;

    fn team_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register("organization", None, PkKind::Integer, vec![]).unwrap();
        registry.register_team_model("team", Some("organization"), PkKind::Uuid).unwrap();
        registry
    }

    async fn insert_member_role_definition(tx: &mut dyn StoreTransaction, registry: &Registry) -> Uuid {
        let team_ct = registry.resource("team").unwrap().content_type_id;
        let id = Uuid::new_v4();
        tx.insert_role_definition(RoleDefinition {
            id,
            name: "team-member".to_string(),
            description: String::new(),
            managed: false,
            content_type: Some(team_ct),
            permissions: BTreeSet::from([PermissionAtom::new("member_team", team_ct)]),
        })
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn five_nested_teams_propagate_membership_through_the_chain() {
        let registry = team_registry();
        let team_ct = registry.resource("team").unwrap().content_type_id;
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let rd_id = insert_member_role_definition(tx.as_mut(), &registry).await;

        let teams: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        // t_i is a member of t_{i+1} for i in 0..4.
        let mut object_role_ids = Vec::new();
        for i in 0..4 {
            let (role, _) = tx.find_or_create_object_role(rd_id, team_ct, ObjectId::Uuid(teams[i + 1])).await.unwrap();
            tx.add_team_assignment(role.id, teams[i], rd_id, None).await.unwrap();
            object_role_ids.push(role.id);
        }

        let rando = Uuid::new_v4();
        let (member_role, _) = tx.find_or_create_object_role(rd_id, team_ct, ObjectId::Uuid(teams[0])).await.unwrap();
        tx.add_user_assignment(member_role.id, rando, rd_id, None).await.unwrap();

        compute_team_member_roles(tx.as_mut(), &registry).await.unwrap();

        let final_role = tx.get_object_role(member_role.id).await.unwrap();
        assert_eq!(final_role.provides_teams, teams.iter().copied().collect::<HashSet<_>>());
    }

    #[tokio::test]
    async fn cycle_in_team_graph_does_not_hang() {
        let registry = team_registry();
        let team_ct = registry.resource("team").unwrap().content_type_id;
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let rd_id = insert_member_role_definition(tx.as_mut(), &registry).await;

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let (role_ab, _) = tx.find_or_create_object_role(rd_id, team_ct, ObjectId::Uuid(b)).await.unwrap();
        tx.add_team_assignment(role_ab.id, a, rd_id, None).await.unwrap();
        let (role_bc, _) = tx.find_or_create_object_role(rd_id, team_ct, ObjectId::Uuid(c)).await.unwrap();
        tx.add_team_assignment(role_bc.id, b, rd_id, None).await.unwrap();
        let (role_ca, _) = tx.find_or_create_object_role(rd_id, team_ct, ObjectId::Uuid(a)).await.unwrap();
        tx.add_team_assignment(role_ca.id, c, rd_id, None).await.unwrap();

        let rando = Uuid::new_v4();
        let (member_role, _) = tx.find_or_create_object_role(rd_id, team_ct, ObjectId::Uuid(a)).await.unwrap();
        tx.add_user_assignment(member_role.id, rando, rd_id, None).await.unwrap();

        compute_team_member_roles(tx.as_mut(), &registry).await.unwrap();

        let final_role = tx.get_object_role(member_role.id).await.unwrap();
        assert_eq!(final_role.provides_teams, HashSet::from([a, b, c]));
    }
}
