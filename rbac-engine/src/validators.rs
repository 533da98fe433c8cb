use std::collections::{BTreeSet, HashMap};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::models::{ActorRef, ContentTypeId, PermissionAtom};
use crate::registry::Registry;

/// `true` when either singleton-role switch is on; global roles of any kind
/// are disallowed unless at least one is enabled.
pub fn system_roles_enabled(config: &EngineConfig) -> bool {
    config.allow_singleton_user_roles || config.allow_singleton_team_roles
}

/// Validates a candidate role-definition permission set before it is
/// created or mutated (spec §4.2). `content_type` is the role's own bound
/// type, or `None` for a global role.
pub fn validate_permissions_for_model(
    registry: &Registry,
    config: &EngineConfig,
    permissions: &BTreeSet<PermissionAtom>,
    content_type: Option<ContentTypeId>,
) -> Result<()> {
    if content_type.is_none() {
        if !system_roles_enabled(config) {
            return Err(EngineError::validation("system-wide roles are not enabled"));
        }
        if let Some(team_perm) = registry.team_permission() {
            if permissions.iter().any(|p| p.codename == team_perm) {
                return Err(EngineError::validation(format!(
                    "the {team_perm} permission can not be used in global roles"
                )));
            }
        }
    }

    let content_type_model = content_type.and_then(|ct| registry.resource_by_content_type(ct));

    // Group permissions by the model they are semantically attached to:
    // add_* attaches to its target's *parent* model; everything else
    // attaches to its own target model.
    let mut permissions_by_model: HashMap<Option<String>, Vec<&PermissionAtom>> = HashMap::new();
    for perm in permissions {
        let target_model = registry
            .resource_by_content_type(perm.content_type)
            .ok_or_else(|| EngineError::validation(format!("unknown content type for {}", perm.codename)))?;

        let role_model_name: Option<String> = if perm.is_add_permission() {
            let parent = registry.parent_of(&target_model.model_name);
            match parent {
                Some(parent_kind) => Some(parent_kind.model_name.clone()),
                None => {
                    if !system_roles_enabled(config) {
                        return Err(EngineError::validation(format!(
                            "{} permission requires system-wide roles, which are not enabled",
                            perm.codename
                        )));
                    }
                    None
                }
            }
        } else {
            Some(target_model.model_name.clone())
        };

        if let (Some(ct_model), Some(role_model_name)) = (content_type_model, role_model_name.as_ref()) {
            if role_model_name != &ct_model.model_name {
                let is_child = registry
                    .children_of(&ct_model.model_name)
                    .iter()
                    .any(|(_, kind)| &kind.model_name == role_model_name);
                if !is_child {
                    return Err(EngineError::validation(format!(
                        "{} is not valid for content type {}",
                        perm.codename, ct_model.model_name
                    )));
                }
            }
        }

        permissions_by_model.entry(role_model_name).or_default().push(perm);
    }

    // Every model mentioned must have a view_* permission present, unless it
    // is the special "global add_* with no parent" case.
    for (role_model_name, model_permissions) in &permissions_by_model {
        let has_view_or_global_add = model_permissions.iter().any(|perm| {
            perm.is_view_permission() || (role_model_name.is_none() && perm.is_add_permission())
        });
        if !has_view_or_global_add {
            let display_name = role_model_name.clone().unwrap_or_else(|| "<global>".to_string());
            let codenames: Vec<&str> = model_permissions.iter().map(|p| p.codename.as_str()).collect();
            return Err(EngineError::validation(format!(
                "permissions for model {display_name} need to include view, got: {}",
                codenames.join(", ")
            )));
        }
    }

    Ok(())
}

/// Resolves the set of codenames declared for `model_name`, mirroring the
/// source's `codenames_for_cls`.
pub fn codenames_for_model(registry: &Registry, model_name: &str) -> Result<std::collections::HashSet<String>> {
    registry
        .catalog()
        .codenames_for_model(model_name)
        .cloned()
        .ok_or_else(|| EngineError::validation(format!("model {model_name} is not registered")))
}

/// Accepts a bare action (`"change"`), a full codename (`"change_inventory"`),
/// or a dotted name (`"app.change_inventory"`) and resolves it to the
/// fully-qualified codename valid for `model_name`, also checking the
/// model's registered children (spec §4.2 rule 8).
pub fn validate_codename_for_model(registry: &Registry, codename: &str, model_name: &str) -> Result<String> {
    let valid_codenames = codenames_for_model(registry, model_name)?;

    if !codename.starts_with("add") && valid_codenames.contains(codename) {
        return Ok(codename.to_string());
    }

    let is_bare_action = !codename.is_empty() && codename.chars().all(|c| c.is_ascii_lowercase());
    let name = if is_bare_action {
        format!("{codename}_{model_name}")
    } else if let Some(dot_index) = codename.rfind('.') {
        codename[dot_index + 1..].to_string()
    } else {
        codename.to_string()
    };

    if valid_codenames.contains(&name) {
        if name.starts_with("add") {
            return Err(EngineError::validation(format!(
                "add permissions are only valid for parent models, received for {model_name}"
            )));
        }
        return Ok(name);
    }

    for (_, child) in registry.children_of(model_name) {
        if let Some(child_codenames) = registry.catalog().codenames_for_model(&child.model_name) {
            if child_codenames.contains(&name) {
                return Ok(name);
            }
        }
    }

    Err(EngineError::validation(format!(
        "the permission {name} is not valid for model {model_name}"
    )))
}

/// Gates team-actor assignments according to the three independent switches
/// in [`EngineConfig`] (spec §4.2 rule 7 / §4.3).
pub fn validate_assignment_enabled(
    registry: &Registry,
    config: &EngineConfig,
    actor: &ActorRef,
    target_model_name: &str,
    has_team_perm: bool,
) -> Result<()> {
    if config.team_team_allowed && config.team_org_allowed && config.team_org_team_allowed {
        return Ok(());
    }
    if !actor.is_team() {
        return Ok(());
    }
    let Some(team_model_name) = registry.team_model_name() else {
        return Ok(());
    };

    if !config.team_team_allowed && target_model_name == team_model_name {
        return Err(EngineError::validation("assigning team permissions to other teams is not allowed"));
    }

    if let Some(team_parent) = registry.parent_of(team_model_name) {
        if !config.team_org_allowed && target_model_name == team_parent.model_name {
            return Err(EngineError::validation(format!(
                "assigning {} permissions to teams is not allowed",
                team_parent.model_name
            )));
        }
        if !config.team_org_team_allowed && target_model_name == team_parent.model_name && has_team_perm {
            return Err(EngineError::validation(format!(
                "assigning {} permissions to teams is not allowed",
                team_parent.model_name
            )));
        }
    }

    Ok(())
}

/// General validation for making a role assignment: actor must be a user or
/// registered team, and the target's content type must match the role
/// definition's bound type.
pub fn validate_assignment(
    role_def_content_type: ContentTypeId,
    target_content_type: ContentTypeId,
) -> Result<()> {
    if role_def_content_type != target_content_type {
        return Err(EngineError::validation(format!(
            "role type {role_def_content_type} does not match object {target_content_type}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PkKind;

    fn registry_with_org_inventory() -> Registry {
        let mut registry = Registry::new();
        registry.register("organization", None, PkKind::Integer, vec![]).unwrap();
        registry
            .register("inventory", Some("organization"), PkKind::Integer, vec![])
            .unwrap();
        registry
    }

    #[test]
    fn global_role_rejected_when_singleton_roles_disabled() {
        let registry = registry_with_org_inventory();
        let config = EngineConfig::default();
        let permissions = BTreeSet::new();
        let result = validate_permissions_for_model(&registry, &config, &permissions, None);
        assert!(result.is_err());
    }

    #[test]
    fn permission_set_requires_view_for_every_model_mentioned() {
        let registry = registry_with_org_inventory();
        let config = EngineConfig::default();
        let org_ct = registry.resource("organization").unwrap().content_type_id;
        let mut permissions = BTreeSet::new();
        permissions.insert(PermissionAtom::new("change_organization", org_ct));
        let result = validate_permissions_for_model(&registry, &config, &permissions, Some(org_ct));
        assert!(result.is_err());
    }

    #[test]
    fn add_permission_attaches_to_parent_model() {
        let registry = registry_with_org_inventory();
        let config = EngineConfig::default();
        let org_ct = registry.resource("organization").unwrap().content_type_id;
        let inv_ct = registry.resource("inventory").unwrap().content_type_id;
        let mut permissions = BTreeSet::new();
        permissions.insert(PermissionAtom::new("view_organization", org_ct));
        permissions.insert(PermissionAtom::new("add_inventory", inv_ct));
        let result = validate_permissions_for_model(&registry, &config, &permissions, Some(org_ct));
        assert!(result.is_ok());
    }

    #[test]
    fn validate_codename_expands_bare_action() {
        let registry = registry_with_org_inventory();
        let resolved = validate_codename_for_model(&registry, "change", "inventory").unwrap();
        assert_eq!(resolved, "change_inventory");
    }

    #[test]
    fn validate_codename_rejects_bare_add_action() {
        let registry = registry_with_org_inventory();
        let result = validate_codename_for_model(&registry, "add", "inventory");
        assert!(result.is_err());
    }
}
