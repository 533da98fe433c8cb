use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::models::RoleDefinition;
use crate::registry::Registry;
use crate::store::StoreTransaction;
use crate::validators;
use uuid::Uuid;

/// One-shot startup routine: precreates the `managed` role definitions
/// named in [`EngineConfig::role_precreate`] (spec §6 `role_precreate`,
/// §4.2 "managed is immutable from the API"). Idempotent: re-running with
/// the same templates against an already-seeded store changes nothing.
pub async fn seed_managed_roles(tx: &mut dyn StoreTransaction, registry: &Registry, config: &EngineConfig) -> Result<()> {
    for template in &config.role_precreate {
        let content_type = match &template.content_type {
            Some(model_name) => Some(
                registry
                    .resource(model_name)
                    .ok_or_else(|| EngineError::configuration(format!("role_precreate template '{}' names unregistered model '{model_name}'", template.name)))?
                    .content_type_id,
            ),
            None => None,
        };

        let mut permissions = BTreeSet::new();
        for codename in &template.permissions {
            match registry.resolve_permission(codename) {
                Some(atom) => {
                    permissions.insert(atom);
                }
                None => {
                    warn!("role_precreate template '{}' names unknown permission '{codename}', skipping it", template.name);
                }
            }
        }

        if let Err(err) = validators::validate_permissions_for_model(registry, config, &permissions, content_type) {
            warn!("role_precreate template '{}' failed validation, skipping: {err}", template.name);
            continue;
        }

        if let Some(existing) = tx.find_role_definition_by_name(&template.name).await? {
            if existing.permissions != permissions {
                warn!(
                    "role_precreate template '{}' already exists with a different permission set; leaving it unchanged",
                    template.name
                );
            }
            continue;
        }

        tx.insert_role_definition(RoleDefinition {
            id: Uuid::new_v4(),
            name: template.name.clone(),
            description: "seeded by role_precreate".to_string(),
            managed: true,
            content_type,
            permissions,
        })
        .await?;
        info!("seeded managed role definition '{}'", template.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RolePrecreateTemplate;
    use crate::models::PkKind;
    use crate::store::{MemoryStore, Store};

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register("organization", None, PkKind::Integer, vec![]).unwrap();
        registry
    }

    #[tokio::test]
    async fn seeds_a_managed_role_from_a_template() {
        let registry = registry();
        let mut config = EngineConfig::default();
        config.role_precreate.push(RolePrecreateTemplate {
            name: "organization-admin".to_string(),
            content_type: Some("organization".to_string()),
            permissions: vec!["view_organization".to_string(), "change_organization".to_string()],
        });

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        seed_managed_roles(tx.as_mut(), &registry, &config).await.unwrap();

        let role = tx.find_role_definition_by_name("organization-admin").await.unwrap().unwrap();
        assert!(role.managed);
        assert_eq!(role.permissions.len(), 2);
    }

    #[tokio::test]
    async fn seeding_twice_is_idempotent() {
        let registry = registry();
        let mut config = EngineConfig::default();
        config.role_precreate.push(RolePrecreateTemplate {
            name: "organization-admin".to_string(),
            content_type: Some("organization".to_string()),
            permissions: vec!["view_organization".to_string()],
        });

        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        seed_managed_roles(tx.as_mut(), &registry, &config).await.unwrap();
        let first = tx.find_role_definition_by_name("organization-admin").await.unwrap().unwrap();

        seed_managed_roles(tx.as_mut(), &registry, &config).await.unwrap();
        let second = tx.find_role_definition_by_name("organization-admin").await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
    }
}
