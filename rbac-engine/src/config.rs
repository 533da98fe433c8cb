use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// RBAC policy options, loaded independently of [`rbac_shared::SharedConfig`]
/// so a host can tune how permissions behave without touching database or
/// logging settings. Field names are the engine's own vocabulary rather than
/// the source project's `ANSIBLE_BASE_*` environment variable names.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    /// Enables assigning role definitions with `content_type = null` to users.
    pub allow_singleton_user_roles: bool,
    /// Enables assigning role definitions with `content_type = null` to teams.
    pub allow_singleton_team_roles: bool,
    /// User-attribute names that short-circuit every permission check when set.
    pub bypass_superuser_flags: HashSet<String>,
    /// Maps a bare action name (e.g. `"change"`) to a user-attribute name
    /// that short-circuits checks for codenames starting with that action.
    #[serde(default)]
    pub bypass_action_flags: HashMap<String, String>,
    /// Actions granted to the creator of a new resource by `give_creator_permissions`.
    pub creator_defaults: Vec<String>,
    /// Also emit a parent-level evaluation tuple for child-type permissions.
    pub cache_parent_permissions: bool,
    /// Allow assigning team roles to other teams.
    pub team_team_allowed: bool,
    /// Allow assigning organization-scoped roles to teams.
    pub team_org_allowed: bool,
    /// Allow assigning organization-scoped roles that themselves carry team
    /// membership to teams (a stricter sub-case of `team_org_allowed`).
    pub team_org_team_allowed: bool,
    /// Templates for managed role definitions precreated at startup.
    #[serde(default)]
    pub role_precreate: Vec<RolePrecreateTemplate>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RolePrecreateTemplate {
    pub name: String,
    pub content_type: Option<String>,
    pub permissions: Vec<String>,
}

impl EngineConfig {
    /// Loads from compiled-in defaults, an optional `config/rbac_policy.toml`
    /// file, then environment variables prefixed `RBAC_POLICY__`.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("allow_singleton_user_roles", false)?
            .set_default("allow_singleton_team_roles", false)?
            .set_default("bypass_superuser_flags", Vec::<String>::new())?
            .set_default("creator_defaults", vec!["change", "delete", "view"])?
            .set_default("cache_parent_permissions", false)?
            .set_default("team_team_allowed", true)?
            .set_default("team_org_allowed", true)?
            .set_default("team_org_team_allowed", true)?
            .add_source(File::with_name("config/rbac_policy").required(false))
            .add_source(Environment::with_prefix("RBAC_POLICY").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        for template in &self.role_precreate {
            if template.permissions.is_empty() {
                return Err(format!(
                    "role_precreate template '{}' has no permissions",
                    template.name
                ));
            }
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_singleton_user_roles: false,
            allow_singleton_team_roles: false,
            bypass_superuser_flags: HashSet::from(["is_superuser".to_string()]),
            bypass_action_flags: HashMap::new(),
            creator_defaults: vec!["change".to_string(), "delete".to_string(), "view".to_string()],
            cache_parent_permissions: false,
            team_team_allowed: true,
            team_org_allowed: true,
            team_org_team_allowed: true,
            role_precreate: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_disables_singleton_roles() {
        let config = EngineConfig::default();
        assert!(!config.allow_singleton_user_roles);
        assert!(!config.allow_singleton_team_roles);
    }

    #[test]
    fn validate_rejects_empty_precreate_template() {
        let mut config = EngineConfig::default();
        config.role_precreate.push(RolePrecreateTemplate {
            name: "broken".to_string(),
            content_type: None,
            permissions: Vec::new(),
        });
        assert!(config.validate().is_err());
    }
}
