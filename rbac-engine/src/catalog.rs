use std::collections::{HashMap, HashSet};

use crate::models::ContentTypeId;

/// The default action codenames every registered model gets, mirroring the
/// source project's `_meta.default_permissions` (`add`, `change`, `delete`,
/// `view`) before any model-declared extras are layered on.
pub const DEFAULT_ACTIONS: &[&str] = &["add", "change", "delete", "view"];

/// Read-only-after-setup set of `(codename, content_type)` atoms.
///
/// Populated by the registry as each model is registered; the engine never
/// invents a codename that was not declared here.
#[derive(Debug, Default, Clone)]
pub struct PermissionCatalog {
    /// model_name -> full set of codenames valid for that model.
    codenames_by_model: HashMap<String, HashSet<String>>,
    content_type_by_model: HashMap<String, ContentTypeId>,
}

impl PermissionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the default `add_/change_/delete_/view_` codenames plus any
    /// model-declared extras (e.g. `execute_jobtemplate`, `member_team`) for
    /// `model_name`.
    pub fn register_model(
        &mut self,
        model_name: &str,
        content_type: ContentTypeId,
        extra_codenames: impl IntoIterator<Item = String>,
    ) {
        let mut codenames: HashSet<String> = DEFAULT_ACTIONS
            .iter()
            .map(|action| format!("{action}_{model_name}"))
            .collect();
        codenames.extend(extra_codenames);
        self.codenames_by_model.insert(model_name.to_string(), codenames);
        self.content_type_by_model.insert(model_name.to_string(), content_type);
    }

    pub fn codenames_for_model(&self, model_name: &str) -> Option<&HashSet<String>> {
        self.codenames_by_model.get(model_name)
    }

    pub fn content_type_of(&self, model_name: &str) -> Option<ContentTypeId> {
        self.content_type_by_model.get(model_name).copied()
    }

    pub fn model_for_content_type(&self, content_type: ContentTypeId) -> Option<&str> {
        self.content_type_by_model
            .iter()
            .find(|(_, &ct)| ct == content_type)
            .map(|(name, _)| name.as_str())
    }

    pub fn is_known_codename(&self, model_name: &str, codename: &str) -> bool {
        self.codenames_by_model
            .get(model_name)
            .map(|set| set.contains(codename))
            .unwrap_or(false)
    }
}

/// `add_<model>` denotes a create-child right and is handled specially by
/// the materializer and validators.
pub fn is_add_permission(codename: &str) -> bool {
    codename.starts_with("add_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_model_includes_default_actions() {
        let mut catalog = PermissionCatalog::new();
        catalog.register_model("inventory", ContentTypeId(1), std::iter::empty());
        let codenames = catalog.codenames_for_model("inventory").unwrap();
        assert!(codenames.contains("view_inventory"));
        assert!(codenames.contains("add_inventory"));
        assert!(codenames.contains("change_inventory"));
        assert!(codenames.contains("delete_inventory"));
    }

    #[test]
    fn register_model_includes_extra_codenames() {
        let mut catalog = PermissionCatalog::new();
        catalog.register_model(
            "team",
            ContentTypeId(2),
            vec!["member_team".to_string()],
        );
        assert!(catalog.is_known_codename("team", "member_team"));
    }

    #[test]
    fn is_add_permission_matches_prefix() {
        assert!(is_add_permission("add_inventory"));
        assert!(!is_add_permission("change_inventory"));
    }
}
