use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::ContentTypeId;

/// A `(codename, content_type)` pair, e.g. `(change_inventory, Inventory)`.
///
/// Codenames follow `<action>_<model-name>` shape. `add_<model-name>` is the
/// distinguished "create-child" right and is always attached, in a role
/// definition, to the child's *parent* type (see `materializer`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermissionAtom {
    pub codename: String,
    pub content_type: ContentTypeId,
}

impl PermissionAtom {
    pub fn new(codename: impl Into<String>, content_type: ContentTypeId) -> Self {
        Self {
            codename: codename.into(),
            content_type,
        }
    }

    pub fn is_add_permission(&self) -> bool {
        self.codename.starts_with("add_")
    }

    pub fn is_view_permission(&self) -> bool {
        self.codename.starts_with("view_")
    }

    pub fn is_team_membership(&self, team_permission_codename: &str) -> bool {
        self.codename == team_permission_codename
    }
}

/// Named bundle of permission atoms, optionally bound to a resource type.
///
/// Two role definitions with identical permission sets are the same
/// definition under `get_or_create` regardless of name (§3 invariant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Immutable from the API once set; only the seeding routine creates
    /// managed role definitions.
    pub managed: bool,
    /// `None` means the role is global ("singleton"): it grants its
    /// permissions irrespective of any specific object, when enabled.
    pub content_type: Option<ContentTypeId>,
    pub permissions: BTreeSet<PermissionAtom>,
}

impl RoleDefinition {
    pub fn is_global(&self) -> bool {
        self.content_type.is_none()
    }

    pub fn contains_codename(&self, codename: &str) -> bool {
        self.permissions.iter().any(|perm| perm.codename == codename)
    }
}
