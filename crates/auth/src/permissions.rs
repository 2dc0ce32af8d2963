use std::borrow::Cow;
use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use stockroom_core::DomainError;

/// Resource identifier (e.g. "stock_requests", "delivery_notes").
///
/// Resources are opaque strings at this layer. A row for the special wildcard
/// resource `"*"` applies to every resource without an explicit row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Cow<'static, str>);

impl Resource {
    pub const WILDCARD: &'static str = "*";

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == Self::WILDCARD
    }
}

impl core::fmt::Display for Resource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An action that can be performed on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    View,
    Create,
    Edit,
    Delete,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::View, Action::Create, Action::Edit, Action::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Create => "create",
            Action::Edit => "edit",
            Action::Delete => "delete",
        }
    }
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(Action::View),
            "create" => Ok(Action::Create),
            "edit" => Ok(Action::Edit),
            "delete" => Ok(Action::Delete),
            other => Err(DomainError::validation(format!("unknown action '{other}'"))),
        }
    }
}

/// One permission row as returned by the backing store.
///
/// A user holding several roles gets one row per role and resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPermissionRow {
    pub resource: String,
    #[serde(default)]
    pub can_view: bool,
    #[serde(default)]
    pub can_create: bool,
    #[serde(default)]
    pub can_edit: bool,
    #[serde(default)]
    pub can_delete: bool,
}

impl RawPermissionRow {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            can_view: false,
            can_create: false,
            can_edit: false,
            can_delete: false,
        }
    }

    /// Grant every action (test/seed helper).
    pub fn full(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            can_view: true,
            can_create: true,
            can_edit: true,
            can_delete: true,
        }
    }

    pub fn view_only(resource: impl Into<String>) -> Self {
        Self {
            can_view: true,
            ..Self::new(resource)
        }
    }
}

/// Allowed actions for a single resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePermissions {
    pub view: bool,
    pub create: bool,
    pub edit: bool,
    pub delete: bool,
}

impl ResourcePermissions {
    pub fn allows(&self, action: Action) -> bool {
        match action {
            Action::View => self.view,
            Action::Create => self.create,
            Action::Edit => self.edit,
            Action::Delete => self.delete,
        }
    }

    /// Union of two grants (a user's roles are additive).
    pub fn merge(self, other: ResourcePermissions) -> ResourcePermissions {
        ResourcePermissions {
            view: self.view || other.view,
            create: self.create || other.create,
            edit: self.edit || other.edit,
            delete: self.delete || other.delete,
        }
    }
}

impl From<&RawPermissionRow> for ResourcePermissions {
    fn from(row: &RawPermissionRow) -> Self {
        Self {
            view: row.can_view,
            create: row.can_create,
            edit: row.can_edit,
            delete: row.can_delete,
        }
    }
}

/// Per-resource map of allowed actions for one user in one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionMatrix(HashMap<Resource, ResourcePermissions>);

impl PermissionMatrix {
    /// Build a matrix from raw rows, OR-merging duplicate resources.
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a RawPermissionRow>) -> Self {
        let mut map: HashMap<Resource, ResourcePermissions> = HashMap::new();
        for row in rows {
            let grant = ResourcePermissions::from(row);
            map.entry(Resource::new(row.resource.clone()))
                .and_modify(|existing| *existing = existing.merge(grant))
                .or_insert(grant);
        }
        Self(map)
    }

    /// Effective grant for `resource`, falling back to the wildcard row.
    pub fn get(&self, resource: &Resource) -> Option<&ResourcePermissions> {
        self.0
            .get(resource)
            .or_else(|| self.0.get(&Resource::new(Resource::WILDCARD)))
    }

    pub fn allows(&self, resource: &Resource, action: Action) -> bool {
        self.get(resource).is_some_and(|p| p.allows(action))
    }

    /// Resources with an explicit row, sorted for stable output.
    pub fn resources(&self) -> Vec<&Resource> {
        let mut out: Vec<&Resource> = self.0.keys().collect();
        out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        out
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_for_same_resource_are_merged() {
        let rows = vec![
            RawPermissionRow::view_only("stock_requests"),
            RawPermissionRow {
                can_edit: true,
                ..RawPermissionRow::new("stock_requests")
            },
        ];

        let matrix = PermissionMatrix::from_rows(&rows);
        let resource = Resource::new("stock_requests");

        assert_eq!(matrix.len(), 1);
        assert!(matrix.allows(&resource, Action::View));
        assert!(matrix.allows(&resource, Action::Edit));
        assert!(!matrix.allows(&resource, Action::Create));
        assert!(!matrix.allows(&resource, Action::Delete));
    }

    #[test]
    fn wildcard_row_covers_missing_resources_only() {
        let rows = vec![
            RawPermissionRow::view_only("*"),
            RawPermissionRow::new("commissions"),
        ];
        let matrix = PermissionMatrix::from_rows(&rows);

        assert!(matrix.allows(&Resource::new("delivery_notes"), Action::View));
        assert!(!matrix.allows(&Resource::new("delivery_notes"), Action::Delete));
        // Explicit row wins over the wildcard.
        assert!(!matrix.allows(&Resource::new("commissions"), Action::View));
    }

    #[test]
    fn unknown_resource_is_denied() {
        let matrix = PermissionMatrix::from_rows(&[RawPermissionRow::full("pos_sales")]);
        assert!(!matrix.allows(&Resource::new("purchase_orders"), Action::View));
    }

    #[test]
    fn action_parses_lowercase_names() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("approve".parse::<Action>().is_err());
    }

    #[test]
    fn raw_row_defaults_missing_flags_to_false() {
        let row: RawPermissionRow =
            serde_json::from_str(r#"{"resource":"inventory","can_view":true}"#).unwrap();
        assert_eq!(row, RawPermissionRow::view_only("inventory"));
    }
}
