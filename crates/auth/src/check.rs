use serde::Serialize;

use crate::{Action, PermissionMatrix, Resource};

/// Outcome of a single permission check.
///
/// `reason` is set whenever access is denied, including when the permission
/// fetch failed. Callers treat `allowed == false` as a deny in every case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionCheckResult {
    pub allowed: bool,
    pub resource: Resource,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionCheckResult {
    pub fn allowed(resource: Resource, action: Action) -> Self {
        Self {
            allowed: true,
            resource,
            action,
            reason: None,
        }
    }

    pub fn denied(resource: Resource, action: Action, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            resource,
            action,
            reason: Some(reason.into()),
        }
    }

    /// Evaluate `(resource, action)` against a resolved matrix. No IO.
    pub fn evaluate(matrix: &PermissionMatrix, resource: &Resource, action: Action) -> Self {
        match matrix.get(resource) {
            Some(grant) if grant.allows(action) => Self::allowed(resource.clone(), action),
            Some(_) => Self::denied(
                resource.clone(),
                action,
                format!("missing '{action}' permission on '{resource}'"),
            ),
            None => Self::denied(
                resource.clone(),
                action,
                format!("no permissions granted on '{resource}'"),
            ),
        }
    }
}
