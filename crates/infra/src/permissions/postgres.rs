//! Postgres-backed permission source.
//!
//! Resolves a user's permission rows from role assignments:
//!
//! ```text
//! user_roles (user_id, role_id, business_unit_id NULL)
//!     ⋈ role_permissions (role_id, resource, can_view, can_create, can_edit, can_delete)
//! ```
//!
//! Assignments with a NULL `business_unit_id` are global and apply in every
//! scope. Rows are aggregated per resource in SQL, so each resource comes back
//! once with the union of the user's grants.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PermissionSourceError |
//! |------------|-----------------------|
//! | ColumnDecode / ColumnNotFound | `Decode` |
//! | anything else (pool, IO, database) | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use stockroom_auth::{PermissionSource, PermissionSourceError, RawPermissionRow};
use stockroom_core::{BusinessUnitId, UserId};

const PERMISSION_ROWS_SQL: &str = r#"
    SELECT
        rp.resource                AS resource,
        COALESCE(bool_or(rp.can_view),   FALSE) AS can_view,
        COALESCE(bool_or(rp.can_create), FALSE) AS can_create,
        COALESCE(bool_or(rp.can_edit),   FALSE) AS can_edit,
        COALESCE(bool_or(rp.can_delete), FALSE) AS can_delete
    FROM user_roles ur
    JOIN role_permissions rp ON rp.role_id = ur.role_id
    WHERE ur.user_id = $1
      AND (ur.business_unit_id IS NULL OR ur.business_unit_id = $2)
    GROUP BY rp.resource
    ORDER BY rp.resource
"#;

/// Permission source reading role assignments from Postgres.
///
/// `Send + Sync`; the SQLx pool handles connection management.
#[derive(Debug, Clone)]
pub struct PostgresPermissionSource {
    pool: Arc<PgPool>,
}

impl PostgresPermissionSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl PermissionSource for PostgresPermissionSource {
    #[instrument(
        skip_all,
        fields(user_id = %user_id, business_unit_id = ?business_unit_id, row_count),
        err
    )]
    async fn fetch_rows(
        &self,
        user_id: UserId,
        business_unit_id: Option<BusinessUnitId>,
    ) -> Result<Vec<RawPermissionRow>, PermissionSourceError> {
        let rows = sqlx::query(PERMISSION_ROWS_SQL)
            .bind(user_id.as_uuid())
            .bind(business_unit_id.map(uuid::Uuid::from))
            .fetch_all(&*self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawPermissionRow {
                resource: row.try_get("resource").map_err(map_sqlx_error)?,
                can_view: row.try_get("can_view").map_err(map_sqlx_error)?,
                can_create: row.try_get("can_create").map_err(map_sqlx_error)?,
                can_edit: row.try_get("can_edit").map_err(map_sqlx_error)?,
                can_delete: row.try_get("can_delete").map_err(map_sqlx_error)?,
            });
        }

        Span::current().record("row_count", out.len());
        Ok(out)
    }
}

fn map_sqlx_error(err: sqlx::Error) -> PermissionSourceError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            PermissionSourceError::Decode(err.to_string())
        }
        other => PermissionSourceError::Backend(other.to_string()),
    }
}
