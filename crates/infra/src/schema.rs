//! Database schema for permissions and change notifications.
//!
//! Idempotent: every statement uses `IF NOT EXISTS` / `CREATE OR REPLACE`.

use sqlx::PgPool;
use tracing::info;

use crate::change_feed::notify_channel;

const PERMISSION_TABLES_SQL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS role_permissions (
        role_id     UUID    NOT NULL,
        resource    TEXT    NOT NULL,
        can_view    BOOLEAN NOT NULL DEFAULT FALSE,
        can_create  BOOLEAN NOT NULL DEFAULT FALSE,
        can_edit    BOOLEAN NOT NULL DEFAULT FALSE,
        can_delete  BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (role_id, resource)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_roles (
        user_id          UUID NOT NULL,
        role_id          UUID NOT NULL,
        business_unit_id UUID NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS user_roles_assignment_idx
        ON user_roles (user_id, role_id, COALESCE(business_unit_id, '00000000-0000-0000-0000-000000000000'::uuid))
    "#,
];

/// Trigger function publishing row changes as JSON on `<schema>_changes`.
const NOTIFY_FUNCTION_SQL: &str = r#"
    CREATE OR REPLACE FUNCTION stockroom_notify_change() RETURNS trigger AS $$
    DECLARE
        row_data JSONB;
    BEGIN
        IF TG_OP = 'DELETE' THEN
            row_data := to_jsonb(OLD);
        ELSE
            row_data := to_jsonb(NEW);
        END IF;

        PERFORM pg_notify(
            TG_TABLE_SCHEMA || '_changes',
            json_build_object(
                'schema', TG_TABLE_SCHEMA,
                'table',  TG_TABLE_NAME,
                'type',   TG_OP,
                'record', row_data
            )::text
        );
        RETURN NULL;
    END;
    $$ LANGUAGE plpgsql
"#;

/// Create the permission tables if missing.
pub async fn ensure_permission_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for stmt in PERMISSION_TABLES_SQL {
        sqlx::query(stmt).execute(pool).await?;
    }
    info!("permission schema ensured");
    Ok(())
}

/// Install the change-notification trigger on `schema.table`.
///
/// `schema` and `table` are quoted as identifiers.
pub async fn install_change_trigger(pool: &PgPool, schema: &str, table: &str) -> Result<(), sqlx::Error> {
    sqlx::query(NOTIFY_FUNCTION_SQL).execute(pool).await?;

    let target = format!("{}.{}", quote_ident(schema), quote_ident(table));
    let trigger = quote_ident(&format!("{table}_stockroom_notify"));

    sqlx::query(&format!("DROP TRIGGER IF EXISTS {trigger} ON {target}"))
        .execute(pool)
        .await?;
    sqlx::query(&format!(
        "CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {target} \
         FOR EACH ROW EXECUTE FUNCTION stockroom_notify_change()"
    ))
    .execute(pool)
    .await?;

    info!(schema, table, pg_channel = %notify_channel(schema), "change trigger installed");
    Ok(())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_ident("stock_items"), "\"stock_items\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn trigger_channel_matches_listener_channel() {
        // The trigger derives its channel as TG_TABLE_SCHEMA || '_changes'.
        assert!(NOTIFY_FUNCTION_SQL.contains("TG_TABLE_SCHEMA || '_changes'"));
        assert_eq!(notify_channel("public"), format!("{}_changes", "public"));
    }
}
