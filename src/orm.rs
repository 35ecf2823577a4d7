use sea_orm::{ConnectionTrait, DbConn, DbErr};
use tracing::{info, instrument};

#[allow(warnings, clippy::all)]
pub(crate) mod short_url {
    use sea_orm::entity::prelude::*;

    #[sea_orm::model]
    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "urls")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub short_code: String,
        pub original_url: String,
        pub created_at: TimeDateTimeWithTimeZone,
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// The primary key on `short_code` is the unique constraint that arbitrates allocation races.
const CREATE_URLS_TABLE: &str = "CREATE TABLE IF NOT EXISTS urls (
    short_code VARCHAR(64) PRIMARY KEY,
    original_url TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)";

const CREATE_ORIGINAL_URL_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_urls_original_url ON urls (original_url)";

/// Idempotently creates the `urls` table and its lookup index.
///
/// # Errors
/// Will return [`Err`] if either DDL statement fails.
#[instrument(skip(db))]
pub async fn ensure_schema(db: &DbConn) -> Result<(), DbErr> {
    db.execute_unprepared(CREATE_URLS_TABLE).await?;
    db.execute_unprepared(CREATE_ORIGINAL_URL_INDEX).await?;
    info!("Schema for urls table is in place");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    use super::*;

    #[tokio::test]
    async fn test_ensure_schema_runs_both_statements() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                },
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                },
            ])
            .into_connection();

        ensure_schema(&db).await.unwrap();

        let log = db.into_transaction_log();
        assert_eq!(log.len(), 2);
    }
}
