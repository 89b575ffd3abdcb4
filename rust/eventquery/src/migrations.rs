//! Schema-evolution helpers.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("at least one column is required")]
    NoColumns,

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
}

/// The slice of a database connection the helpers need.
#[async_trait]
pub trait SchemaEditor: Send + Sync {
    /// Names of plain btree indexes on `table` whose ordered column list is
    /// exactly `columns`. Indexes backing a constraint are excluded.
    async fn index_names(&self, table: &str, columns: &[String])
        -> Result<Vec<String>, MigrationError>;

    async fn execute(&self, statement: &str) -> Result<(), MigrationError>;
}

const INDEXES_BY_COLUMNS_SQL: &str = r#"
SELECT ic.relname::text
FROM pg_index ix
JOIN pg_class tc ON tc.oid = ix.indrelid
JOIN pg_class ic ON ic.oid = ix.indexrelid
JOIN pg_am am ON am.oid = ic.relam
WHERE tc.relname = $1
  AND am.amname = 'btree'
  AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = ix.indexrelid)
  AND ARRAY(
        SELECT a.attname::text
        FROM unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
        JOIN pg_attribute a ON a.attrelid = tc.oid AND a.attnum = k.attnum
        ORDER BY k.ord
      ) = $2::text[]
ORDER BY ic.relname
"#;

#[async_trait]
impl SchemaEditor for tokio_postgres::Client {
    async fn index_names(
        &self,
        table: &str,
        columns: &[String],
    ) -> Result<Vec<String>, MigrationError> {
        let rows = self
            .query(INDEXES_BY_COLUMNS_SQL, &[&table, &columns])
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn execute(&self, statement: &str) -> Result<(), MigrationError> {
        self.batch_execute(statement).await?;
        Ok(())
    }
}

/// Drops every index covering exactly `columns`, whatever it was named.
/// `concurrently` should stay `true` outside tests; it cannot be used
/// inside a transaction.
pub async fn drop_column_indexes(
    editor: &dyn SchemaEditor,
    table: &str,
    columns: &[&str],
    concurrently: bool,
) -> Result<Vec<String>, MigrationError> {
    if columns.is_empty() {
        return Err(MigrationError::NoColumns);
    }

    let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
    let names = editor.index_names(table, &columns).await?;
    let mode = if concurrently { "CONCURRENTLY " } else { "" };

    for name in &names {
        let statement = format!("DROP INDEX {mode}IF EXISTS {}", quote_ident(name));
        editor.execute(&statement).await?;
        info!(table, index = %name, "dropped index");
    }

    Ok(names)
}

fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}
