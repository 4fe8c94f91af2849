use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use super::{DocumentStore, Namespace, RawDocument, Selector, StoreError};

/// SQLite-backed document store.
///
/// Every `(namespace, table)` pair is its own physical table:
/// ```sql
/// CREATE TABLE IF NOT EXISTS {namespace}__{table} (
///     id         TEXT    PRIMARY KEY,
///     rev        INTEGER NOT NULL,
///     body       TEXT    NOT NULL,   -- JSON document
///     updated_at TEXT    NOT NULL
/// );
/// ```
#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a file database. Accepts both
    /// `sqlite:./foo.db` and plain paths.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let file_path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        let path = std::path::Path::new(file_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Database(format!("create data directory: {e}")))?;
        }

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
        )
        .await?;
        Ok(Self::new(pool))
    }

    /// In-memory database on a single pinned connection (tests).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn exists(&self, table: &str, id: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(&format!("SELECT rev FROM {table} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

/// Table and field names are spliced into SQL, so only `[a-z0-9_]` passes.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn physical_table(ns: Namespace, table: &str) -> Result<String, StoreError> {
    if !is_safe_name(table) {
        return Err(StoreError::InvalidTable(table.to_string()));
    }
    Ok(format!("{}__{}", ns.as_str(), table))
}

/// `json_extract` expression for a top-level field. Index and query must
/// spell it identically for SQLite to use the index.
fn field_expr(field: &str) -> Result<String, StoreError> {
    if !is_safe_name(field) {
        return Err(StoreError::InvalidField(field.to_string()));
    }
    Ok(format!("json_extract(body, '$.{field}')"))
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn ensure_table(&self, ns: Namespace, table: &str) -> Result<(), StoreError> {
        let table = physical_table(ns, table)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id         TEXT    PRIMARY KEY,
                rev        INTEGER NOT NULL,
                body       TEXT    NOT NULL,
                updated_at TEXT    NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;
        tracing::debug!(table = %table, "Ensured document table");
        Ok(())
    }

    async fn ensure_index(&self, ns: Namespace, table: &str, field: &str) -> Result<(), StoreError> {
        let table = physical_table(ns, table)?;
        let expr = field_expr(field)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}__{field}_idx ON {table} ({expr})"
        ))
        .execute(&self.pool)
        .await?;
        tracing::debug!(table = %table, field, "Ensured field index");
        Ok(())
    }

    async fn create(
        &self,
        ns: Namespace,
        table: &str,
        id: &str,
        body: serde_json::Value,
    ) -> Result<i64, StoreError> {
        let table = physical_table(ns, table)?;
        let body = serde_json::to_string(&body)?;

        let rows = sqlx::query(&format!(
            "INSERT OR IGNORE INTO {table} (id, rev, body, updated_at) VALUES (?, 1, ?, ?)"
        ))
        .bind(id)
        .bind(&body)
        .bind(now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(StoreError::AlreadyExists(format!("{table}/{id}")));
        }
        Ok(1)
    }

    async fn get(&self, ns: Namespace, table: &str, id: &str) -> Result<RawDocument, StoreError> {
        let table = physical_table(ns, table)?;
        let row: Option<(String, i64, String)> =
            sqlx::query_as(&format!("SELECT id, rev, body FROM {table} WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            None => Err(StoreError::NotFound(format!("{table}/{id}"))),
            Some((id, rev, body)) => Ok(RawDocument {
                id,
                rev,
                body: serde_json::from_str(&body)?,
            }),
        }
    }

    async fn update(
        &self,
        ns: Namespace,
        table: &str,
        id: &str,
        rev: i64,
        body: serde_json::Value,
    ) -> Result<i64, StoreError> {
        let table = physical_table(ns, table)?;
        let body = serde_json::to_string(&body)?;

        let rows = sqlx::query(&format!(
            "UPDATE {table} SET rev = rev + 1, body = ?, updated_at = ? WHERE id = ? AND rev = ?"
        ))
        .bind(&body)
        .bind(now())
        .bind(id)
        .bind(rev)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return if self.exists(&table, id).await? {
                Err(StoreError::Conflict(format!("{table}/{id} at rev {rev}")))
            } else {
                Err(StoreError::NotFound(format!("{table}/{id}")))
            };
        }
        Ok(rev + 1)
    }

    async fn delete(
        &self,
        ns: Namespace,
        table: &str,
        id: &str,
        rev: i64,
    ) -> Result<(), StoreError> {
        let table = physical_table(ns, table)?;
        let rows = sqlx::query(&format!("DELETE FROM {table} WHERE id = ? AND rev = ?"))
            .bind(id)
            .bind(rev)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return if self.exists(&table, id).await? {
                Err(StoreError::Conflict(format!("{table}/{id} at rev {rev}")))
            } else {
                Err(StoreError::NotFound(format!("{table}/{id}")))
            };
        }
        Ok(())
    }

    async fn find(
        &self,
        ns: Namespace,
        table: &str,
        selector: &Selector,
    ) -> Result<Vec<RawDocument>, StoreError> {
        let table = physical_table(ns, table)?;

        let mut sql = format!("SELECT id, rev, body FROM {table}");
        for (index, (field, _)) in selector.fields().iter().enumerate() {
            sql.push_str(if index == 0 { " WHERE " } else { " AND " });
            sql.push_str(&field_expr(field)?);
            sql.push_str(" = json_extract(?, '$')");
        }
        sql.push_str(" ORDER BY id ASC");

        let mut query = sqlx::query_as::<_, (String, i64, String)>(&sql);
        for (_, value) in selector.fields() {
            query = query.bind(serde_json::to_string(value)?);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|(id, rev, body)| {
                Ok(RawDocument {
                    id,
                    rev,
                    body: serde_json::from_str(&body)?,
                })
            })
            .collect()
    }
}
