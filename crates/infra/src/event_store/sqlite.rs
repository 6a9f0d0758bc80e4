//! SQLite-backed durable storage.
//!
//! Each table is a partitioned, key-sorted item table:
//!
//! | column | type | notes |
//! |---|---|---|
//! | `partition_key` | TEXT | aggregate id |
//! | `sort_key` | INTEGER | stream version |
//! | `body` | TEXT | serialized event |
//!
//! `PRIMARY KEY (partition_key, sort_key)` is what makes the conditional put
//! conditional: a second insert of the same version fails with a unique violation.
//!
//! ## Error Mapping
//!
//! | SQLx Error | BackendError |
//! |------------|--------------|
//! | unique violation on insert | `ConditionFailed` |
//! | malformed connection URL / table name | `Invalid` |
//! | anything else (busy, I/O, pool closed) | `Unavailable` |

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::instrument;

use super::backend::{BackendError, Item, StorageBackend};

/// Durable backend on a SQLite database file.
///
/// `SqliteBackend` is `Send + Sync` and cheap to clone (it wraps a connection pool).
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if missing) the database at `url`, e.g. `sqlite://events.db`.
    ///
    /// In-memory URLs get a single long-lived connection so every query sees the
    /// same database.
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| BackendError::Invalid(format!("invalid sqlite url: {e}")))?
            .create_if_missing(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the item table if it does not exist yet.
    #[instrument(skip(self), err)]
    pub async fn create_table(&self, table: &str) -> Result<(), BackendError> {
        let table = table_ident(table)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                partition_key TEXT NOT NULL,
                sort_key INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (partition_key, sort_key)
            ) WITHOUT ROWID
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        Ok(())
    }

    /// Close the pool, waiting for connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self), err)]
    async fn query(
        &self,
        table: &str,
        partition_key: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Item>, BackendError> {
        let table = table_ident(table)?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT partition_key, sort_key, body
            FROM {table}
            WHERE partition_key = ?1 AND sort_key > ?2
            ORDER BY sort_key ASC
            LIMIT ?3
            "#
        ))
        .bind(partition_key)
        .bind(to_sql_int(after)?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("query", e))?;

        rows.iter().map(item_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn latest(&self, table: &str, partition_key: &str) -> Result<Option<Item>, BackendError> {
        let table = table_ident(table)?;

        let row = sqlx::query(&format!(
            r#"
            SELECT partition_key, sort_key, body
            FROM {table}
            WHERE partition_key = ?1
            ORDER BY sort_key DESC
            LIMIT 1
            "#
        ))
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest", e))?;

        row.as_ref().map(item_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn partitions(&self, table: &str) -> Result<Vec<String>, BackendError> {
        let table = table_ident(table)?;

        let rows = sqlx::query(&format!(
            "SELECT DISTINCT partition_key FROM {table} ORDER BY partition_key ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("partitions", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("partition_key").map_err(|e| {
                    BackendError::Unavailable(format!("failed to read partition key: {e}"))
                })
            })
            .collect()
    }

    #[instrument(skip(self, items), fields(item_count = items.len()), err)]
    async fn put_all_absent(&self, table: &str, items: Vec<Item>) -> Result<(), BackendError> {
        let table = table_ident(table)?;
        let insert = format!(
            "INSERT INTO {table} (partition_key, sort_key, body) VALUES (?1, ?2, ?3)"
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for item in items {
            let result = sqlx::query(&insert)
                .bind(&item.partition_key)
                .bind(to_sql_int(item.sort_key)?)
                .bind(&item.body)
                .execute(&mut *tx)
                .await;

            // Dropping `tx` on any early return rolls the batch back.
            if let Err(e) = result {
                if is_unique_violation(&e) {
                    return Err(BackendError::ConditionFailed {
                        partition_key: item.partition_key,
                        sort_key: item.sort_key,
                    });
                }
                return Err(map_sqlx_error("insert_item", e));
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(())
    }
}

/// Only plain identifiers can be spliced into SQL as a table name.
fn table_ident(table: &str) -> Result<&str, BackendError> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(table)
    } else {
        Err(BackendError::Invalid(format!("invalid table name '{table}'")))
    }
}

fn to_sql_int(value: u64) -> Result<i64, BackendError> {
    i64::try_from(value).map_err(|_| BackendError::Invalid(format!("sort key {value} out of range")))
}

fn item_from_row(row: &SqliteRow) -> Result<Item, BackendError> {
    let read = |e: sqlx::Error| BackendError::Unavailable(format!("failed to read item row: {e}"));

    let sort_key: i64 = row.try_get("sort_key").map_err(read)?;
    Ok(Item {
        partition_key: row.try_get("partition_key").map_err(read)?,
        sort_key: u64::try_from(sort_key)
            .map_err(|_| BackendError::Invalid(format!("negative sort key {sort_key}")))?,
        body: row.try_get("body").map_err(read)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(db_err) => BackendError::Unavailable(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            BackendError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Configuration(e) => {
            BackendError::Invalid(format!("configuration error in {operation}: {e}"))
        }
        other => BackendError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
