//! # MessageStore
//!
//! Persistence of dead letters. [`PgMessageStore`] keeps them in a PostgreSQL table,
//! [`MemoryMessageStore`] in memory.
use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use uuid::Uuid;

use dlq_common::eventbus::{DeadLetterQueueMessage, MessageHeaders};

use crate::error::StoreError;
use crate::model::DlqRecord;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_one(&self, record: &DlqRecord) -> StoreResult<()>;

    /// Records ordered by id, skipping the first `skip`.
    async fn find_many(&self, limit: i64, skip: i64) -> StoreResult<Vec<DlqRecord>>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<DlqRecord>>;

    async fn count(&self) -> StoreResult<i64>;

    /// Returns whether a record was deleted.
    async fn delete_by_id(&self, id: Uuid) -> StoreResult<bool>;
}

#[derive(sqlx::FromRow)]
struct DlqRow {
    id: Uuid,
    channel: String,
    publisher: String,
    consumer: String,
    key: String,
    headers: Json<MessageHeaders>,
    message: String,
    caused_by: String,
    failed_consume_date: String,
}

impl From<DlqRow> for DlqRecord {
    fn from(row: DlqRow) -> Self {
        DlqRecord {
            id: row.id,
            message: DeadLetterQueueMessage {
                channel: row.channel,
                publisher: row.publisher,
                consumer: row.consumer,
                key: row.key,
                headers: row.headers.0,
                message: row.message,
                caused_by: row.caused_by,
                failed_consume_date: row.failed_consume_date,
            },
        }
    }
}

const COLUMNS: &str =
    "id, channel, publisher, consumer, key, headers, message, caused_by, failed_consume_date";

/// A MessageStore backed by a table in PostgreSQL.
pub struct PgMessageStore {
    table: String,
    pool: PgPool,
}

impl PgMessageStore {
    pub async fn new(table: &str, url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self::new_from_pool(table, pool))
    }

    pub fn new_from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn insert_one(&self, record: &DlqRecord) -> StoreResult<()> {
        let base_query = format!(
            r#"
INSERT INTO "{}"
    ({COLUMNS})
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            &self.table
        );
        let message = &record.message;

        sqlx::query(&base_query)
            .bind(record.id)
            .bind(&message.channel)
            .bind(&message.publisher)
            .bind(&message.consumer)
            .bind(&message.key)
            .bind(Json(&message.headers))
            .bind(&message.message)
            .bind(&message.caused_by)
            .bind(&message.failed_consume_date)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn find_many(&self, limit: i64, skip: i64) -> StoreResult<Vec<DlqRecord>> {
        let base_query = format!(
            r#"
SELECT {COLUMNS}
FROM "{}"
ORDER BY id
LIMIT $1
OFFSET $2
            "#,
            &self.table
        );

        let rows: Vec<DlqRow> = sqlx::query_as(&base_query)
            .bind(limit)
            .bind(skip)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(rows.into_iter().map(DlqRecord::from).collect())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<DlqRecord>> {
        let base_query = format!(r#"SELECT {COLUMNS} FROM "{}" WHERE id = $1"#, &self.table);

        let row: Option<DlqRow> = sqlx::query_as(&base_query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(row.map(DlqRecord::from))
    }

    async fn count(&self) -> StoreResult<i64> {
        let base_query = format!(r#"SELECT COUNT(*) FROM "{}""#, &self.table);

        let (count,): (i64,) = sqlx::query_as(&base_query)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "COUNT".to_owned(),
                error,
            })?;

        Ok(count)
    }

    async fn delete_by_id(&self, id: Uuid) -> StoreResult<bool> {
        let base_query = format!(r#"DELETE FROM "{}" WHERE id = $1"#, &self.table);

        let result = sqlx::query(&base_query)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() > 0)
    }
}

/// A MessageStore kept in process memory, ordered by id.
#[derive(Default)]
pub struct MemoryMessageStore {
    records: RwLock<BTreeMap<Uuid, DlqRecord>>,
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert_one(&self, record: &DlqRecord) -> StoreResult<()> {
        self.records.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn find_many(&self, limit: i64, skip: i64) -> StoreResult<Vec<DlqRecord>> {
        let skip = usize::try_from(skip).unwrap_or(0);
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .records
            .read()
            .values()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<DlqRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn count(&self) -> StoreResult<i64> {
        Ok(self.records.read().len() as i64)
    }

    async fn delete_by_id(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.records.write().remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlq_common::eventbus::ORIGIN_HEADER;

    fn record(key: &str) -> DlqRecord {
        DlqRecord::new(DeadLetterQueueMessage {
            channel: "orders".to_string(),
            publisher: "svc-a".to_string(),
            consumer: "svc-b".to_string(),
            key: key.to_string(),
            headers: [(ORIGIN_HEADER, "svc-a")].into_iter().collect(),
            message: r#"{"id":1}"#.to_string(),
            caused_by: "timeout".to_string(),
            failed_consume_date: "2024-01-01T00:00:00.000000000Z".to_string(),
        })
    }

    async fn exercise_store(store: &dyn MessageStore) {
        let first = record("k1");
        let second = record("k2");
        store.insert_one(&first).await.unwrap();
        store.insert_one(&second).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(
            store.find_many(10, 0).await.unwrap(),
            vec![first.clone(), second.clone()]
        );
        assert_eq!(store.find_many(10, 1).await.unwrap(), vec![second.clone()]);
        assert_eq!(store.find_by_id(first.id).await.unwrap(), Some(first.clone()));
        assert_eq!(store.find_by_id(Uuid::now_v7()).await.unwrap(), None);

        assert!(store.delete_by_id(first.id).await.unwrap());
        assert!(!store.delete_by_id(first.id).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise_store(&MemoryMessageStore::default()).await;
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL DATABASE_URL"]
    async fn test_pg_store(db: PgPool) {
        exercise_store(&PgMessageStore::new_from_pool("dlq_messages", db)).await;
    }
}
