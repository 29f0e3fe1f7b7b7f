use std::collections::BTreeSet;

use async_trait::async_trait;
use icms_core::{IcmsRecord, AMOUNT_COLUMNS};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{LoadTransaction, RecordStore, StoreError};

/// Rows per INSERT statement; keeps bind parameters under the protocol limit.
const MAX_ROWS_PER_STATEMENT: usize = 400;

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn existing_periods(&self) -> Result<BTreeSet<String>, StoreError> {
        let periods: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT periodo FROM icms ORDER BY periodo")
                .fetch_all(&self.pool)
                .await?;
        Ok(periods.into_iter().collect())
    }

    async fn begin(&self) -> Result<Box<dyn LoadTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLoadTransaction {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

/// Statements from concurrent batches are serialized on the transaction's
/// single connection.
struct PgLoadTransaction {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PgLoadTransaction {
    async fn take(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.tx.lock().await.take().ok_or(StoreError::TransactionClosed)
    }
}

fn insert_statement(records: &[IcmsRecord]) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("INSERT INTO icms (id, id_uf, uf, periodo, ano, mes, ");
    builder.push(AMOUNT_COLUMNS.join(", "));
    builder.push(", extra_amounts) ");
    builder.push_values(records, |mut row, record| {
        row.push_bind(Uuid::new_v4())
            .push_bind(record.region_id)
            .push_bind(record.region.clone())
            .push_bind(record.period.clone())
            .push_bind(record.year)
            .push_bind(record.month);
        for column in AMOUNT_COLUMNS {
            row.push_bind(record.amount(column));
        }
        row.push_bind(Json(record.extra_amounts()));
    });
    builder
}

#[async_trait]
impl LoadTransaction for PgLoadTransaction {
    async fn clear_all(&self) -> Result<u64, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        let result = sqlx::query("DELETE FROM icms").execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn insert_batch(&self, batch_index: usize, records: &[IcmsRecord]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for chunk in records.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder = insert_statement(chunk);
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
            let result = builder.build().execute(&mut **tx).await?;
            inserted += result.rows_affected();
        }
        debug!(batch_index, inserted, "batch inserted");
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.take().await?.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.take().await?.rollback().await?;
        Ok(())
    }
}
