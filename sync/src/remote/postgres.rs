//! PostgreSQL-backed remote store.
//!
//! Both collections live in plain tables keyed by `(app_id, id)`. A trigger
//! publishes `"{table}:{app_id}"` on the `tally_changes` channel after every
//! change and the watch streams answer each notification with a fresh
//! full-collection query.

use super::{check_batch, Collection, RemoteError, RemoteStore, SnapshotStream, Write};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use rust_decimal::Decimal;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tally_engine::{Clearance, Month, PaymentRecord, RecordId, StoreRecord};

/// Notification channel the change trigger publishes on.
pub const CHANGES_CHANNEL: &str = "tally_changes";

const STORE_COLUMNS: &str =
    "id, name, owner, email, location, total_revenue, entries, created_at";

const PAYMENT_COLUMNS: &str = "id, store_id, sender_name, sim_cards_sold, payment_amount, \
     status, created_at, transaction_month, remark, receipt_collection_date, clearance";

/// A stored store row.
#[derive(Debug)]
struct StoredStore {
    id: String,
    name: String,
    owner: String,
    email: String,
    location: String,
    total_revenue: Decimal,
    entries: i64,
    created_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredStore {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredStore {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            email: row.try_get("email")?,
            location: row.try_get("location")?,
            total_revenue: row.try_get("total_revenue")?,
            entries: row.try_get("entries")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl StoredStore {
    fn to_record(&self) -> Result<StoreRecord, RemoteError> {
        Ok(StoreRecord {
            id: decode_id(&self.id)?,
            name: self.name.clone(),
            owner: self.owner.clone(),
            email: self.email.clone(),
            location: self.location.clone(),
            total_revenue: self.total_revenue,
            entries: self.entries.max(0) as u64,
            created_at: self.created_at.max(0) as u64,
        })
    }
}

/// A stored transaction row.
#[derive(Debug)]
struct StoredPayment {
    id: String,
    store_id: String,
    sender_name: String,
    sim_cards_sold: i64,
    payment_amount: Decimal,
    status: String,
    created_at: i64,
    transaction_month: String,
    remark: String,
    receipt_collection_date: Option<String>,
    clearance: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredPayment {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredPayment {
            id: row.try_get("id")?,
            store_id: row.try_get("store_id")?,
            sender_name: row.try_get("sender_name")?,
            sim_cards_sold: row.try_get("sim_cards_sold")?,
            payment_amount: row.try_get("payment_amount")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            transaction_month: row.try_get("transaction_month")?,
            remark: row.try_get("remark")?,
            receipt_collection_date: row.try_get("receipt_collection_date")?,
            clearance: row.try_get("clearance")?,
        })
    }
}

impl StoredPayment {
    fn to_record(&self) -> Result<PaymentRecord, RemoteError> {
        let transaction_month = self
            .transaction_month
            .parse::<Month>()
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        let clearance = self.clearance.as_deref().map(parse_clearance).transpose()?;
        let sim_cards_sold = u32::try_from(self.sim_cards_sold).map_err(|_| {
            RemoteError::Decode(format!("simCardsSold out of range: {}", self.sim_cards_sold))
        })?;

        Ok(PaymentRecord {
            id: decode_id(&self.id)?,
            store_id: decode_id(&self.store_id)?,
            sender_name: self.sender_name.clone(),
            sim_cards_sold,
            payment_amount: self.payment_amount,
            status: self.status.clone(),
            created_at: self.created_at.max(0) as u64,
            transaction_month,
            remark: self.remark.clone(),
            receipt_collection_date: self.receipt_collection_date.clone(),
            clearance,
        })
    }
}

fn decode_id(raw: &str) -> Result<RecordId, RemoteError> {
    RecordId::parse(raw).map_err(|e| RemoteError::Decode(e.to_string()))
}

fn clearance_name(clearance: Clearance) -> &'static str {
    match clearance {
        Clearance::Cleared => "CLEARED",
        Clearance::NotCleared => "NOT_CLEARED",
    }
}

fn parse_clearance(raw: &str) -> Result<Clearance, RemoteError> {
    match raw {
        "CLEARED" => Ok(Clearance::Cleared),
        "NOT_CLEARED" => Ok(Clearance::NotCleared),
        other => Err(RemoteError::Decode(format!("Unknown clearance: {}", other))),
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

async fn load_stores(pool: PgPool, app_id: String) -> Result<Vec<StoreRecord>, RemoteError> {
    let rows: Vec<StoredStore> = sqlx::query_as(&format!(
        "SELECT {STORE_COLUMNS} FROM stores WHERE app_id = $1 ORDER BY created_at, id"
    ))
    .bind(&app_id)
    .fetch_all(&pool)
    .await?;

    rows.iter().map(StoredStore::to_record).collect()
}

async fn load_payments(pool: PgPool, app_id: String) -> Result<Vec<PaymentRecord>, RemoteError> {
    let rows: Vec<StoredPayment> = sqlx::query_as(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM transactions WHERE app_id = $1 ORDER BY created_at, id"
    ))
    .bind(&app_id)
    .fetch_all(&pool)
    .await?;

    rows.iter().map(StoredPayment::to_record).collect()
}

type Loader<T> = fn(PgPool, String) -> BoxFuture<'static, Result<Vec<T>, RemoteError>>;

/// Remote store over a PostgreSQL pool, scoped to one application namespace.
#[derive(Debug, Clone)]
pub struct PgRemote {
    pool: PgPool,
    app_id: String,
}

impl PgRemote {
    /// Connect a pool of up to ten connections.
    pub async fn connect(
        database_url: &str,
        app_id: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::with_pool(pool, app_id))
    }

    pub fn with_pool(pool: PgPool, app_id: impl Into<String>) -> Self {
        Self {
            pool,
            app_id: app_id.into(),
        }
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn watch<T: Send + 'static>(
        &self,
        collection: Collection,
        load: Loader<T>,
    ) -> Result<SnapshotStream<T>, RemoteError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGES_CHANNEL).await?;

        let topic = format!("{}:{}", collection.name(), self.app_id);
        let pool = self.pool.clone();
        let app_id = self.app_id.clone();

        let snapshots = stream::unfold(Some((listener, true)), move |state| {
            let topic = topic.clone();
            let pool = pool.clone();
            let app_id = app_id.clone();
            async move {
                let Some((mut listener, first)) = state else {
                    return None;
                };
                if !first {
                    loop {
                        match listener.recv().await {
                            Ok(notification) if notification.payload() == topic => break,
                            Ok(_) => continue,
                            Err(e) => return Some((Err(RemoteError::from(e)), None)),
                        }
                    }
                }
                match load(pool, app_id).await {
                    Ok(snapshot) => Some((Ok(snapshot), Some((listener, false)))),
                    Err(e) => Some((Err(e), None)),
                }
            }
        });

        Ok(snapshots.boxed())
    }

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        write: Write,
    ) -> Result<Option<RecordId>, RemoteError> {
        match write {
            Write::CreateStore(record) => {
                let id = new_id();
                sqlx::query(
                    r#"
                    INSERT INTO stores (
                        app_id, id, name, owner, email, location,
                        total_revenue, entries, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(&self.app_id)
                .bind(&id)
                .bind(&record.name)
                .bind(&record.owner)
                .bind(&record.email)
                .bind(&record.location)
                .bind(record.total_revenue)
                .bind(record.entries as i64)
                .bind(record.created_at as i64)
                .execute(&mut **tx)
                .await?;
                Ok(Some(RecordId::remote(id)))
            }
            Write::CreatePayment(record) => {
                let id = new_id();
                sqlx::query(
                    r#"
                    INSERT INTO transactions (
                        app_id, id, store_id, sender_name, sim_cards_sold,
                        payment_amount, status, created_at, transaction_month,
                        remark, receipt_collection_date, clearance
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    "#,
                )
                .bind(&self.app_id)
                .bind(&id)
                .bind(record.store_id.to_string())
                .bind(&record.sender_name)
                .bind(i64::from(record.sim_cards_sold))
                .bind(record.payment_amount)
                .bind(&record.status)
                .bind(record.created_at as i64)
                .bind(record.transaction_month.name())
                .bind(&record.remark)
                .bind(&record.receipt_collection_date)
                .bind(record.clearance.map(clearance_name))
                .execute(&mut **tx)
                .await?;
                Ok(Some(RecordId::remote(id)))
            }
            Write::UpdateStore { id, patch } => {
                let result = sqlx::query(
                    r#"
                    UPDATE stores SET
                        name = COALESCE($3, name),
                        owner = COALESCE($4, owner),
                        email = COALESCE($5, email),
                        location = COALESCE($6, location)
                    WHERE app_id = $1 AND id = $2
                    "#,
                )
                .bind(&self.app_id)
                .bind(id.to_string())
                .bind(&patch.name)
                .bind(&patch.owner)
                .bind(&patch.email)
                .bind(&patch.location)
                .execute(&mut **tx)
                .await?;
                found(result.rows_affected(), id)
            }
            Write::UpdatePayment { id, patch } => {
                let result = sqlx::query(
                    r#"
                    UPDATE transactions SET
                        sender_name = COALESCE($3, sender_name),
                        sim_cards_sold = COALESCE($4, sim_cards_sold),
                        payment_amount = COALESCE($5, payment_amount),
                        status = COALESCE($6, status),
                        transaction_month = COALESCE($7, transaction_month),
                        remark = COALESCE($8, remark),
                        receipt_collection_date =
                            CASE WHEN $9 THEN $10 ELSE receipt_collection_date END,
                        clearance = CASE WHEN $11 THEN $12 ELSE clearance END
                    WHERE app_id = $1 AND id = $2
                    "#,
                )
                .bind(&self.app_id)
                .bind(id.to_string())
                .bind(&patch.sender_name)
                .bind(patch.sim_cards_sold.map(i64::from))
                .bind(patch.payment_amount)
                .bind(&patch.status)
                .bind(patch.transaction_month.map(Month::name))
                .bind(&patch.remark)
                .bind(patch.receipt_collection_date.is_some())
                .bind(patch.receipt_collection_date.clone().flatten())
                .bind(patch.clearance.is_some())
                .bind(patch.clearance.flatten().map(clearance_name))
                .execute(&mut **tx)
                .await?;
                found(result.rows_affected(), id)
            }
            Write::AdjustStore {
                id,
                revenue,
                entries,
            } => {
                let result = sqlx::query(
                    r#"
                    UPDATE stores SET
                        total_revenue = total_revenue + $3,
                        entries = GREATEST(entries + $4, 0)
                    WHERE app_id = $1 AND id = $2
                    "#,
                )
                .bind(&self.app_id)
                .bind(id.to_string())
                .bind(revenue)
                .bind(entries)
                .execute(&mut **tx)
                .await?;
                found(result.rows_affected(), id)
            }
            Write::DeleteStore(id) => {
                sqlx::query("DELETE FROM stores WHERE app_id = $1 AND id = $2")
                    .bind(&self.app_id)
                    .bind(id.to_string())
                    .execute(&mut **tx)
                    .await?;
                Ok(None)
            }
            Write::DeletePayment(id) => {
                sqlx::query("DELETE FROM transactions WHERE app_id = $1 AND id = $2")
                    .bind(&self.app_id)
                    .bind(id.to_string())
                    .execute(&mut **tx)
                    .await?;
                Ok(None)
            }
        }
    }
}

fn found(rows_affected: u64, id: RecordId) -> Result<Option<RecordId>, RemoteError> {
    if rows_affected == 0 {
        Err(RemoteError::NotFound(id))
    } else {
        Ok(None)
    }
}

#[async_trait]
impl RemoteStore for PgRemote {
    async fn watch_stores(&self) -> Result<SnapshotStream<StoreRecord>, RemoteError> {
        self.watch(Collection::Stores, |pool, app_id| load_stores(pool, app_id).boxed())
            .await
    }

    async fn watch_payments(&self) -> Result<SnapshotStream<PaymentRecord>, RemoteError> {
        self.watch(Collection::Transactions, |pool, app_id| {
            load_payments(pool, app_id).boxed()
        })
        .await
    }

    async fn find_payment(
        &self,
        store_id: &RecordId,
        month: Month,
    ) -> Result<Option<PaymentRecord>, RemoteError> {
        let row: Option<StoredPayment> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM transactions \
             WHERE app_id = $1 AND store_id = $2 AND transaction_month = $3 \
             ORDER BY created_at, id LIMIT 1"
        ))
        .bind(&self.app_id)
        .bind(store_id.to_string())
        .bind(month.name())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(StoredPayment::to_record).transpose()
    }

    async fn get_payment(&self, id: &RecordId) -> Result<Option<PaymentRecord>, RemoteError> {
        let row: Option<StoredPayment> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM transactions WHERE app_id = $1 AND id = $2"
        ))
        .bind(&self.app_id)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(StoredPayment::to_record).transpose()
    }

    async fn payments_of(&self, store_id: &RecordId) -> Result<Vec<RecordId>, RemoteError> {
        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM transactions WHERE app_id = $1 AND store_id = $2")
                .bind(&self.app_id)
                .bind(store_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        ids.iter().map(|(id,)| decode_id(id)).collect()
    }

    async fn list_ids(&self, collection: Collection) -> Result<Vec<RecordId>, RemoteError> {
        let ids: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT id FROM {} WHERE app_id = $1",
            collection.name()
        ))
        .bind(&self.app_id)
        .fetch_all(&self.pool)
        .await?;

        ids.iter().map(|(id,)| decode_id(id)).collect()
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<Vec<RecordId>, RemoteError> {
        check_batch(&writes)?;

        let mut tx = self.pool.begin().await?;
        let mut created = Vec::new();
        for write in writes {
            let is_create = write.is_create();
            if let Some(id) = self.apply(&mut tx, write).await? {
                if is_create {
                    created.push(id);
                }
            }
        }
        tx.commit().await?;

        Ok(created)
    }
}
