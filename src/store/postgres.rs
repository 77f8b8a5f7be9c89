use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Row};
use tracing::error;
use ulid::Ulid;

use crate::model::{Ms, Slot, SlotStatus};

use super::{SlotStore, StoreError, check_insertable};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS slots (
    id              TEXT PRIMARY KEY,
    owner_id        TEXT NOT NULL,
    starts_at       BIGINT NOT NULL,
    ends_at         BIGINT NOT NULL,
    price           BIGINT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'open'
                    CHECK (status IN ('open', 'held', 'booked', 'cancelled')),
    held_by         TEXT,
    hold_expires_at BIGINT,
    CHECK ((held_by IS NULL) = (hold_expires_at IS NULL)),
    CHECK (status <> 'held' OR held_by IS NOT NULL),
    CHECK (starts_at < ends_at)
)
"#;

const COLUMNS: &str = "id, owner_id, starts_at, ends_at, price, status, held_by, hold_expires_at";

// Predicate and write in one statement. Under READ COMMITTED a concurrent
// updater blocks on the row lock, and the WHERE clause is re-checked against
// the committed row before this UPDATE applies.
fn acquire_sql() -> String {
    format!(
        "UPDATE slots SET status = 'held', held_by = $2, hold_expires_at = $3 \
         WHERE id = $1 AND status IN ('open', 'held') \
           AND (held_by IS NULL OR hold_expires_at < $4) \
         RETURNING {COLUMNS}"
    )
}

fn release_sql() -> String {
    format!(
        "UPDATE slots SET status = 'open', held_by = NULL, hold_expires_at = NULL \
         WHERE id = $1 AND held_by = $2 AND status = 'held' \
         RETURNING {COLUMNS}"
    )
}

fn insert_sql() -> String {
    format!(
        "INSERT INTO slots ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (id) DO NOTHING"
    )
}

fn select_sql() -> String {
    format!("SELECT {COLUMNS} FROM slots WHERE id = $1")
}

/// Slot store on a PostgreSQL `slots` table.
pub struct PgStore {
    client: Client,
}

impl PgStore {
    /// Connect with a libpq-style connection string and drive the connection
    /// on a background task.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {e}");
            }
        });
        Ok(Self { client })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.client.batch_execute(SCHEMA_SQL).await?;
        Ok(())
    }
}

fn row_to_slot(row: &Row) -> Result<Slot, StoreError> {
    let raw_id: String = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::Corrupt {
        id: raw_id.clone(),
        reason,
    };
    let id = Ulid::from_string(&raw_id).map_err(|e| corrupt(format!("bad id: {e}")))?;
    let raw_status: String = row.try_get("status")?;
    let status =
        SlotStatus::parse(&raw_status).ok_or_else(|| corrupt(format!("unknown status {raw_status:?}")))?;

    let slot = Slot {
        id,
        owner_id: row.try_get("owner_id")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        price: row.try_get("price")?,
        status,
        held_by: row.try_get("held_by")?,
        hold_expires_at: row.try_get("hold_expires_at")?,
    };
    if !slot.lease_fields_consistent() {
        return Err(corrupt("inconsistent lease fields".into()));
    }
    Ok(slot)
}

#[async_trait]
impl SlotStore for PgStore {
    async fn conditional_acquire(
        &self,
        id: Ulid,
        holder: &str,
        now: Ms,
        ttl: Ms,
    ) -> Result<Option<Slot>, StoreError> {
        let id = id.to_string();
        let expires_at = now + ttl;
        let row = self
            .client
            .query_opt(&acquire_sql(), &[&id, &holder, &expires_at, &now])
            .await?;
        row.as_ref().map(row_to_slot).transpose()
    }

    async fn conditional_release(&self, id: Ulid, holder: &str) -> Result<Option<Slot>, StoreError> {
        let id = id.to_string();
        let row = self.client.query_opt(&release_sql(), &[&id, &holder]).await?;
        row.as_ref().map(row_to_slot).transpose()
    }

    async fn insert_slot(&self, slot: Slot) -> Result<(), StoreError> {
        check_insertable(&slot)?;
        let id = slot.id.to_string();
        let status = slot.status.as_str();
        let inserted = self
            .client
            .execute(
                &insert_sql(),
                &[
                    &id,
                    &slot.owner_id,
                    &slot.starts_at,
                    &slot.ends_at,
                    &slot.price,
                    &status,
                    &slot.held_by,
                    &slot.hold_expires_at,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(slot.id));
        }
        Ok(())
    }

    async fn get_slot(&self, id: Ulid) -> Result<Option<Slot>, StoreError> {
        let id = id.to_string();
        let row = self.client.query_opt(&select_sql(), &[&id]).await?;
        row.as_ref().map(row_to_slot).transpose()
    }
}
