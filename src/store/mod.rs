//! Slot persistence.
//!
//! The lease protocol depends on exactly two operations, [`SlotStore::conditional_acquire`]
//! and [`SlotStore::conditional_release`]. Each evaluates its predicate and writes in one
//! indivisible step; callers never read a slot and then write it back.

mod memory;
mod postgres;

pub use memory::{MemoryStore, run_compactor};
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, Slot};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("slot already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("journal error: {0}")]
    Journal(String),
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("invalid slot {id}: {reason}")]
    InvalidSlot { id: Ulid, reason: &'static str },
    #[error("corrupt slot row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Row-level invariants every store enforces on insert.
pub(crate) fn check_insertable(slot: &Slot) -> Result<(), StoreError> {
    let reason = if slot.starts_at >= slot.ends_at {
        "startsAt must be before endsAt"
    } else if !slot.lease_fields_consistent() {
        "heldBy and holdExpiresAt must be set together, and a held slot needs a holder"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidSlot { id: slot.id, reason })
}

#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Grant `holder` a hold until `now + ttl` if the slot exists and is acquirable
    /// at `now` (see [`Slot::is_acquirable`]). Returns the updated slot, or `None`
    /// when the predicate did not match. Nothing is written on `None`.
    async fn conditional_acquire(
        &self,
        id: Ulid,
        holder: &str,
        now: Ms,
        ttl: Ms,
    ) -> Result<Option<Slot>, StoreError>;

    /// Clear the hold if `holder` is the recorded holder of a `held` slot.
    /// Returns the reopened slot, or `None` when the predicate did not match.
    async fn conditional_release(&self, id: Ulid, holder: &str) -> Result<Option<Slot>, StoreError>;

    /// Insert a new slot row. Used by the scheduling side, not by leasing.
    /// Rows with mismatched lease fields or an empty window are rejected
    /// with [`StoreError::InvalidSlot`].
    async fn insert_slot(&self, slot: Slot) -> Result<(), StoreError>;

    /// Raw snapshot. Lapsed holds show up as `held`.
    async fn get_slot(&self, id: Ulid) -> Result<Option<Slot>, StoreError>;
}
