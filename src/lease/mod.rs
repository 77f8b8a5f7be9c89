//! Slot holds: Acquire and Release on top of the store's conditional updates.
//!
//! The manager keeps no state of its own between calls. Each operation is
//! one conditional update against the store; whichever write commits first
//! wins and everyone else sees a conflict.

mod error;

pub use error::{Conflict, LeaseError};

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};
use ulid::Ulid;

use crate::clock::Clock;
use crate::identity::CallerId;
use crate::model::{HOLD_TTL_MS, Ms, Slot};
use crate::observability;
use crate::store::{SlotStore, StoreError};

/// What Release reports when the caller is not the recorded holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    /// Succeed with nothing released.
    #[default]
    Idempotent,
    /// Fail with [`Conflict::NotHeldByCaller`].
    Strict,
}

impl FromStr for ReleasePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idempotent" => Ok(ReleasePolicy::Idempotent),
            "strict" => Ok(ReleasePolicy::Strict),
            other => Err(format!("unknown release policy {other:?} (expected idempotent or strict)")),
        }
    }
}

/// A granted hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub slot: Slot,
    pub holder: CallerId,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The caller's hold was cleared; the slot is open again.
    Released(Slot),
    /// The caller held nothing on this slot. Nothing changed.
    NotHeld,
}

/// A slot as seen by a reader at a given instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub slot: Slot,
    pub hold_active: bool,
}

pub struct LeaseManager {
    store: Arc<dyn SlotStore>,
    clock: Arc<dyn Clock>,
    release_policy: ReleasePolicy,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn SlotStore>, clock: Arc<dyn Clock>, release_policy: ReleasePolicy) -> Self {
        Self {
            store,
            clock,
            release_policy,
        }
    }

    /// Place a 15-minute hold on `slot_id` for `caller`.
    ///
    /// Fails with a conflict when the slot does not exist, is effectively held
    /// (including by `caller`), or is booked or cancelled.
    pub async fn acquire(&self, caller: &str, slot_id: &str) -> Result<Lease, LeaseError> {
        let caller = CallerId::parse(caller)?;
        let id = parse_slot_id(slot_id)?;
        let now = self.clock.now_ms();

        let started = Instant::now();
        let result = self
            .store
            .conditional_acquire(id, caller.as_str(), now, HOLD_TTL_MS)
            .await;
        record_store_latency("acquire", started);

        match result {
            Ok(Some(slot)) => {
                let expires_at = now + HOLD_TTL_MS;
                metrics::counter!(observability::LEASE_ACQUIRE_TOTAL, "outcome" => "acquired").increment(1);
                info!(slot_id = %id, holder = %caller, expires_at, "hold acquired");
                Ok(Lease {
                    slot,
                    holder: caller,
                    expires_at,
                })
            }
            Ok(None) => {
                metrics::counter!(observability::LEASE_ACQUIRE_TOTAL, "outcome" => "conflict").increment(1);
                debug!(slot_id = %id, caller = %caller, "hold refused: slot not available");
                Err(LeaseError::Conflict(Conflict::SlotUnavailable))
            }
            Err(e) => {
                metrics::counter!(observability::LEASE_ACQUIRE_TOTAL, "outcome" => "error").increment(1);
                Err(store_failure("acquire", id, e))
            }
        }
    }

    /// Drop `caller`'s hold on `slot_id`. Safe to repeat.
    pub async fn release(&self, caller: &str, slot_id: &str) -> Result<ReleaseOutcome, LeaseError> {
        let caller = CallerId::parse(caller)?;
        let id = parse_slot_id(slot_id)?;

        let started = Instant::now();
        let result = self.store.conditional_release(id, caller.as_str()).await;
        record_store_latency("release", started);

        match result {
            Ok(Some(slot)) => {
                metrics::counter!(observability::LEASE_RELEASE_TOTAL, "outcome" => "released").increment(1);
                info!(slot_id = %id, holder = %caller, "hold released");
                Ok(ReleaseOutcome::Released(slot))
            }
            Ok(None) => {
                metrics::counter!(observability::LEASE_RELEASE_TOTAL, "outcome" => "not_held").increment(1);
                debug!(slot_id = %id, caller = %caller, policy = ?self.release_policy, "release matched no hold");
                match self.release_policy {
                    ReleasePolicy::Idempotent => Ok(ReleaseOutcome::NotHeld),
                    ReleasePolicy::Strict => Err(LeaseError::Conflict(Conflict::NotHeldByCaller)),
                }
            }
            Err(e) => {
                metrics::counter!(observability::LEASE_RELEASE_TOTAL, "outcome" => "error").increment(1);
                Err(store_failure("release", id, e))
            }
        }
    }

    /// Read a slot and judge its hold against the current time.
    /// `Ok(None)` if the slot does not exist.
    pub async fn inspect(&self, caller: &str, slot_id: &str) -> Result<Option<SlotView>, LeaseError> {
        CallerId::parse(caller)?;
        let id = parse_slot_id(slot_id)?;
        let slot = self
            .store
            .get_slot(id)
            .await
            .map_err(|e| store_failure("inspect", id, e))?;
        let now = self.clock.now_ms();
        Ok(slot.map(|slot| SlotView {
            hold_active: slot.effective_holder(now).is_some(),
            slot,
        }))
    }
}

pub fn parse_slot_id(raw: &str) -> Result<Ulid, LeaseError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(LeaseError::Validation("slot id is required".into()));
    }
    Ulid::from_string(raw).map_err(|e| LeaseError::Validation(format!("{raw:?}: {e}")))
}

fn record_store_latency(op: &'static str, started: Instant) {
    metrics::histogram!(observability::STORE_OP_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}

fn store_failure(op: &'static str, id: Ulid, e: StoreError) -> LeaseError {
    error!(slot_id = %id, op, "store failure: {e}");
    LeaseError::Store(e)
}
