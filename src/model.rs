use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// How long a hold stays effective once granted. Fixed, never configurable.
pub const HOLD_TTL_MS: Ms = 15 * 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Open,
    Held,
    Booked,
    Cancelled,
}

impl SlotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Open => "open",
            SlotStatus::Held => "held",
            SlotStatus::Booked => "booked",
            SlotStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(SlotStatus::Open),
            "held" => Some(SlotStatus::Held),
            "booked" => Some(SlotStatus::Booked),
            "cancelled" => Some(SlotStatus::Cancelled),
            _ => None,
        }
    }

    /// Booked and cancelled slots can never be leased again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SlotStatus::Booked | SlotStatus::Cancelled)
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bookable lesson slot. The lease lives inline as `held_by` + `hold_expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: Ulid,
    pub owner_id: String,
    pub starts_at: Ms,
    pub ends_at: Ms,
    /// Minor currency units. Carried, never interpreted.
    pub price: i64,
    pub status: SlotStatus,
    pub held_by: Option<String>,
    pub hold_expires_at: Option<Ms>,
}

impl Slot {
    pub fn open(id: Ulid, owner_id: impl Into<String>, starts_at: Ms, ends_at: Ms, price: i64) -> Self {
        debug_assert!(starts_at < ends_at, "slot must start before it ends");
        Self {
            id,
            owner_id: owner_id.into(),
            starts_at,
            ends_at,
            price,
            status: SlotStatus::Open,
            held_by: None,
            hold_expires_at: None,
        }
    }

    /// The holder whose lease is still in force at `now`, if any.
    ///
    /// A stored `held` status says nothing on its own: lapsed holds are never
    /// demoted in storage, so readers have to check the expiry themselves.
    pub fn effective_holder(&self, now: Ms) -> Option<&str> {
        match (&self.held_by, self.hold_expires_at) {
            (Some(holder), Some(expires_at)) if now <= expires_at => Some(holder.as_str()),
            _ => None,
        }
    }

    /// Whether a new hold may be granted at `now`.
    pub fn is_acquirable(&self, now: Ms) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match self.hold_expires_at {
            None => true,
            Some(expires_at) => expires_at < now,
        }
    }

    /// `held_by` and `hold_expires_at` are set together, and `held` always has a holder.
    pub fn lease_fields_consistent(&self) -> bool {
        let paired = self.held_by.is_some() == self.hold_expires_at.is_some();
        let held_has_holder = self.status != SlotStatus::Held || self.held_by.is_some();
        paired && held_has_holder
    }

    /// Apply a lease event to this slot. Events for other slots are ignored.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::HoldAcquired { id, holder, expires_at } if *id == self.id => {
                self.status = SlotStatus::Held;
                self.held_by = Some(holder.clone());
                self.hold_expires_at = Some(*expires_at);
            }
            Event::HoldReleased { id } if *id == self.id => {
                self.status = SlotStatus::Open;
                self.held_by = None;
                self.hold_expires_at = None;
            }
            _ => {}
        }
    }
}

/// Journal record format. Flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated { slot: Slot },
    HoldAcquired { id: Ulid, holder: String, expires_at: Ms },
    HoldReleased { id: Ulid },
}

impl Event {
    pub fn slot_id(&self) -> Ulid {
        match self {
            Event::SlotCreated { slot } => slot.id,
            Event::HoldAcquired { id, .. } | Event::HoldReleased { id } => *id,
        }
    }
}
