use crate::model::Ms;

/// Caller and owner identities, in bytes.
pub const MAX_IDENTITY_LEN: usize = 256;

/// Earliest accepted slot time: 2000-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// Latest accepted slot time: 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single lesson slot may not be longer than a day.
pub const MAX_SLOT_DURATION_MS: Ms = 24 * 3_600_000;
