use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// A lease operation whose predicate did not match. Missing, taken and
/// finalized slots all map to the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    SlotUnavailable,
    NotHeldByCaller,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::SlotUnavailable => f.write_str("slot not available"),
            Conflict::NotHeldByCaller => f.write_str("not held by caller"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("unauthenticated: {0}")]
    Auth(&'static str),
    #[error("invalid slot id: {0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(Conflict),
    #[error(transparent)]
    Store(#[from] StoreError),
}
