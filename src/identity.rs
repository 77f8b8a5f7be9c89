use std::fmt;

use crate::lease::LeaseError;
use crate::limits::MAX_IDENTITY_LEN;

/// An authenticated caller, as vouched for by the upstream identity provider.
///
/// Nothing here verifies the identity; it only rejects values that can't be one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerId(String);

impl CallerId {
    /// Taken verbatim. `"alice "` and `"alice"` are different callers, so
    /// surrounding whitespace is rejected rather than stripped.
    pub fn parse(raw: &str) -> Result<Self, LeaseError> {
        if raw.trim().is_empty() {
            return Err(LeaseError::Auth("missing caller identity"));
        }
        if raw.trim() != raw {
            return Err(LeaseError::Auth("caller identity has surrounding whitespace"));
        }
        if raw.len() > MAX_IDENTITY_LEN {
            return Err(LeaseError::Auth("caller identity too long"));
        }
        if raw.chars().any(char::is_control) {
            return Err(LeaseError::Auth("caller identity contains control characters"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
