// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default lifetime of signed pre-keys (90 days).
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24 * 90);

/// Time window (UNIX timestamps in seconds) in which a signed pre-key can be used.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetime {
    not_before: u64,
    not_after: u64,
}

impl Lifetime {
    /// Lifetime starting now, valid for the given duration.
    pub fn new(duration: Duration) -> Self {
        let now = now();
        Self {
            not_before: now,
            not_after: now.saturating_add(duration.as_secs()),
        }
    }

    pub fn from_range(not_before: u64, not_after: u64) -> Self {
        Self {
            not_before,
            not_after,
        }
    }

    pub fn not_before(&self) -> u64 {
        self.not_before
    }

    pub fn not_after(&self) -> u64 {
        self.not_after
    }

    /// Returns an error if the current time is outside of this lifetime.
    pub fn verify(&self) -> Result<(), LifetimeError> {
        let now = now();
        if now < self.not_before {
            return Err(LifetimeError::TooEarly(self.not_before));
        }
        if now > self.not_after {
            return Err(LifetimeError::Expired(self.not_after));
        }
        Ok(())
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new(DEFAULT_LIFETIME)
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum LifetimeError {
    #[error("key can not be used before {0}")]
    TooEarly(u64),

    #[error("key expired at {0}")]
    Expired(u64),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Lifetime, LifetimeError, now};

    #[test]
    fn verify_lifetime() {
        assert!(Lifetime::default().verify().is_ok());
        assert!(Lifetime::new(Duration::from_secs(60)).verify().is_ok());

        let now = now();
        assert!(matches!(
            Lifetime::from_range(now - 120, now - 60).verify(),
            Err(LifetimeError::Expired(_))
        ));
        assert!(matches!(
            Lifetime::from_range(now + 60, now + 120).verify(),
            Err(LifetimeError::TooEarly(_))
        ));
    }
}
