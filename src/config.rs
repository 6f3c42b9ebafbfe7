// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::key_bundle::{DEFAULT_LIFETIME, Lifetime};

/// Policy limits of the session layer.
///
/// None of these values are mandated by the protocols, they trade memory usage against the
/// tolerance to delayed, reordered or lost messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub ratchet: RatchetConfig,

    pub group: GroupConfig,

    /// Lifetime of freshly generated signed pre-keys.
    #[serde(default = "default_prekey_lifetime")]
    pub prekey_lifetime: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ratchet: RatchetConfig::default(),
            group: GroupConfig::default(),
            prekey_lifetime: DEFAULT_LIFETIME,
        }
    }
}

impl Config {
    pub(crate) fn lifetime(&self) -> Lifetime {
        Lifetime::new(self.prekey_lifetime)
    }
}

fn default_prekey_lifetime() -> Duration {
    DEFAULT_LIFETIME
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetConfig {
    /// Maximum number of message keys derived ahead within one receiving chain.
    ///
    /// Messages further ahead fail with a skip-limit error so a peer can not make us compute and
    /// store an unbounded number of keys.
    pub max_skip: u32,

    /// Maximum number of cached skipped message keys per session. The oldest ones get evicted.
    pub max_skipped_keys: usize,

    /// Number of previous ratchet keys of the peer we remember to detect replayed messages.
    pub max_retired_keys: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_keys: 2000,
            max_retired_keys: 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Number of most recent epochs retained per group.
    pub max_epochs: usize,

    /// Hard limit of buffered messages per group.
    pub buffer_capacity: usize,

    /// Number of buffered messages above which a resync is requested.
    pub resync_threshold: usize,

    /// Age of the oldest buffered message above which a resync is requested.
    pub resync_max_age: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_epochs: 10,
            buffer_capacity: 100,
            resync_threshold: 20,
            resync_max_age: Duration::from_secs(30),
        }
    }
}
