// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::ZeroizeOnDrop;

/// Version number of a group's cryptographic state.
pub type Epoch = u64;

/// Cryptographic state of a group required to process messages of one epoch.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct EpochState {
    epoch: Epoch,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl EpochState {
    pub fn new(epoch: Epoch, data: Vec<u8>) -> Self {
        Self { epoch, data }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for EpochState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochState")
            .field("epoch", &self.epoch)
            .field("data", &"***")
            .finish()
    }
}

/// Sliding window over the most recent epochs of a group.
///
/// Messages sent shortly before a membership change still arrive after the group moved on, the
/// window keeps them decryptable. Entries are evicted by lowest epoch number, not by access.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochTracker {
    max_epochs: usize,
    current: Option<Epoch>,
    epochs: BTreeMap<Epoch, EpochState>,
}

impl EpochTracker {
    pub fn new(max_epochs: usize) -> Self {
        Self {
            max_epochs,
            current: None,
            epochs: BTreeMap::new(),
        }
    }

    /// Inserts or overwrites the state of an epoch and prunes the window.
    ///
    /// Epochs may be reported in any order. The current epoch is the highest one ever seen and
    /// never moves backwards.
    pub fn set_epoch(&mut self, epoch: Epoch, data: Vec<u8>) {
        self.epochs.insert(epoch, EpochState::new(epoch, data));
        self.current = Some(self.current.map_or(epoch, |current| current.max(epoch)));
        self.prune();
    }

    /// Changes the size of the window, pruning the lowest epochs if it shrinks.
    pub fn set_max_epochs(&mut self, max_epochs: usize) {
        self.max_epochs = max_epochs;
        self.prune();
    }

    pub fn max_epochs(&self) -> usize {
        self.max_epochs
    }

    fn prune(&mut self) {
        while self.epochs.len() > self.max_epochs {
            if let Some((pruned, _)) = self.epochs.pop_first() {
                debug!(epoch = pruned, "pruned epoch state");
            }
        }
    }

    /// Returns the state of the given epoch if it is still retained.
    pub fn get_epoch(&self, epoch: Epoch) -> Option<&EpochState> {
        self.epochs.get(&epoch)
    }

    /// Returns the state of the highest tracked epoch.
    pub fn current_state(&self) -> Option<&EpochState> {
        self.current.and_then(|epoch| self.epochs.get(&epoch))
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        self.current
    }

    pub fn oldest_epoch(&self) -> Option<Epoch> {
        self.epochs.keys().next().copied()
    }

    /// Returns true if the epoch fell out of the window and can never be tracked again.
    ///
    /// This is only the case while the window is full, otherwise a late `set_epoch` call would
    /// still retain it.
    pub fn is_expired(&self, epoch: Epoch) -> bool {
        if self.epochs.len() < self.max_epochs {
            return false;
        }
        match self.oldest_epoch() {
            Some(oldest) => epoch < oldest,
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}
