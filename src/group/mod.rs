// SPDX-License-Identifier: MIT OR Apache-2.0

//! Epoch tracking and message buffering for group channels.
//!
//! The group collaborator (for example an MLS implementation) reports new epochs with their
//! cryptographic state whenever the membership changes. Messages are encrypted for the epoch
//! their sender was in. Since the transport does not guarantee any ordering, messages can
//! arrive after the group already moved to a later epoch or before we learned about the epoch
//! they were sent in:
//!
//! ```text
//!        retained window (max_epochs)
//!   ┌───────────────────────────────┐
//!   │  3   4   5   6   ...   11  12 │  13  14
//!   └───────────────────────────────┘   ▲
//!     ▲                                 │
//!     │ late message, decrypted         │ early message, buffered until
//!                                          set_epoch(13) replays it
//! ```
mod buffer;
mod epoch;
mod session;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::crypto::aead::AeadNonce;

pub use buffer::{BufferedMessage, MessageBuffer, ResyncRequest};
pub use epoch::{Epoch, EpochState, EpochTracker};
pub use session::GroupSession;

/// Encrypted group payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub epoch: Epoch,
    #[serde(with = "serde_bytes")]
    pub nonce: AeadNonce,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Outcome of processing group messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupEvent {
    Decrypted { epoch: Epoch, plaintext: Vec<u8> },

    /// Message waits for the state of its epoch.
    Buffered { epoch: Epoch },

    /// Message is lost.
    Dropped { epoch: Epoch, reason: DropReason },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Evicted from a full buffer to make room for newer messages.
    Overflow,

    /// Failed to decrypt after its epoch became available.
    DecryptionFailed,

    /// Epoch fell out of the retained window.
    EpochExpired,

    /// Buffer was cleared.
    Cleared,
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("no epoch state available for encryption")]
    NoEpoch,

    #[error("epoch {0} is not tracked")]
    UnknownEpoch(Epoch),

    #[error("could not authenticate and decrypt message of epoch {0}")]
    DecryptionFailed(Epoch),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
