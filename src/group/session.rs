// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Instant;

use tracing::{debug, warn};

use crate::config::GroupConfig;
use crate::crypto::{CryptoError, CryptoProvider};
use crate::group::{
    BufferedMessage, DropReason, Epoch, EpochTracker, GroupError, GroupEvent, GroupMessage,
    MessageBuffer, ResyncRequest,
};

/// Epoch window and message buffer of one group.
///
/// Messages for retained epochs are decrypted right away. Messages for epochs we did not learn
/// about yet wait in the buffer and are replayed in arrival order as soon as their epoch gets
/// reported.
#[derive(Debug)]
pub struct GroupSession {
    tracker: EpochTracker,
    buffer: MessageBuffer,
}

impl GroupSession {
    pub fn new(config: &GroupConfig) -> Self {
        Self::from_tracker(EpochTracker::new(config.max_epochs), config)
    }

    /// Restores a session from a persisted epoch tracker with an empty buffer.
    ///
    /// The window of the tracker is resized to the configured number of epochs.
    pub fn from_tracker(mut tracker: EpochTracker, config: &GroupConfig) -> Self {
        tracker.set_max_epochs(config.max_epochs);
        Self {
            tracker,
            buffer: MessageBuffer::new(config),
        }
    }

    pub fn tracker(&self) -> &EpochTracker {
        &self.tracker
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    /// Records the state of an epoch and replays all buffered messages which became ready.
    ///
    /// Buffered messages waiting for epochs which fell out of the window are dropped.
    pub fn set_epoch<P: CryptoProvider>(
        &mut self,
        epoch: Epoch,
        data: Vec<u8>,
        crypto: &P,
    ) -> Vec<GroupEvent> {
        self.tracker.set_epoch(epoch, data);
        debug!(
            epoch,
            current = self.tracker.current_epoch(),
            "recorded group epoch"
        );

        let mut events = self.on_epoch_available(epoch, crypto);

        let tracker = &self.tracker;
        let expired = self
            .buffer
            .take_ready(|required| tracker.is_expired(required));
        events.extend(expired.into_iter().map(|message| {
            warn!(
                epoch = message.epoch,
                seq = message.seq,
                "dropped buffered message of expired epoch"
            );
            GroupEvent::Dropped {
                epoch: message.epoch,
                reason: DropReason::EpochExpired,
            }
        }));

        events
    }

    /// Replays buffered messages whose epoch is now tracked, in arrival order.
    ///
    /// Messages failing to decrypt after replay are dropped, not buffered again.
    pub fn on_epoch_available<P: CryptoProvider>(
        &mut self,
        epoch: Epoch,
        crypto: &P,
    ) -> Vec<GroupEvent> {
        let tracker = &self.tracker;
        let ready = self
            .buffer
            .take_ready(|required| tracker.get_epoch(required).is_some());

        if !ready.is_empty() {
            debug!(epoch, replayed = ready.len(), "replaying buffered group messages");
        }

        ready
            .into_iter()
            .map(|buffered| self.replay(buffered, crypto))
            .collect()
    }

    /// Encrypts a payload for the current epoch.
    pub fn encrypt<P: CryptoProvider>(
        &self,
        plaintext: &[u8],
        crypto: &P,
    ) -> Result<GroupMessage, GroupError> {
        let state = self.tracker.current_state().ok_or(GroupError::NoEpoch)?;
        let (nonce, ciphertext) = crypto.group_encrypt(state.epoch(), state.data(), plaintext)?;
        Ok(GroupMessage {
            epoch: state.epoch(),
            nonce,
            ciphertext,
        })
    }

    /// Processes an incoming group message.
    ///
    /// Returns the decrypted message if its epoch is retained, otherwise the message gets
    /// buffered or, if its epoch already fell out of the window, dropped. Buffering might evict
    /// older messages, they are reported as dropped.
    pub fn offer<P: CryptoProvider>(
        &mut self,
        message: GroupMessage,
        now: Instant,
        crypto: &P,
    ) -> Result<Vec<GroupEvent>, GroupError> {
        let epoch = message.epoch;

        if self.tracker.get_epoch(epoch).is_some() {
            let plaintext = self.decrypt(&message, crypto)?;
            return Ok(vec![GroupEvent::Decrypted { epoch, plaintext }]);
        }

        if self.tracker.is_expired(epoch) {
            warn!(epoch, "dropped group message of expired epoch");
            return Ok(vec![GroupEvent::Dropped {
                epoch,
                reason: DropReason::EpochExpired,
            }]);
        }

        let (seq, evicted) = self.buffer.push(epoch, message, now);
        debug!(epoch, seq, buffered = self.buffer.len(), "buffered group message");

        let mut events: Vec<GroupEvent> = evicted
            .into_iter()
            .map(|message| GroupEvent::Dropped {
                epoch: message.epoch,
                reason: DropReason::Overflow,
            })
            .collect();

        // The new message itself is gone if the buffer has no capacity at all.
        if self.buffer.iter().any(|message| message.seq == seq) {
            events.push(GroupEvent::Buffered { epoch });
        }

        Ok(events)
    }

    /// Returns a resync request if too many messages are waiting or they wait for too long.
    pub fn poll_resync(&mut self, now: Instant) -> Option<ResyncRequest> {
        let request = self.buffer.poll_resync(now)?;
        warn!(
            buffered = request.buffered,
            oldest_age = ?request.oldest_age,
            "requesting group resync"
        );
        Some(request)
    }

    /// Drops all buffered messages, for example when leaving the group.
    pub fn clear(&mut self) -> Vec<GroupEvent> {
        self.buffer
            .clear()
            .into_iter()
            .map(|message| GroupEvent::Dropped {
                epoch: message.epoch,
                reason: DropReason::Cleared,
            })
            .collect()
    }

    fn replay<P: CryptoProvider>(&self, buffered: BufferedMessage, crypto: &P) -> GroupEvent {
        match self.decrypt(&buffered.message, crypto) {
            Ok(plaintext) => GroupEvent::Decrypted {
                epoch: buffered.epoch,
                plaintext,
            },
            Err(err) => {
                warn!(
                    epoch = buffered.epoch,
                    seq = buffered.seq,
                    %err,
                    "dropped buffered message which failed to decrypt"
                );
                GroupEvent::Dropped {
                    epoch: buffered.epoch,
                    reason: DropReason::DecryptionFailed,
                }
            }
        }
    }

    fn decrypt<P: CryptoProvider>(
        &self,
        message: &GroupMessage,
        crypto: &P,
    ) -> Result<Vec<u8>, GroupError> {
        let state = self
            .tracker
            .get_epoch(message.epoch)
            .ok_or(GroupError::UnknownEpoch(message.epoch))?;
        crypto
            .group_decrypt(
                message.epoch,
                state.data(),
                message.nonce,
                &message.ciphertext,
            )
            .map_err(|err| match err {
                CryptoError::AuthenticationFailed => GroupError::DecryptionFailed(message.epoch),
                err => GroupError::Crypto(err),
            })
    }
}
