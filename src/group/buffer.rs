// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::GroupConfig;
use crate::group::{Epoch, GroupMessage};

/// Group message waiting for the state of its epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferedMessage {
    pub epoch: Epoch,
    pub message: GroupMessage,
    /// Arrival sequence number, unique per buffer.
    pub seq: u64,
    pub received_at: Instant,
}

/// Request to fetch missing epoch updates out of band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResyncRequest {
    /// Epochs buffered messages are waiting for.
    pub missing_epochs: BTreeSet<Epoch>,
    pub buffered: usize,
    pub oldest_age: Duration,
}

/// Bounded queue of group messages in arrival order.
///
/// The buffer does not know anything about epochs being available or not, callers decide which
/// messages are ready. When the buffer grows too large or messages wait for too long it asks for
/// a resync, once per buffering episode.
#[derive(Debug)]
pub struct MessageBuffer {
    capacity: usize,
    resync_threshold: usize,
    resync_max_age: Duration,
    messages: VecDeque<BufferedMessage>,
    next_seq: u64,
    resync_requested: bool,
}

impl MessageBuffer {
    pub fn new(config: &GroupConfig) -> Self {
        Self {
            capacity: config.buffer_capacity,
            resync_threshold: config.resync_threshold,
            resync_max_age: config.resync_max_age,
            messages: VecDeque::new(),
            next_seq: 0,
            resync_requested: false,
        }
    }

    /// Appends a message and returns the messages evicted to stay within capacity.
    pub fn push(
        &mut self,
        epoch: Epoch,
        message: GroupMessage,
        now: Instant,
    ) -> (u64, Vec<BufferedMessage>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.messages.push_back(BufferedMessage {
            epoch,
            message,
            seq,
            received_at: now,
        });

        let mut evicted = Vec::new();
        while self.messages.len() > self.capacity {
            if let Some(oldest) = self.messages.pop_front() {
                warn!(
                    epoch = oldest.epoch,
                    seq = oldest.seq,
                    "buffer overflow, dropped oldest message"
                );
                evicted.push(oldest);
            }
        }

        (seq, evicted)
    }

    /// Removes all messages accepted by the predicate, in arrival order.
    pub fn take_ready<F>(&mut self, mut is_ready: F) -> Vec<BufferedMessage>
    where
        F: FnMut(Epoch) -> bool,
    {
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) = self
            .messages
            .drain(..)
            .partition(|message| is_ready(message.epoch));
        self.messages = waiting;

        if !ready.is_empty() && self.messages.len() <= self.resync_threshold {
            self.resync_requested = false;
        }

        ready.into()
    }

    /// Removes all messages.
    pub fn clear(&mut self) -> Vec<BufferedMessage> {
        self.resync_requested = false;
        self.messages.drain(..).collect()
    }

    /// Returns a resync request if the buffer exceeds its policy and none was requested yet
    /// during this episode.
    pub fn poll_resync(&mut self, now: Instant) -> Option<ResyncRequest> {
        if self.resync_requested {
            return None;
        }

        let oldest_age = self
            .messages
            .front()
            .map(|message| now.saturating_duration_since(message.received_at))
            .unwrap_or_default();

        if self.messages.len() <= self.resync_threshold && oldest_age <= self.resync_max_age {
            return None;
        }

        self.resync_requested = true;

        Some(ResyncRequest {
            missing_epochs: self.messages.iter().map(|message| message.epoch).collect(),
            buffered: self.messages.len(),
            oldest_age,
        })
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedMessage> {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::config::GroupConfig;
    use crate::group::GroupMessage;

    use super::MessageBuffer;

    fn message(epoch: u64) -> GroupMessage {
        GroupMessage {
            epoch,
            nonce: [0; 24],
            ciphertext: vec![epoch as u8],
        }
    }

    fn config(capacity: usize, threshold: usize) -> GroupConfig {
        GroupConfig {
            buffer_capacity: capacity,
            resync_threshold: threshold,
            resync_max_age: Duration::from_secs(30),
            ..GroupConfig::default()
        }
    }

    #[test]
    fn evicts_oldest() {
        let now = Instant::now();
        let mut buffer = MessageBuffer::new(&config(2, 10));

        assert!(buffer.push(1, message(1), now).1.is_empty());
        assert!(buffer.push(2, message(2), now).1.is_empty());

        let (seq, evicted) = buffer.push(3, message(3), now);
        assert_eq!(seq, 2);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].epoch, 1);
        assert_eq!(evicted[0].seq, 0);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn take_ready_in_arrival_order() {
        let now = Instant::now();
        let mut buffer = MessageBuffer::new(&config(10, 10));

        buffer.push(7, message(7), now);
        buffer.push(6, message(6), now);
        buffer.push(8, message(8), now);
        buffer.push(6, message(6), now);

        let ready = buffer.take_ready(|epoch| epoch <= 7);
        assert_eq!(
            ready.iter().map(|m| (m.epoch, m.seq)).collect::<Vec<_>>(),
            vec![(7, 0), (6, 1), (6, 3)]
        );
        assert_eq!(buffer.iter().map(|m| m.epoch).collect::<Vec<_>>(), vec![8]);
    }

    #[test]
    fn resync_once_per_episode() {
        let now = Instant::now();
        let mut buffer = MessageBuffer::new(&config(10, 2));

        buffer.push(4, message(4), now);
        buffer.push(4, message(4), now);
        assert!(buffer.poll_resync(now).is_none());

        buffer.push(5, message(5), now);
        let request = buffer.poll_resync(now).unwrap();
        assert_eq!(request.buffered, 3);
        assert_eq!(request.missing_epochs.into_iter().collect::<Vec<_>>(), vec![4, 5]);

        // Already requested.
        buffer.push(5, message(5), now);
        assert!(buffer.poll_resync(now).is_none());

        // Replay brings the buffer back under the threshold, which ends the episode.
        buffer.take_ready(|epoch| epoch == 4);
        assert_eq!(buffer.len(), 2);
        buffer.push(6, message(6), now);
        assert!(buffer.poll_resync(now).is_some());
    }

    #[test]
    fn resync_on_age() {
        let now = Instant::now();
        let mut buffer = MessageBuffer::new(&config(10, 10));

        buffer.push(4, message(4), now);
        assert!(buffer.poll_resync(now + Duration::from_secs(30)).is_none());

        let request = buffer.poll_resync(now + Duration::from_secs(31)).unwrap();
        assert_eq!(request.oldest_age, Duration::from_secs(31));
        assert_eq!(request.buffered, 1);
    }

    #[test]
    fn clear() {
        let now = Instant::now();
        let mut buffer = MessageBuffer::new(&config(10, 10));

        buffer.push(4, message(4), now);
        buffer.push(5, message(5), now);
        assert_eq!(buffer.clear().len(), 2);
        assert!(buffer.is_empty());
    }
}
