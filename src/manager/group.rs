// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Display;
use std::hash::Hash;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::crypto::CryptoProvider;
use crate::group::{Epoch, EpochTracker, GroupError, GroupEvent, GroupMessage, GroupSession};
use crate::manager::{Locks, StoreError, Vacant};
use crate::traits::{KeyStore, Resync};

fn group_key<ID: Display>(id: &ID) -> String {
    format!("group/{id}")
}

/// Group sessions, driven by epoch updates of the group collaborator.
///
/// Epoch trackers are persisted in the key store. Buffered messages only live in memory, after a
/// restart they need to be delivered again by the transport.
#[derive(Debug)]
pub struct GroupManager<ID, S, P, R> {
    store: S,
    crypto: P,
    resync: R,
    config: Config,
    groups: Locks<ID, Option<GroupSession>>,
}

impl<ID, S, P, R> GroupManager<ID, S, P, R>
where
    ID: Clone + Display + Eq + Hash,
    S: KeyStore,
    P: CryptoProvider,
    R: Resync<ID>,
{
    pub fn new(store: S, crypto: P, resync: R, config: Config) -> Self {
        Self {
            store,
            crypto,
            resync,
            config,
            groups: Locks::default(),
        }
    }

    pub fn resync(&self) -> &R {
        &self.resync
    }

    /// Records a new epoch reported by the group collaborator.
    ///
    /// Returns the events of buffered messages which got replayed or dropped.
    pub async fn set_epoch(
        &self,
        id: &ID,
        epoch: Epoch,
        data: Vec<u8>,
    ) -> Result<Vec<GroupEvent>, GroupManagerError> {
        let mut slot = self.groups.lock(id).await;
        let session = self.load(id, &mut slot).await?;

        // Persist first so the in-memory session never runs ahead of the store.
        let mut tracker = session.tracker().clone();
        tracker.set_epoch(epoch, data.clone());
        self.store
            .save(&group_key(id), &tracker)
            .await
            .map_err(store_error)?;

        let events = session.set_epoch(epoch, data, &self.crypto);
        self.request_resync(id, session);

        Ok(events)
    }

    /// Encrypts a payload for the current epoch of the group.
    pub async fn encrypt_group(
        &self,
        id: &ID,
        plaintext: &[u8],
    ) -> Result<GroupMessage, GroupManagerError> {
        let mut slot = self.groups.lock(id).await;
        let session = self.load(id, &mut slot).await?;
        Ok(session.encrypt(plaintext, &self.crypto)?)
    }

    /// Decrypts a group message or buffers it until its epoch is known.
    pub async fn decrypt_group(
        &self,
        id: &ID,
        message: GroupMessage,
    ) -> Result<Vec<GroupEvent>, GroupManagerError> {
        let mut slot = self.groups.lock(id).await;
        let session = self.load(id, &mut slot).await?;

        let events = session.offer(message, Instant::now(), &self.crypto)?;
        self.request_resync(id, session);

        Ok(events)
    }

    /// Checks the age of buffered messages and requests a resync if they wait for too long.
    pub async fn poll_resync(&self, id: &ID) -> Result<(), GroupManagerError> {
        let mut slot = self.groups.lock(id).await;
        // Buffered messages only exist in memory.
        if let Some(session) = slot.as_mut() {
            self.request_resync(id, session);
        }
        Ok(())
    }

    /// Returns the current epoch of the group, if any.
    pub async fn current_epoch(&self, id: &ID) -> Result<Option<Epoch>, GroupManagerError> {
        let mut slot = self.groups.lock(id).await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.tracker().current_epoch());
        }

        let Some(tracker) = self.load_tracker(id).await? else {
            return Ok(None);
        };
        let session = slot.insert(GroupSession::from_tracker(tracker, &self.config.group));
        Ok(session.tracker().current_epoch())
    }

    /// Forgets all state of a group and drops its buffered messages.
    pub async fn leave(&self, id: &ID) -> Result<Vec<GroupEvent>, GroupManagerError> {
        let mut slot = self.groups.lock(id).await;

        self.store
            .delete(&group_key(id))
            .await
            .map_err(store_error)?;

        let events = match slot.take() {
            Some(mut session) => session.clear(),
            None => Vec::new(),
        };

        debug!(group = %id, dropped = events.len(), "left group");
        Ok(events)
    }

    async fn load<'a>(
        &self,
        id: &ID,
        slot: &'a mut Option<GroupSession>,
    ) -> Result<&'a mut GroupSession, GroupManagerError> {
        let session = match slot.take() {
            Some(session) => session,
            None => {
                let session = match self.load_tracker(id).await? {
                    Some(tracker) => GroupSession::from_tracker(tracker, &self.config.group),
                    None => GroupSession::new(&self.config.group),
                };
                debug!(group = %id, current = session.tracker().current_epoch(), "loaded group");
                session
            }
        };
        Ok(slot.insert(session))
    }

    async fn load_tracker(&self, id: &ID) -> Result<Option<EpochTracker>, GroupManagerError> {
        self.store
            .load(&group_key(id))
            .await
            .map_err(store_error)
    }

    #[cfg(test)]
    pub(crate) fn lock_entries(&self) -> usize {
        self.groups.len()
    }

    fn request_resync(&self, id: &ID, session: &mut GroupSession) {
        if let Some(request) = session.poll_resync(Instant::now()) {
            self.resync.resync(id, request);
        }
    }
}

/// Sessions without epochs or buffered messages are recreated on demand.
impl Vacant for Option<GroupSession> {
    fn is_vacant(&self) -> bool {
        match self {
            Some(session) => session.tracker().is_empty() && session.buffer().is_empty(),
            None => true,
        }
    }
}

fn store_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> GroupManagerError {
    GroupManagerError::KeyStore(Box::new(err))
}

#[derive(Debug, Error)]
pub enum GroupManagerError {
    #[error(transparent)]
    Group(#[from] GroupError),

    #[error("key store failed: {0}")]
    KeyStore(StoreError),
}
