// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Display;
use std::hash::Hash;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::crypto::CryptoProvider;
use crate::crypto::x25519::SecretKey;
use crate::key_bundle::{LongTermKeyBundle, OneTimeKeyBundle};
use crate::key_manager::{KeyManager, KeyManagerError, KeyManagerState};
use crate::manager::{Locks, StoreError};
use crate::ratchet::{DoubleRatchet, RatchetCiphertext, RatchetError, RatchetState};
use crate::traits::{IdentityManager, KeyBundle, KeyStore, PreKeyManager};
use crate::x3dh::{X3dhError, X3dhInitiation, x3dh_initiate, x3dh_respond};

const KEY_MANAGER_KEY: &str = "key_manager";

fn session_key<ID: Display>(id: &ID) -> String {
    format!("session/{id}")
}

/// Pairwise sessions with other members, persisted in a key store.
///
/// Our own identity and pre-key secrets are kept in the same store.
#[derive(Debug)]
pub struct SessionManager<ID, S, P> {
    store: S,
    crypto: P,
    config: Config,
    sessions: Locks<ID, ()>,
    key_manager: Mutex<()>,
}

impl<ID, S, P> SessionManager<ID, S, P>
where
    ID: Clone + Display + Eq + Hash,
    S: KeyStore,
    P: CryptoProvider,
{
    pub fn new(store: S, crypto: P, config: Config) -> Self {
        Self {
            store,
            crypto,
            config,
            sessions: Locks::default(),
            key_manager: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn crypto(&self) -> &P {
        &self.crypto
    }

    /// Stores our identity secret with a first signed pre-key, unless already done.
    pub async fn init_identity(&self, identity_secret: &SecretKey) -> Result<(), SessionError> {
        let _guard = self.key_manager.lock().await;
        if self
            .store
            .load::<KeyManagerState>(KEY_MANAGER_KEY)
            .await
            .map_err(store_error)?
            .is_some()
        {
            return Ok(());
        }

        let y = KeyManager::init(identity_secret, self.config.lifetime(), &self.crypto)?;
        self.save_key_manager(&y).await?;
        debug!(identity_key = %y.identity_key(), "initialised identity");
        Ok(())
    }

    /// Returns our latest long-term key bundle to be published.
    pub async fn prekey_bundle(&self) -> Result<LongTermKeyBundle, SessionError> {
        let _guard = self.key_manager.lock().await;
        let y = self.load_key_manager().await?;
        Ok(KeyManager::prekey_bundle(&y)?)
    }

    /// Creates a key bundle with a fresh one-time pre-key to be published.
    pub async fn generate_onetime_bundle(&self) -> Result<OneTimeKeyBundle, SessionError> {
        let _guard = self.key_manager.lock().await;
        let y = self.load_key_manager().await?;
        let (y_i, bundle) = KeyManager::generate_onetime_bundle(y, &self.crypto)?;
        self.save_key_manager(&y_i).await?;
        Ok(bundle)
    }

    /// Adds a new signed pre-key and removes expired ones.
    pub async fn rotate_prekey(&self) -> Result<(), SessionError> {
        let _guard = self.key_manager.lock().await;
        let y = self.load_key_manager().await?;
        let y_i = KeyManager::rotate_prekey(y, self.config.lifetime(), &self.crypto)?;
        let y_ii = KeyManager::remove_expired(y_i);
        self.save_key_manager(&y_ii).await
    }

    /// Establishes a session with a member from their published key bundle.
    ///
    /// The returned handshake values need to be sent along the first message.
    pub async fn initiate<K: KeyBundle>(
        &self,
        id: &ID,
        their_bundle: &K,
    ) -> Result<X3dhInitiation, SessionError> {
        let _guard = self.sessions.lock(id).await;
        self.ensure_no_session(id).await?;

        let identity_secret = {
            let _guard = self.key_manager.lock().await;
            let y = self.load_key_manager().await?;
            KeyManager::identity_secret(&y).clone()
        };

        let (initiation, x3dh) = x3dh_initiate(&identity_secret, their_bundle, &self.crypto)?;
        let y = DoubleRatchet::init_initiator(
            &x3dh,
            *their_bundle.signed_prekey(),
            &self.config.ratchet,
            &self.crypto,
        )?;
        self.save_session(id, &y).await?;

        debug!(session = %id, "initiated session");
        Ok(initiation)
    }

    /// Establishes a session from the handshake values of an initiator.
    ///
    /// A used one-time pre-key secret is removed before the session gets stored, a second
    /// handshake with the same one-time pre-key fails.
    pub async fn respond(&self, id: &ID, initiation: &X3dhInitiation) -> Result<(), SessionError> {
        let _guard = self.sessions.lock(id).await;
        self.ensure_no_session(id).await?;

        let (x3dh, prekey_secret) = {
            let _guard = self.key_manager.lock().await;
            let y = self.load_key_manager().await?;
            let prekey_secret = KeyManager::prekey_secret(&y, &initiation.signed_prekey)?.clone();

            let (y_i, onetime_secret) = match initiation.onetime_prekey_id {
                Some(onetime_id) => KeyManager::use_onetime_secret(y.clone(), onetime_id)?,
                None => (y.clone(), None),
            };

            let x3dh = x3dh_respond(
                initiation,
                KeyManager::identity_secret(&y),
                &prekey_secret,
                onetime_secret.as_ref(),
                &self.crypto,
            )?;

            if initiation.onetime_prekey_id.is_some() {
                self.save_key_manager(&y_i).await?;
            }

            (x3dh, prekey_secret)
        };

        let y = DoubleRatchet::init_responder(
            &x3dh,
            &prekey_secret,
            &self.config.ratchet,
            &self.crypto,
        )?;
        self.save_session(id, &y).await?;

        debug!(session = %id, "responded to session");
        Ok(())
    }

    pub async fn encrypt_pairwise(
        &self,
        id: &ID,
        plaintext: &[u8],
    ) -> Result<RatchetCiphertext, SessionError> {
        let _guard = self.sessions.lock(id).await;

        let y = self.load_session(id).await?;
        let (y_i, message) = DoubleRatchet::encrypt(y, plaintext, &self.crypto)?;
        self.save_session(id, &y_i).await?;

        Ok(message)
    }

    pub async fn decrypt_pairwise(
        &self,
        id: &ID,
        message: &RatchetCiphertext,
    ) -> Result<Vec<u8>, SessionError> {
        let _guard = self.sessions.lock(id).await;

        let y = self.load_session(id).await?;
        let (y_i, plaintext) = DoubleRatchet::decrypt(&y, message, &self.crypto)?;
        self.save_session(id, &y_i).await?;

        Ok(plaintext)
    }

    pub async fn has_session(&self, id: &ID) -> Result<bool, SessionError> {
        let _guard = self.sessions.lock(id).await;
        Ok(self.store_load(id).await?.is_some())
    }

    /// Returns a copy of the current session state.
    pub async fn session(&self, id: &ID) -> Result<Option<RatchetState>, SessionError> {
        let _guard = self.sessions.lock(id).await;
        self.store_load(id).await
    }

    /// Deletes a session, a new handshake is required to talk to the member again.
    pub async fn reset(&self, id: &ID) -> Result<(), SessionError> {
        let _guard = self.sessions.lock(id).await;

        self.store
            .delete(&session_key(id))
            .await
            .map_err(store_error)?;

        debug!(session = %id, "reset session");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn lock_entries(&self) -> usize {
        self.sessions.len()
    }

    async fn ensure_no_session(&self, id: &ID) -> Result<(), SessionError> {
        if self.store_load(id).await?.is_some() {
            return Err(SessionError::SessionExists(id.to_string()));
        }
        Ok(())
    }

    async fn store_load(&self, id: &ID) -> Result<Option<RatchetState>, SessionError> {
        self.store
            .load(&session_key(id))
            .await
            .map_err(store_error)
    }

    async fn load_session(&self, id: &ID) -> Result<RatchetState, SessionError> {
        self.store_load(id)
            .await?
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))
    }

    async fn save_session(&self, id: &ID, y: &RatchetState) -> Result<(), SessionError> {
        self.store
            .save(&session_key(id), y)
            .await
            .map_err(store_error)
    }

    async fn load_key_manager(&self) -> Result<KeyManagerState, SessionError> {
        self.store
            .load(KEY_MANAGER_KEY)
            .await
            .map_err(store_error)?
            .ok_or(SessionError::MissingIdentity)
    }

    async fn save_key_manager(&self, y: &KeyManagerState) -> Result<(), SessionError> {
        self.store
            .save(KEY_MANAGER_KEY, y)
            .await
            .map_err(store_error)
    }
}

fn store_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> SessionError {
    SessionError::KeyStore(Box::new(err))
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session with {0}")]
    UnknownSession(String),

    #[error("session with {0} already exists")]
    SessionExists(String),

    #[error("identity was not initialised")]
    MissingIdentity,

    #[error(transparent)]
    X3dh(#[from] X3dhError),

    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    #[error(transparent)]
    KeyManager(#[from] KeyManagerError),

    #[error("key store failed: {0}")]
    KeyStore(StoreError),
}
