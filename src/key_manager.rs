// SPDX-License-Identifier: MIT OR Apache-2.0

//! Manager for our own identity secret, signed pre-key secrets and one-time pre-key secrets.
//!
//! Signed pre-keys should be rotated in good time before they expire so others can still fetch a
//! valid bundle while we are offline. One-time pre-key secrets are removed as soon as a session
//! was established with them, a second use of the same id is an error.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::signature::Signature;
use crate::crypto::{CryptoError, CryptoProvider};
use crate::key_bundle::{
    Lifetime, LongTermKeyBundle, OneTimeKeyBundle, OneTimePreKey, OneTimePreKeyId, PreKey,
    PreKeyId, latest_prekey,
};
use crate::traits::{IdentityManager, PreKeyManager};

#[derive(Clone, Debug)]
pub struct KeyManager;

/// Serializable state of the key manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyManagerState {
    identity_secret: SecretKey,
    identity_key: PublicKey,
    prekeys: HashMap<PreKeyId, PreKeyState>,
    onetime_secrets: HashMap<OneTimePreKeyId, (PreKeyId, SecretKey)>,
    onetime_next_id: OneTimePreKeyId,
}

impl KeyManagerState {
    pub fn identity_key(&self) -> &PublicKey {
        &self.identity_key
    }

    /// Number of one-time pre-key secrets which have not been used yet.
    pub fn onetime_secrets_len(&self) -> usize {
        self.onetime_secrets.len()
    }

    fn latest_prekey(&self) -> Option<&PreKeyState> {
        let prekeys = self.prekeys.values().map(|state| &state.prekey).collect();
        latest_prekey(prekeys).and_then(|prekey| self.prekeys.get(prekey.key()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PreKeyState {
    prekey: PreKey,
    signature: Signature,
    secret: SecretKey,
}

impl PreKeyState {
    fn init<P: CryptoProvider>(
        identity_secret: &SecretKey,
        lifetime: Lifetime,
        crypto: &P,
    ) -> Result<Self, KeyManagerError> {
        let secret = crypto.generate_secret_key()?;
        let prekey = PreKey::new(crypto.public_key(&secret)?, lifetime);
        let signature = prekey.sign(identity_secret, crypto)?;

        Ok(Self {
            prekey,
            signature,
            secret,
        })
    }

    fn id(&self) -> PreKeyId {
        *self.prekey.key()
    }
}

impl KeyManager {
    /// Returns a new key manager state holding our identity secret and a first signed pre-key.
    pub fn init<P: CryptoProvider>(
        identity_secret: &SecretKey,
        lifetime: Lifetime,
        crypto: &P,
    ) -> Result<KeyManagerState, KeyManagerError> {
        let prekey = PreKeyState::init(identity_secret, lifetime, crypto)?;

        Ok(KeyManagerState {
            identity_key: crypto.public_key(identity_secret)?,
            identity_secret: identity_secret.clone(),
            prekeys: HashMap::from([(prekey.id(), prekey)]),
            onetime_secrets: HashMap::new(),
            onetime_next_id: 0,
        })
    }

    /// Removes expired signed pre-keys and all one-time secrets which were issued for them.
    pub fn remove_expired(mut y: KeyManagerState) -> KeyManagerState {
        y.prekeys
            .retain(|_, state| state.prekey.verify_lifetime().is_ok());

        let prekeys = &y.prekeys;
        y.onetime_secrets
            .retain(|_, (prekey_id, _)| prekeys.contains_key(prekey_id));

        y
    }
}

impl IdentityManager<KeyManagerState> for KeyManager {
    fn identity_secret(y: &KeyManagerState) -> &SecretKey {
        &y.identity_secret
    }
}

impl PreKeyManager for KeyManager {
    type State = KeyManagerState;

    type Error = KeyManagerError;

    /// Returns the signed pre-key secret for the given public key.
    ///
    /// Fails if the pre-key is unknown, for example because it expired and was removed.
    fn prekey_secret<'a>(
        y: &'a Self::State,
        id: &'a PreKeyId,
    ) -> Result<&'a SecretKey, Self::Error> {
        y.prekeys
            .get(id)
            .map(|state| &state.secret)
            .ok_or(KeyManagerError::UnknownPreKeySecret(*id))
    }

    fn rotate_prekey<P: CryptoProvider>(
        mut y: Self::State,
        lifetime: Lifetime,
        crypto: &P,
    ) -> Result<Self::State, Self::Error> {
        let prekey = PreKeyState::init(&y.identity_secret, lifetime, crypto)?;
        debug!(prekey = %prekey.id(), "rotated signed pre-key");
        y.prekeys.insert(prekey.id(), prekey);
        Ok(y)
    }

    /// Returns the latest long-term key bundle which can be published.
    fn prekey_bundle(y: &Self::State) -> Result<LongTermKeyBundle, Self::Error> {
        y.latest_prekey()
            .map(|latest| LongTermKeyBundle::new(y.identity_key, latest.prekey, latest.signature))
            .ok_or(KeyManagerError::NoPreKeysAvailable)
    }

    fn generate_onetime_bundle<P: CryptoProvider>(
        mut y: Self::State,
        crypto: &P,
    ) -> Result<(Self::State, OneTimeKeyBundle), Self::Error> {
        let (prekey_id, prekey, signature) = {
            let latest = y
                .latest_prekey()
                .ok_or(KeyManagerError::NoPreKeysAvailable)?;
            (latest.id(), latest.prekey, latest.signature)
        };

        let onetime_secret = crypto.generate_secret_key()?;
        let onetime_key = OneTimePreKey::new(crypto.public_key(&onetime_secret)?, y.onetime_next_id);
        y.onetime_secrets
            .insert(onetime_key.id(), (prekey_id, onetime_secret));
        y.onetime_next_id += 1;

        let bundle = OneTimeKeyBundle::new(y.identity_key, prekey, signature, Some(onetime_key));

        Ok((y, bundle))
    }

    /// Removes and returns the one-time pre-key secret with the given id.
    ///
    /// Fails if the id is unknown, which is the case when the one-time pre-key was already used.
    fn use_onetime_secret(
        mut y: Self::State,
        id: OneTimePreKeyId,
    ) -> Result<(Self::State, Option<SecretKey>), Self::Error> {
        match y.onetime_secrets.remove(&id) {
            Some((_, secret)) => Ok((y, Some(secret))),
            None => Err(KeyManagerError::UnknownOneTimeSecret(id)),
        }
    }
}

#[derive(Debug, Error)]
pub enum KeyManagerError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("could not find one-time pre-key secret with id {0}")]
    UnknownOneTimeSecret(OneTimePreKeyId),

    #[error("could not find pre-key secret with id {0}")]
    UnknownPreKeySecret(PreKeyId),

    #[error("no valid pre-keys available, they are either expired or too early")]
    NoPreKeysAvailable,
}
