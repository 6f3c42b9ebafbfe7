// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::x25519::PublicKey;
use crate::crypto::signature::Signature;
use crate::crypto::{CryptoError, CryptoProvider};
use crate::key_bundle::{LifetimeError, OneTimePreKey, OneTimePreKeyId, PreKey};
use crate::traits::KeyBundle;

/// Key-bundle with a one-time pre-key which must be used exactly _once_.
///
/// Bundles are published by a member so others can establish a session with them while they are
/// offline. The signed pre-key is authenticated by the identity key, the one-time pre-key is not
/// and should be delivered through an authenticated channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKeyBundle {
    identity_key: PublicKey,
    signed_prekey: PreKey,
    prekey_signature: Signature,
    onetime_prekey: Option<OneTimePreKey>,
}

impl OneTimeKeyBundle {
    pub fn new(
        identity_key: PublicKey,
        signed_prekey: PreKey,
        prekey_signature: Signature,
        onetime_prekey: Option<OneTimePreKey>,
    ) -> Self {
        Self {
            identity_key,
            signed_prekey,
            prekey_signature,
            onetime_prekey,
        }
    }
}

impl KeyBundle for OneTimeKeyBundle {
    fn identity_key(&self) -> &PublicKey {
        &self.identity_key
    }

    fn signed_prekey(&self) -> &PublicKey {
        self.signed_prekey.key()
    }

    fn onetime_prekey(&self) -> Option<&PublicKey> {
        self.onetime_prekey.as_ref().map(|key| key.key())
    }

    fn onetime_prekey_id(&self) -> Option<OneTimePreKeyId> {
        self.onetime_prekey.as_ref().map(|key| key.id())
    }

    fn verify<P: CryptoProvider>(&self, crypto: &P) -> Result<(), KeyBundleError> {
        verify_signed_prekey(
            &self.identity_key,
            &self.signed_prekey,
            &self.prekey_signature,
            crypto,
        )
    }
}

/// Key-bundle without one-time pre-key, to be used until the signed pre-key expired.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermKeyBundle {
    identity_key: PublicKey,
    signed_prekey: PreKey,
    prekey_signature: Signature,
}

impl LongTermKeyBundle {
    pub fn new(
        identity_key: PublicKey,
        signed_prekey: PreKey,
        prekey_signature: Signature,
    ) -> Self {
        Self {
            identity_key,
            signed_prekey,
            prekey_signature,
        }
    }
}

impl KeyBundle for LongTermKeyBundle {
    fn identity_key(&self) -> &PublicKey {
        &self.identity_key
    }

    fn signed_prekey(&self) -> &PublicKey {
        self.signed_prekey.key()
    }

    fn onetime_prekey(&self) -> Option<&PublicKey> {
        None
    }

    fn onetime_prekey_id(&self) -> Option<OneTimePreKeyId> {
        None
    }

    fn verify<P: CryptoProvider>(&self, crypto: &P) -> Result<(), KeyBundleError> {
        verify_signed_prekey(
            &self.identity_key,
            &self.signed_prekey,
            &self.prekey_signature,
            crypto,
        )
    }
}

fn verify_signed_prekey<P: CryptoProvider>(
    identity_key: &PublicKey,
    signed_prekey: &PreKey,
    signature: &Signature,
    crypto: &P,
) -> Result<(), KeyBundleError> {
    signed_prekey.verify_lifetime()?;
    crypto
        .verify(&signed_prekey.to_signed_bytes(), identity_key, signature)
        .map_err(KeyBundleError::InvalidSignature)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum KeyBundleError {
    #[error("invalid pre-key signature: {0}")]
    InvalidSignature(CryptoError),

    #[error(transparent)]
    Lifetime(#[from] LifetimeError),
}

#[cfg(test)]
mod tests {
    use crate::crypto::{Crypto, CryptoProvider};
    use crate::key_bundle::{Lifetime, LongTermKeyBundle, OneTimePreKey, PreKey};
    use crate::traits::KeyBundle;

    use super::{KeyBundleError, OneTimeKeyBundle};

    #[test]
    fn verify() {
        let crypto = Crypto::from_seed([1; 32]);

        let identity_secret = crypto.generate_secret_key().unwrap();
        let identity_key = crypto.public_key(&identity_secret).unwrap();

        let prekey_secret = crypto.generate_secret_key().unwrap();
        let prekey = PreKey::new(
            crypto.public_key(&prekey_secret).unwrap(),
            Lifetime::default(),
        );
        let signature = prekey.sign(&identity_secret, &crypto).unwrap();

        let onetime_secret = crypto.generate_secret_key().unwrap();
        let onetime_prekey = OneTimePreKey::new(crypto.public_key(&onetime_secret).unwrap(), 1);

        let bundle =
            OneTimeKeyBundle::new(identity_key, prekey, signature, Some(onetime_prekey.clone()));
        assert!(bundle.verify(&crypto).is_ok());
        assert_eq!(bundle.onetime_prekey_id(), Some(1));

        let bundle = LongTermKeyBundle::new(identity_key, prekey, signature);
        assert!(bundle.verify(&crypto).is_ok());
        assert_eq!(bundle.onetime_prekey(), None);

        // Expired pre-key.
        let expired = PreKey::new(*prekey.key(), Lifetime::from_range(0, 0));
        let expired_signature = expired.sign(&identity_secret, &crypto).unwrap();
        assert!(matches!(
            LongTermKeyBundle::new(identity_key, expired, expired_signature).verify(&crypto),
            Err(KeyBundleError::Lifetime(_))
        ));

        // Pre-key signed by someone else.
        let other_secret = crypto.generate_secret_key().unwrap();
        let forged_signature = prekey.sign(&other_secret, &crypto).unwrap();
        assert!(matches!(
            OneTimeKeyBundle::new(identity_key, prekey, forged_signature, Some(onetime_prekey))
                .verify(&crypto),
            Err(KeyBundleError::InvalidSignature(_))
        ));
    }
}
