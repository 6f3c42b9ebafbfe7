// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::crypto::x25519::{PUBLIC_KEY_SIZE, PublicKey, SecretKey};
use crate::crypto::signature::Signature;
use crate::crypto::{CryptoError, CryptoProvider};
use crate::key_bundle::{Lifetime, LifetimeError};

/// Signed pre-keys are identified by their public key.
pub type PreKeyId = PublicKey;

/// Medium-term pre-key, signed by the identity key, to be used until its lifetime expired.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey(PublicKey, Lifetime);

impl PreKey {
    pub fn new(prekey: PublicKey, lifetime: Lifetime) -> Self {
        Self(prekey, lifetime)
    }

    pub fn key(&self) -> &PublicKey {
        &self.0
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.1
    }

    /// Bytes covered by the identity signature: the public key and its lifetime.
    pub fn to_signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PUBLIC_KEY_SIZE + 16);
        bytes.extend_from_slice(self.0.as_bytes());
        bytes.extend_from_slice(&self.1.not_before().to_be_bytes());
        bytes.extend_from_slice(&self.1.not_after().to_be_bytes());
        bytes
    }

    pub fn sign<P: CryptoProvider>(
        &self,
        identity_secret: &SecretKey,
        crypto: &P,
    ) -> Result<Signature, CryptoError> {
        crypto.sign(&self.to_signed_bytes(), identity_secret)
    }

    pub fn verify_lifetime(&self) -> Result<(), LifetimeError> {
        self.1.verify()
    }
}

/// Unique identifier of a member's one-time pre-key.
pub type OneTimePreKeyId = u64;

/// Pre-key to be used exactly _once_ during X3DH.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey(PublicKey, OneTimePreKeyId);

impl OneTimePreKey {
    pub fn new(onetime_prekey: PublicKey, id: OneTimePreKeyId) -> Self {
        Self(onetime_prekey, id)
    }

    pub fn key(&self) -> &PublicKey {
        &self.0
    }

    pub fn id(&self) -> OneTimePreKeyId {
        self.1
    }
}

/// Returns the pre-key with a valid lifetime which expires last.
pub fn latest_prekey(prekeys: Vec<&PreKey>) -> Option<&PreKey> {
    prekeys
        .into_iter()
        .filter(|prekey| prekey.verify_lifetime().is_ok())
        .max_by_key(|prekey| prekey.lifetime().not_after())
}

#[cfg(test)]
mod tests {
    use crate::crypto::{Crypto, CryptoProvider};
    use crate::key_bundle::Lifetime;

    use super::{PreKey, latest_prekey};

    #[test]
    fn signature_covers_lifetime() {
        let crypto = Crypto::from_seed([1; 32]);

        let identity_secret = crypto.generate_secret_key().unwrap();
        let identity_key = crypto.public_key(&identity_secret).unwrap();
        let prekey_key = crypto
            .public_key(&crypto.generate_secret_key().unwrap())
            .unwrap();

        let prekey = PreKey::new(prekey_key, Lifetime::from_range(0, u64::MAX));
        let signature = prekey.sign(&identity_secret, &crypto).unwrap();
        assert!(
            crypto
                .verify(&prekey.to_signed_bytes(), &identity_key, &signature)
                .is_ok()
        );

        // Extending the lifetime invalidates the signature.
        let extended = PreKey::new(prekey_key, Lifetime::from_range(0, u64::MAX - 1));
        assert!(
            crypto
                .verify(&extended.to_signed_bytes(), &identity_key, &signature)
                .is_err()
        );
    }

    #[test]
    fn latest_valid_prekey() {
        let crypto = Crypto::from_seed([1; 32]);
        let key = || {
            crypto
                .public_key(&crypto.generate_secret_key().unwrap())
                .unwrap()
        };

        let expired = PreKey::new(key(), Lifetime::from_range(0, 1));
        let short = PreKey::new(key(), Lifetime::from_range(0, u64::MAX - 10));
        let long = PreKey::new(key(), Lifetime::from_range(0, u64::MAX));

        assert_eq!(latest_prekey(vec![&expired, &short, &long]), Some(&long));
        assert_eq!(latest_prekey(vec![&expired]), None);
    }
}
