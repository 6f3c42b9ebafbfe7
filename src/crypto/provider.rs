// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interface and default implementation of all cryptographic primitives used by the session layer.
//!
//! Following algorithms are used by [`Crypto`]:
//! * ChaCha random number generator with 20 rounds
//! * ECDH key agreement with X25519
//! * HKDF with SHA256
//! * XChaCha20-Poly1305 AEAD
//! * XEdDSA signatures with X25519 keys
use thiserror::Error;

use crate::crypto::aead::{AeadError, AeadKey, AeadNonce, aead_decrypt, aead_encrypt};
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{AGREEMENT_SIZE, PublicKey, SecretKey, X25519Error};
use crate::crypto::signature::{self, Signature, SignatureError};
use crate::crypto::{Rng, RngError};

/// Domain separator for deriving group payload keys from epoch secrets.
const GROUP_KDF_INFO: &[u8] = b"e2ee-session group";

/// Provider for Diffie-Hellman key agreement, key derivation (HKDF), authenticated encryption
/// (AEAD), signatures and secure randomness.
///
/// All state machines of this crate are generic over the provider. This allows swapping the
/// algorithms, for example with a hardware-backed implementation, or using a cheap test double.
pub trait CryptoProvider {
    fn random_array<const N: usize>(&self) -> Result<[u8; N], CryptoError>;

    fn generate_secret_key(&self) -> Result<SecretKey, CryptoError> {
        Ok(SecretKey::from_bytes(self.random_array()?))
    }

    fn public_key(&self, secret_key: &SecretKey) -> Result<PublicKey, CryptoError>;

    fn calculate_agreement(
        &self,
        secret_key: &SecretKey,
        their_public_key: &PublicKey,
    ) -> Result<[u8; AGREEMENT_SIZE], CryptoError>;

    fn hkdf<const N: usize>(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: Option<&[u8]>,
    ) -> Result<[u8; N], CryptoError>;

    fn aead_encrypt(
        &self,
        key: &AeadKey,
        plaintext: &[u8],
        nonce: AeadNonce,
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Decrypts and authenticates the ciphertext.
    ///
    /// Must return [`CryptoError::AuthenticationFailed`] if the key, nonce, associated data or
    /// ciphertext do not match.
    fn aead_decrypt(
        &self,
        key: &AeadKey,
        ciphertext_tag: &[u8],
        nonce: AeadNonce,
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError>;

    fn sign(&self, bytes: &[u8], secret_key: &SecretKey) -> Result<Signature, CryptoError>;

    fn verify(
        &self,
        bytes: &[u8],
        public_key: &PublicKey,
        signature: &Signature,
    ) -> Result<(), CryptoError>;

    /// Encrypts a group payload with key material derived from the secret of the given epoch.
    ///
    /// The default implementation derives a symmetric key from the epoch secret. Providers backed
    /// by a group key-agreement library can override this with their own operations.
    fn group_encrypt(
        &self,
        epoch: u64,
        epoch_secret: &[u8],
        plaintext: &[u8],
    ) -> Result<(AeadNonce, Vec<u8>), CryptoError> {
        let key: AeadKey = self.hkdf(&epoch.to_be_bytes(), epoch_secret, Some(GROUP_KDF_INFO))?;
        let nonce: AeadNonce = self.random_array()?;
        let aad = epoch.to_be_bytes();
        let ciphertext = self.aead_encrypt(&key, plaintext, nonce, Some(aad.as_slice()))?;
        Ok((nonce, ciphertext))
    }

    /// Decrypts a group payload which was encrypted with [`CryptoProvider::group_encrypt`].
    fn group_decrypt(
        &self,
        epoch: u64,
        epoch_secret: &[u8],
        nonce: AeadNonce,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key: AeadKey = self.hkdf(&epoch.to_be_bytes(), epoch_secret, Some(GROUP_KDF_INFO))?;
        let aad = epoch.to_be_bytes();
        self.aead_decrypt(&key, ciphertext, nonce, Some(aad.as_slice()))
    }
}

/// Production implementation of [`CryptoProvider`].
#[derive(Debug, Default)]
pub struct Crypto {
    rng: Rng,
}

#[cfg(any(test, feature = "test_utils"))]
impl Crypto {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Rng::from_seed(seed),
        }
    }
}

impl CryptoProvider for Crypto {
    fn random_array<const N: usize>(&self) -> Result<[u8; N], CryptoError> {
        Ok(self.rng.random_array()?)
    }

    fn public_key(&self, secret_key: &SecretKey) -> Result<PublicKey, CryptoError> {
        Ok(secret_key.public_key())
    }

    fn calculate_agreement(
        &self,
        secret_key: &SecretKey,
        their_public_key: &PublicKey,
    ) -> Result<[u8; AGREEMENT_SIZE], CryptoError> {
        Ok(secret_key.calculate_agreement(their_public_key)?)
    }

    fn hkdf<const N: usize>(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: Option<&[u8]>,
    ) -> Result<[u8; N], CryptoError> {
        Ok(hkdf(salt, ikm, info)?)
    }

    fn aead_encrypt(
        &self,
        key: &AeadKey,
        plaintext: &[u8],
        nonce: AeadNonce,
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(aead_encrypt(key, plaintext, nonce, aad)?)
    }

    fn aead_decrypt(
        &self,
        key: &AeadKey,
        ciphertext_tag: &[u8],
        nonce: AeadNonce,
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(aead_decrypt(key, ciphertext_tag, nonce, aad)?)
    }

    fn sign(&self, bytes: &[u8], secret_key: &SecretKey) -> Result<Signature, CryptoError> {
        Ok(signature::sign(bytes, secret_key, &self.rng)?)
    }

    fn verify(
        &self,
        bytes: &[u8],
        public_key: &PublicKey,
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        Ok(signature::verify(bytes, public_key, signature)?)
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("authentication of aead ciphertext failed")]
    AuthenticationFailed,

    #[error(transparent)]
    Aead(AeadError),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

impl From<AeadError> for CryptoError {
    fn from(err: AeadError) -> Self {
        match err {
            AeadError::Decrypt(_) => CryptoError::AuthenticationFailed,
            err => CryptoError::Aead(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Crypto, CryptoError, CryptoProvider};

    #[test]
    fn group_encrypt_decrypt() {
        let crypto = Crypto::from_seed([1; 32]);

        let (nonce, ciphertext) = crypto
            .group_encrypt(4, b"epoch secret", b"Hello, Group!")
            .unwrap();
        let plaintext = crypto
            .group_decrypt(4, b"epoch secret", nonce, &ciphertext)
            .unwrap();
        assert_eq!(plaintext, b"Hello, Group!");

        // Epoch number is bound to the ciphertext.
        assert!(matches!(
            crypto.group_decrypt(5, b"epoch secret", nonce, &ciphertext),
            Err(CryptoError::AuthenticationFailed)
        ));

        // Secret needs to match.
        assert!(matches!(
            crypto.group_decrypt(4, b"other secret", nonce, &ciphertext),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn sign_verify() {
        let crypto = Crypto::from_seed([1; 32]);

        let secret_key = crypto.generate_secret_key().unwrap();
        let public_key = crypto.public_key(&secret_key).unwrap();

        let signature = crypto.sign(b"pre-key", &secret_key).unwrap();
        assert!(crypto.verify(b"pre-key", &public_key, &signature).is_ok());
        assert!(crypto.verify(b"other", &public_key, &signature).is_err());
    }
}
