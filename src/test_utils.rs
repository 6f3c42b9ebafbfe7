// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test doubles for the crypto provider and the resync callback.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};

use crate::crypto::aead::{AeadKey, AeadNonce};
use crate::crypto::hkdf::hkdf;
use crate::crypto::signature::{SIGNATURE_SIZE, Signature, SignatureError};
use crate::crypto::x25519::{AGREEMENT_SIZE, PublicKey, SecretKey};
use crate::crypto::{CryptoError, CryptoProvider};
use crate::group::ResyncRequest;
use crate::traits::Resync;

const TAG_SIZE: usize = 16;

fn digest(parts: &[&[u8]]) -> [u8; 32] {
    parts
        .iter()
        .fold(Sha256::new(), |hasher, part| hasher.chain_update(part))
        .finalize()
        .into()
}

/// Keyed by the public key, anyone can compute it.
fn insecure_signature(public_key: &PublicKey, bytes: &[u8]) -> Signature {
    let mut signature = [0u8; SIGNATURE_SIZE];
    signature[..32].copy_from_slice(&digest(&[b"signature r", public_key.as_bytes(), bytes]));
    signature[32..].copy_from_slice(&digest(&[b"signature s", public_key.as_bytes(), bytes]));
    Signature::from_bytes(signature)
}

/// Deterministic and fast provider built from hash functions only.
///
/// Agreements can be computed by anyone who knows both public keys. Never use this outside of
/// tests.
#[derive(Debug)]
pub struct InsecureCrypto {
    seed: [u8; 32],
    counter: AtomicU64,
}

impl InsecureCrypto {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            counter: AtomicU64::new(0),
        }
    }

    fn keystream(key: &AeadKey, nonce: &AeadNonce, len: usize) -> Vec<u8> {
        let mut stream = Vec::with_capacity(len + 32);
        let mut block = 0u64;
        while stream.len() < len {
            stream.extend_from_slice(&digest(&[b"stream", key, nonce, &block.to_be_bytes()]));
            block += 1;
        }
        stream.truncate(len);
        stream
    }

    fn tag(key: &AeadKey, nonce: &AeadNonce, aad: Option<&[u8]>, ciphertext: &[u8]) -> [u8; 16] {
        let aad = aad.unwrap_or_default();
        let digest = digest(&[
            b"tag",
            key,
            nonce,
            &(aad.len() as u64).to_be_bytes(),
            aad,
            ciphertext,
        ]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&digest[..TAG_SIZE]);
        tag
    }
}

impl Default for InsecureCrypto {
    fn default() -> Self {
        Self::new([0; 32])
    }
}

impl CryptoProvider for InsecureCrypto {
    fn random_array<const N: usize>(&self) -> Result<[u8; N], CryptoError> {
        let mut out = [0u8; N];
        for chunk in out.chunks_mut(32) {
            let counter = self.counter.fetch_add(1, Ordering::Relaxed);
            let digest = digest(&[&self.seed, &counter.to_be_bytes()]);
            chunk.copy_from_slice(&digest[..chunk.len()]);
        }
        Ok(out)
    }

    fn public_key(&self, secret_key: &SecretKey) -> Result<PublicKey, CryptoError> {
        Ok(PublicKey::from_bytes(digest(&[
            b"public",
            secret_key.as_bytes(),
        ])))
    }

    fn calculate_agreement(
        &self,
        secret_key: &SecretKey,
        their_public_key: &PublicKey,
    ) -> Result<[u8; AGREEMENT_SIZE], CryptoError> {
        let our_public_key = self.public_key(secret_key)?;
        let (a, b) = if our_public_key.as_bytes() <= their_public_key.as_bytes() {
            (our_public_key, *their_public_key)
        } else {
            (*their_public_key, our_public_key)
        };
        Ok(digest(&[b"agreement", a.as_bytes(), b.as_bytes()]))
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
        let stream = Self::keystream(key, &nonce, plaintext.len());
        let mut ciphertext: Vec<u8> = plaintext
            .iter()
            .zip(stream)
            .map(|(byte, key)| byte ^ key)
            .collect();
        let tag = Self::tag(key, &nonce, aad, &ciphertext);
        ciphertext.extend_from_slice(&tag);
        Ok(ciphertext)
    }

    fn aead_decrypt(
        &self,
        key: &AeadKey,
        ciphertext_tag: &[u8],
        nonce: AeadNonce,
        aad: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        let Some(split) = ciphertext_tag.len().checked_sub(TAG_SIZE) else {
            return Err(CryptoError::AuthenticationFailed);
        };
        let (ciphertext, tag) = ciphertext_tag.split_at(split);
        if Self::tag(key, &nonce, aad, ciphertext) != tag {
            return Err(CryptoError::AuthenticationFailed);
        }

        let stream = Self::keystream(key, &nonce, ciphertext.len());
        Ok(ciphertext
            .iter()
            .zip(stream)
            .map(|(byte, key)| byte ^ key)
            .collect())
    }

    fn sign(&self, bytes: &[u8], secret_key: &SecretKey) -> Result<Signature, CryptoError> {
        Ok(insecure_signature(&self.public_key(secret_key)?, bytes))
    }

    fn verify(
        &self,
        bytes: &[u8],
        public_key: &PublicKey,
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        if &insecure_signature(public_key, bytes) != signature {
            return Err(SignatureError::Mismatch.into());
        }
        Ok(())
    }
}

/// Resync callback remembering every request.
#[derive(Clone, Debug)]
pub struct RecordingResync<ID> {
    requests: Arc<Mutex<Vec<(ID, ResyncRequest)>>>,
}

impl<ID> Default for RecordingResync<ID> {
    fn default() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<ID: Clone> RecordingResync<ID> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<(ID, ResyncRequest)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<ID: Clone> Resync<ID> for RecordingResync<ID> {
    fn resync(&self, group_id: &ID, request: ResyncRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((group_id.clone(), request));
    }
}
