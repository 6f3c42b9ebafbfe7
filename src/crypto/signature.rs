// SPDX-License-Identifier: MIT OR Apache-2.0

//! XEdDSA signatures made with X25519 identity keys.
//!
//! Members only hold one identity key pair, used for X3DH agreements and for signing their
//! pre-keys. XEdDSA converts the Montgomery keys to twisted Edwards form when signing or
//! verifying.
//!
//! <https://signal.org/docs/specifications/xeddsa/>
use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::{EdwardsPoint, MontgomeryPoint, Scalar};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};

pub const SIGNATURE_SIZE: usize = 64;

/// Prefix of the nonce hash, 2^256 - 2 in little-endian byte order.
const NONCE_HASH_PREFIX: [u8; 32] = {
    let mut prefix = [0xFF; 32];
    prefix[0] = 0xFE;
    prefix
};

/// Signature encoded as `R || s`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] [u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    fn parts(&self) -> ([u8; 32], [u8; 32]) {
        let (r, s) = self.0.split_at(32);
        (
            r.try_into().expect("signature holds r"),
            s.try_into().expect("signature holds s"),
        )
    }
}

/// Signs the bytes with the identity secret.
pub fn sign(
    bytes: &[u8],
    secret_key: &SecretKey,
    rng: &Rng,
) -> Result<Signature, SignatureError> {
    let (public_key, a) = edwards_key_pair(secret_key);
    let nonce: [u8; 64] = rng.random_array()?;

    let r = hash_to_scalar(&[&NONCE_HASH_PREFIX, a.as_bytes(), bytes, &nonce]);
    let cap_r = (&r * ED25519_BASEPOINT_TABLE).compress();
    let h = hash_to_scalar(&[cap_r.as_bytes(), public_key.as_bytes(), bytes]);
    let s = r + h * a;

    let mut signature = [0u8; SIGNATURE_SIZE];
    signature[..32].copy_from_slice(cap_r.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    Ok(Signature(signature))
}

/// Checks a signature over the bytes against the identity key of the signer.
pub fn verify(
    bytes: &[u8],
    public_key: &PublicKey,
    signature: &Signature,
) -> Result<(), SignatureError> {
    let (cap_r, s) = signature.parts();
    let s = Option::<Scalar>::from(Scalar::from_canonical_bytes(s))
        .ok_or(SignatureError::Malformed)?;

    // Public keys are converted with a positive sign, matching the key pair used for signing.
    let a = MontgomeryPoint(public_key.to_bytes())
        .to_edwards(0)
        .ok_or(SignatureError::InvalidPublicKey)?;

    let h = hash_to_scalar(&[&cap_r, a.compress().as_bytes(), bytes]);
    let cap_r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-a, &s).compress();

    if bool::from(cap_r_check.as_bytes().ct_eq(&cap_r)) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Derives the Edwards key pair of an X25519 secret, with the sign bit of the public key cleared.
fn edwards_key_pair(secret_key: &SecretKey) -> (CompressedEdwardsY, Scalar) {
    let k = Scalar::from_bytes_mod_order(*secret_key.as_bytes());
    let mut public_key = (&k * ED25519_BASEPOINT_TABLE).compress();
    let negative = public_key.0[31] >> 7 == 1;
    public_key.0[31] &= 0b0111_1111;
    (public_key, if negative { -k } else { k })
}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let digest = parts
        .iter()
        .fold(Sha512::new(), |hasher, part| hasher.chain_update(part))
        .finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    Scalar::from_bytes_mod_order_wide(&wide)
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("public key is not a valid curve point")]
    InvalidPublicKey,

    #[error("signature is not in canonical form")]
    Malformed,

    #[error("signature does not match public key and bytes")]
    Mismatch,
}
