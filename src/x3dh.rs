// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extended Triple Diffie-Hellman (X3DH) key agreement.
//!
//! X3DH establishes a shared secret between two parties who mutually authenticate each other
//! based on public keys, even when the responder is offline and only published a key bundle.
//!
//! The derived key material seeds the root key of a [Double Ratchet](crate::ratchet) session.
//!
//! <https://signal.org/docs/specifications/x3dh/>
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::x25519::{AGREEMENT_SIZE, PUBLIC_KEY_SIZE, PublicKey, SecretKey};
use crate::crypto::{CryptoError, CryptoProvider, Secret};
use crate::key_bundle::{KeyBundleError, OneTimePreKeyId};
use crate::traits::KeyBundle;

/// ASCII string identifying the application, used as info for the KDF.
const KDF_INFO: &[u8] = b"e2ee-session x3dh";

/// Public values the initiator sends to the responder together with its first message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct X3dhInitiation {
    pub identity_key: PublicKey,
    pub ephemeral_key: PublicKey,
    /// Signed pre-key of the responder which was used, so it can look up the secret.
    pub signed_prekey: PublicKey,
    pub onetime_prekey_id: Option<OneTimePreKeyId>,
}

/// Key material both parties derive from a successful handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct X3dhOutput {
    pub(crate) shared_secret: Secret<32>,
    pub(crate) ratchet_seed: Secret<32>,
    pub(crate) associated_data: Vec<u8>,
}

impl X3dhOutput {
    /// Secret both parties agreed on, independent from the ratchet seed.
    ///
    /// Can be used to bind additional channels to the session. Never send it over the wire.
    pub fn shared_secret(&self) -> &[u8; 32] {
        self.shared_secret.as_bytes()
    }

    /// Identity keys of initiator and responder, to be bound to every message of the session.
    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }
}

/// Runs the handshake against the published key bundle of the responder.
pub fn x3dh_initiate<K: KeyBundle, P: CryptoProvider>(
    our_identity_secret: &SecretKey,
    their_bundle: &K,
    crypto: &P,
) -> Result<(X3dhInitiation, X3dhOutput), X3dhError> {
    their_bundle.verify(crypto)?;

    let our_identity_key = crypto.public_key(our_identity_secret)?;
    let our_ephemeral_secret = crypto.generate_secret_key()?;
    let our_ephemeral_key = crypto.public_key(&our_ephemeral_secret)?;

    let mut agreements = vec![
        // DH1 = DH(IK_A, SPK_B)
        crypto.calculate_agreement(our_identity_secret, their_bundle.signed_prekey())?,
        // DH2 = DH(EK_A, IK_B)
        crypto.calculate_agreement(&our_ephemeral_secret, their_bundle.identity_key())?,
        // DH3 = DH(EK_A, SPK_B)
        crypto.calculate_agreement(&our_ephemeral_secret, their_bundle.signed_prekey())?,
    ];

    // DH4 = DH(EK_A, OPK_B)
    if let Some(onetime_prekey) = their_bundle.onetime_prekey() {
        agreements.push(crypto.calculate_agreement(&our_ephemeral_secret, onetime_prekey)?);
    }

    let output = derive_output(
        &agreements,
        &our_identity_key,
        their_bundle.identity_key(),
        crypto,
    )?;

    debug!(
        their_identity = %their_bundle.identity_key(),
        onetime = their_bundle.onetime_prekey_id().is_some(),
        "initiated x3dh handshake"
    );

    let initiation = X3dhInitiation {
        identity_key: our_identity_key,
        ephemeral_key: our_ephemeral_key,
        signed_prekey: *their_bundle.signed_prekey(),
        onetime_prekey_id: their_bundle.onetime_prekey_id(),
    };

    Ok((initiation, output))
}

/// Mirrors the handshake with the responder's secrets.
///
/// The one-time pre-key secret must be given exactly when the initiator used one. Callers are
/// responsible for removing it from their key material afterwards.
pub fn x3dh_respond<P: CryptoProvider>(
    their_initiation: &X3dhInitiation,
    our_identity_secret: &SecretKey,
    our_prekey_secret: &SecretKey,
    our_onetime_secret: Option<&SecretKey>,
    crypto: &P,
) -> Result<X3dhOutput, X3dhError> {
    if their_initiation.onetime_prekey_id.is_some() != our_onetime_secret.is_some() {
        return Err(X3dhError::OneTimePreKeyMismatch);
    }

    let our_identity_key = crypto.public_key(our_identity_secret)?;

    let mut agreements = vec![
        // DH1 = DH(SPK_B, IK_A)
        crypto.calculate_agreement(our_prekey_secret, &their_initiation.identity_key)?,
        // DH2 = DH(IK_B, EK_A)
        crypto.calculate_agreement(our_identity_secret, &their_initiation.ephemeral_key)?,
        // DH3 = DH(SPK_B, EK_A)
        crypto.calculate_agreement(our_prekey_secret, &their_initiation.ephemeral_key)?,
    ];

    // DH4 = DH(OPK_B, EK_A)
    if let Some(our_onetime_secret) = our_onetime_secret {
        agreements.push(
            crypto.calculate_agreement(our_onetime_secret, &their_initiation.ephemeral_key)?,
        );
    }

    let output = derive_output(
        &agreements,
        &their_initiation.identity_key,
        &our_identity_key,
        crypto,
    )?;

    debug!(
        their_identity = %their_initiation.identity_key,
        onetime = their_initiation.onetime_prekey_id.is_some(),
        "responded to x3dh handshake"
    );

    Ok(output)
}

fn derive_output<P: CryptoProvider>(
    agreements: &[[u8; AGREEMENT_SIZE]],
    initiator_identity_key: &PublicKey,
    responder_identity_key: &PublicKey,
    crypto: &P,
) -> Result<X3dhOutput, X3dhError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(AGREEMENT_SIZE * (agreements.len() + 1)));
    ikm.extend_from_slice(&[0xFF; AGREEMENT_SIZE]); // "discontinuity bytes"
    for agreement in agreements {
        ikm.extend_from_slice(agreement);
    }

    let okm: Secret<64> = Secret::from_bytes(crypto.hkdf(&[0; 32], &ikm, Some(KDF_INFO))?);
    drop(ikm);

    let (shared_secret, ratchet_seed) = okm.as_bytes().split_at(32);

    let mut associated_data = Vec::with_capacity(PUBLIC_KEY_SIZE * 2);
    associated_data.extend_from_slice(initiator_identity_key.as_bytes());
    associated_data.extend_from_slice(responder_identity_key.as_bytes());

    Ok(X3dhOutput {
        shared_secret: Secret::from_bytes(
            shared_secret.try_into().expect("okm has 64 bytes"),
        ),
        ratchet_seed: Secret::from_bytes(ratchet_seed.try_into().expect("okm has 64 bytes")),
        associated_data,
    })
}

#[derive(Debug, Error)]
pub enum X3dhError {
    #[error("invalid key bundle: {0}")]
    InvalidBundle(#[from] KeyBundleError),

    #[error("one-time pre-key secret does not match the initiator's handshake")]
    OneTimePreKeyMismatch,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
