// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::crypto::CryptoProvider;
use crate::crypto::x25519::PublicKey;
use crate::key_bundle::{KeyBundleError, OneTimePreKeyId};

/// Public key material of a member required to initiate an X3DH key agreement with them.
pub trait KeyBundle {
    fn identity_key(&self) -> &PublicKey;

    fn signed_prekey(&self) -> &PublicKey;

    fn onetime_prekey(&self) -> Option<&PublicKey>;

    fn onetime_prekey_id(&self) -> Option<OneTimePreKeyId>;

    /// Checks the pre-key signature against the identity key and the pre-key lifetime.
    fn verify<P: CryptoProvider>(&self, crypto: &P) -> Result<(), KeyBundleError>;
}
