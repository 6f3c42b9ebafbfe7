// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key bundles a member publishes in the network to asynchronously receive encrypted messages
//! from others.
//!
//! This is for asynchronous settings where one user ("Bob") is offline but has published a key
//! bundle (identity key, signed pre-key and optionally a one-time pre-key) beforehand. Another
//! user ("Alice") uses it to establish a session with Bob through X3DH.
//!
//! Depending on the required forward secrecy a bundle should be used only once with
//! [`OneTimeKeyBundle`] or only within a given lifetime with [`LongTermKeyBundle`].
#[allow(clippy::module_inception)]
mod key_bundle;
mod lifetime;
mod prekey;

pub use key_bundle::{KeyBundleError, LongTermKeyBundle, OneTimeKeyBundle};
pub use lifetime::{DEFAULT_LIFETIME, Lifetime, LifetimeError};
pub use prekey::{OneTimePreKey, OneTimePreKeyId, PreKey, PreKeyId, latest_prekey};
