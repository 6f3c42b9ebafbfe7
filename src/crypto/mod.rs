// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives behind the [`CryptoProvider`] interface.
pub mod aead;
pub mod hkdf;
mod provider;
mod rng;
mod secret;
pub mod signature;
pub mod x25519;

pub use provider::{Crypto, CryptoError, CryptoProvider};
pub use rng::{Rng, RngError};
pub(crate) use secret::Secret;
