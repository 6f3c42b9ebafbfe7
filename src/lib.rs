// SPDX-License-Identifier: MIT OR Apache-2.0

//! `e2ee-session` maintains the cryptographic state of end-to-end encrypted conversations on top
//! of a transport which delivers opaque ciphertexts out of order, duplicated or with arbitrary
//! delay.
//!
//! ## Pairwise sessions
//!
//! Pairwise sessions are bootstrapped asynchronously with Signal's
//! [X3DH](https://signal.org/docs/specifications/x3dh) key-agreement: a member publishes a key
//! bundle (identity key, signed pre-key and optionally a one-time pre-key) and goes offline,
//! others can establish a session with them from that bundle alone. The resulting secret seeds a
//! [Double Ratchet](https://signal.org/docs/specifications/doubleratchet) which derives a fresh
//! key for every message. Message keys are deleted right after they have been used (forward
//! secrecy) and every round-trip mixes fresh Diffie-Hellman output into the root key
//! (post-compromise security).
//!
//! Messages can arrive in any order. Keys for skipped messages are cached in a bounded map until
//! the late message arrives, a peer can not make us derive more than a configured number of keys
//! ahead. A message which fails to decrypt never changes the session state.
//!
//! ## Groups
//!
//! Group key-agreement itself (for example with MLS) is handled by an external group collaborator
//! which reports every new epoch with its secret. This crate keeps a sliding window of recent
//! epochs, so messages sent shortly before a membership change can still be decrypted, and
//! buffers messages which arrive before we learned about their epoch. Buffered messages are
//! replayed in arrival order as soon as the epoch becomes available. When too many messages are
//! waiting or they wait for too long, the collaborator is asked to resynchronise.
//!
//! ## Usage
//!
//! [`SessionManager`] and [`GroupManager`] expose the high-level operations. They persist all
//! state in a [`KeyStore`](traits::KeyStore) and serialise concurrent calls for the same session
//! or group while letting independent sessions proceed in parallel. All cryptography is provided
//! through the [`CryptoProvider`](crypto::CryptoProvider) interface.
//!
//! The lower-level state machines ([`DoubleRatchet`](ratchet::DoubleRatchet),
//! [`GroupSession`](group::GroupSession), [`x3dh_initiate`] and [`x3dh_respond`]) are pure and can
//! be used directly by applications which manage persistence themselves.
//!
//! ## Security
//!
//! Envelope meta-data (ratchet keys, counters and epoch numbers) is not encrypted. Multi-device
//! key synchronisation is out of scope and this crate is not secure against
//! harvest-now-decrypt-later quantum adversaries.
mod bounded_map;
pub mod cbor;
mod config;
pub mod crypto;
pub mod group;
mod key_bundle;
mod key_manager;
pub mod key_store;
mod manager;
pub mod ratchet;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod traits;
mod x3dh;

pub use bounded_map::BoundedMap;
pub use config::{Config, GroupConfig, RatchetConfig};
pub use key_bundle::{
    DEFAULT_LIFETIME, KeyBundleError, Lifetime, LifetimeError, LongTermKeyBundle, OneTimeKeyBundle,
    OneTimePreKey, OneTimePreKeyId, PreKey, PreKeyId,
};
pub use key_manager::{KeyManager, KeyManagerError, KeyManagerState};
pub use manager::{GroupManager, GroupManagerError, SessionError, SessionManager, StoreError};
pub use x3dh::{X3dhError, X3dhInitiation, X3dhOutput, x3dh_initiate, x3dh_respond};
