// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces for the collaborators of the session layer.
mod key_bundle;
mod key_manager;
mod key_store;
mod resync;

pub use key_bundle::KeyBundle;
pub use key_manager::{IdentityManager, PreKeyManager};
pub use key_store::KeyStore;
pub use resync::Resync;
