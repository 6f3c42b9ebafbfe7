// SPDX-License-Identifier: MIT OR Apache-2.0

//! Implementations of the [`KeyStore`](crate::traits::KeyStore) interface.
//!
//! State is stored under string keys, encoded as CBOR.
mod fs;
mod memory;

use thiserror::Error;

use crate::cbor::{DecodeError, EncodeError};

pub use fs::FsKeyStore;
pub use memory::MemoryKeyStore;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("key store i/o failed: {0}")]
    Io(#[from] std::io::Error),
}
