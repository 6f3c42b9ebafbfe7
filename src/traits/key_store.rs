// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Durable storage for session and group state.
///
/// Implementations must be crash-consistent: an interrupted `save` leaves either the previous or
/// the new state behind, never a mix of both. Otherwise a session could end up decrypting the
/// same message twice with different outcomes.
pub trait KeyStore {
    type Error: Error + Send + Sync + 'static;

    fn save<T>(&self, key: &str, state: &T) -> impl Future<Output = Result<(), Self::Error>>
    where
        T: Serialize + Sync;

    fn load<T>(&self, key: &str) -> impl Future<Output = Result<Option<T>, Self::Error>>
    where
        T: DeserializeOwned;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}
