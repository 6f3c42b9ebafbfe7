// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::cbor::{decode_cbor, encode_cbor};
use crate::key_store::KeyStoreError;
use crate::traits::KeyStore;

/// Volatile key store, clones share the same state.
///
/// Values are kept encoded so that every load returns an independent copy, just like a durable
/// store would.
#[derive(Clone, Debug, Default)]
pub struct MemoryKeyStore {
    inner: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl KeyStore for MemoryKeyStore {
    type Error = KeyStoreError;

    async fn save<T>(&self, key: &str, state: &T) -> Result<(), Self::Error>
    where
        T: Serialize + Sync,
    {
        let bytes = encode_cbor(state)?;
        let mut inner = self.inner.write().await;
        inner.insert(key.to_owned(), bytes);
        Ok(())
    }

    async fn load<T>(&self, key: &str) -> Result<Option<T>, Self::Error>
    where
        T: DeserializeOwned,
    {
        let inner = self.inner.read().await;
        match inner.get(key) {
            Some(bytes) => Ok(Some(decode_cbor(bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.remove(key);
        Ok(())
    }
}
