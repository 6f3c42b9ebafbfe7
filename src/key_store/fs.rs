// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::cbor::{decode_cbor, encode_cbor};
use crate::key_store::KeyStoreError;
use crate::traits::KeyStore;

/// Key store persisting every key in its own file inside a directory.
///
/// File names are the hex-encoded keys. New state is written to a temporary file, flushed to
/// disk and then renamed over the previous file. An interrupted save therefore leaves either the
/// old or the new state behind.
#[derive(Clone, Debug)]
pub struct FsKeyStore {
    root: PathBuf,
}

impl FsKeyStore {
    /// Opens the store in the given directory, creating it if necessary.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(key))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.tmp", hex::encode(key)))
    }

    /// Writes the bytes to a temporary file and moves it over the target once it is on disk.
    async fn replace(&self, tmp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(tmp_path, path).await
    }

    /// Makes a completed rename durable.
    async fn sync_root(&self) -> Result<(), KeyStoreError> {
        fs::File::open(&self.root).await?.sync_all().await?;
        Ok(())
    }
}

impl KeyStore for FsKeyStore {
    type Error = KeyStoreError;

    async fn save<T>(&self, key: &str, state: &T) -> Result<(), Self::Error>
    where
        T: Serialize + Sync,
    {
        let bytes = encode_cbor(state)?;
        let tmp_path = self.tmp_path(key);

        if let Err(err) = self.replace(&tmp_path, &self.path(key), &bytes).await {
            if let Err(cleanup) = fs::remove_file(&tmp_path).await
                && cleanup.kind() != ErrorKind::NotFound
            {
                warn!(key, %cleanup, "could not remove temporary file");
            }
            return Err(err.into());
        }
        self.sync_root().await?;

        debug!(key, size = bytes.len(), "saved state");
        Ok(())
    }

    async fn load<T>(&self, key: &str) -> Result<Option<T>, Self::Error>
    where
        T: DeserializeOwned,
    {
        match fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(decode_cbor(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        match fs::remove_file(self.path(key)).await {
            Ok(()) => self.sync_root().await,
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
