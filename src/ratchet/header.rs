// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::x25519::{PUBLIC_KEY_SIZE, PublicKey};

/// Size of an encoded header: ratchet key, previous chain length and message counter.
pub const HEADER_SIZE: usize = PUBLIC_KEY_SIZE + 4 + 4;

/// Public header sent along every ratchet ciphertext.
///
/// Headers are not secret but authenticated as associated data of the AEAD.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
    /// Current ratchet public key of the sender.
    pub ratchet_key: PublicKey,

    /// Number of messages in the sender's previous sending chain.
    pub previous_chain_length: u32,

    /// Position of this message in the sender's current sending chain.
    pub counter: u32,
}

impl Header {
    /// Fixed-size big-endian encoding.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];
        bytes[..PUBLIC_KEY_SIZE].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + 4]
            .copy_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes[PUBLIC_KEY_SIZE + 4..].copy_from_slice(&self.counter.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        let bytes: &[u8; HEADER_SIZE] = bytes
            .try_into()
            .map_err(|_| HeaderError::InvalidLength(bytes.len()))?;

        let (ratchet_key, rest) = bytes.split_at(PUBLIC_KEY_SIZE);
        let (previous_chain_length, counter) = rest.split_at(4);

        Ok(Self {
            ratchet_key: PublicKey::from_bytes(
                ratchet_key.try_into().expect("split at public key size"),
            ),
            previous_chain_length: u32::from_be_bytes(
                previous_chain_length.try_into().expect("split at 4 bytes"),
            ),
            counter: u32::from_be_bytes(counter.try_into().expect("split at 4 bytes")),
        })
    }
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("invalid header length {0}, expected {HEADER_SIZE} bytes")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::crypto::x25519::PublicKey;

    use super::{HEADER_SIZE, Header, HeaderError};

    #[test]
    fn big_endian_layout() {
        let header = Header {
            ratchet_key: PublicKey::from_bytes([7; 32]),
            previous_chain_length: 0x0102_0304,
            counter: 5,
        };

        let bytes = header.to_bytes();
        assert_eq!(&bytes[..32], &[7; 32]);
        assert_eq!(&bytes[32..36], &[1, 2, 3, 4]);
        assert_eq!(&bytes[36..], &[0, 0, 0, 5]);
        assert_eq!(Header::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn invalid_length() {
        assert_matches!(
            Header::from_bytes(&[0; HEADER_SIZE - 1]),
            Err(HeaderError::InvalidLength(39))
        );
        assert_matches!(
            Header::from_bytes(&[0; HEADER_SIZE + 1]),
            Err(HeaderError::InvalidLength(41))
        );
    }
}
