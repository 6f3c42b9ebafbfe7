// SPDX-License-Identifier: MIT OR Apache-2.0

//! Double Ratchet for pairwise sessions, seeded by an [X3DH](crate::x3dh) handshake.
//!
//! Every message is encrypted with a fresh message key derived from a sending chain. Whenever a
//! new ratchet key of the peer shows up, both chains are replaced by a Diffie-Hellman ratchet
//! step, mixing fresh key material into the root key.
//!
//! Messages may arrive out of order. Keys for messages we jumped over are derived ahead of time
//! and cached until they get used, bounded by [`RatchetConfig`].
//!
//! ```text
//!  root key ──KDF_RK──> root key ──KDF_RK──> root key ...
//!                │                  │
//!          receiving chain    sending chain
//!                │                  │
//!             KDF_CK             KDF_CK
//!                │                  │
//!           message key        message key
//! ```
//!
//! <https://signal.org/docs/specifications/doubleratchet/>
mod header;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bounded_map::BoundedMap;
use crate::config::RatchetConfig;
use crate::crypto::aead::AeadNonce;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{CryptoError, CryptoProvider, Secret};
use crate::x3dh::X3dhOutput;

pub use header::{HEADER_SIZE, Header, HeaderError};

pub const ROOT_KEY_SIZE: usize = 32;

pub const CHAIN_KEY_SIZE: usize = 32;

pub const MESSAGE_KEY_SIZE: usize = 32;

const ROOT_KDF_INFO: &[u8] = b"e2ee-session root";

const MESSAGE_KDF_INFO: &[u8] = b"e2ee-session message";

const CHAIN_KDF_INFO: &[u8] = b"e2ee-session chain";

const INITIAL_CHAIN_KDF_INFO: &[u8] = b"e2ee-session initial chain";

type SkippedKeyId = (PublicKey, u32);

pub struct DoubleRatchet;

/// Serializable state of a pairwise session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: Secret<ROOT_KEY_SIZE>,
    our_ratchet_secret: SecretKey,
    our_ratchet_key: PublicKey,
    their_ratchet_key: Option<PublicKey>,
    sending_chain: Option<Chain>,
    receiving_chain: Option<Chain>,
    previous_sending_length: u32,
    skipped_keys: BoundedMap<SkippedKeyId, Secret<MESSAGE_KEY_SIZE>>,
    retired_keys: BoundedMap<PublicKey, ()>,
    #[serde(with = "serde_bytes")]
    associated_data: Vec<u8>,
    max_skip: u32,
}

impl RatchetState {
    pub fn our_ratchet_key(&self) -> &PublicKey {
        &self.our_ratchet_key
    }

    pub fn their_ratchet_key(&self) -> Option<&PublicKey> {
        self.their_ratchet_key.as_ref()
    }

    /// Number of messages sent in the current sending chain.
    pub fn sending_counter(&self) -> u32 {
        self.sending_chain.as_ref().map_or(0, |chain| chain.counter)
    }

    /// Number of messages received or skipped in the current receiving chain.
    pub fn receiving_counter(&self) -> u32 {
        self.receiving_chain.as_ref().map_or(0, |chain| chain.counter)
    }

    /// Number of cached message keys for messages which did not arrive yet.
    pub fn skipped_keys_len(&self) -> usize {
        self.skipped_keys.len()
    }

    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    fn aad(&self, header: &Header) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.associated_data.len() + HEADER_SIZE);
        aad.extend_from_slice(&self.associated_data);
        aad.extend_from_slice(&header.to_bytes());
        aad
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Chain {
    key: Secret<CHAIN_KEY_SIZE>,
    counter: u32,
}

impl Chain {
    fn new(key: Secret<CHAIN_KEY_SIZE>) -> Self {
        Self { key, counter: 0 }
    }

    /// Chain used by a party before it performed its first Diffie-Hellman ratchet step.
    fn initial<P: CryptoProvider>(
        root_key: &Secret<ROOT_KEY_SIZE>,
        crypto: &P,
    ) -> Result<Self, RatchetError> {
        let key = crypto.hkdf(&[], root_key.as_bytes(), Some(INITIAL_CHAIN_KDF_INFO))?;
        Ok(Self::new(Secret::from_bytes(key)))
    }

    /// Returns the message key for the current position and moves the chain forward.
    fn advance<P: CryptoProvider>(
        &mut self,
        crypto: &P,
    ) -> Result<Secret<MESSAGE_KEY_SIZE>, RatchetError> {
        let counter = self
            .counter
            .checked_add(1)
            .ok_or(RatchetError::ChainExhausted)?;
        let message_key = crypto.hkdf(&[], self.key.as_bytes(), Some(MESSAGE_KDF_INFO))?;
        let chain_key = crypto.hkdf(&[], self.key.as_bytes(), Some(CHAIN_KDF_INFO))?;
        self.key = Secret::from_bytes(chain_key);
        self.counter = counter;
        Ok(Secret::from_bytes(message_key))
    }
}

/// Encrypted message with the header the receiver needs to find the right key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetCiphertext {
    pub header: Header,
    #[serde(with = "serde_bytes")]
    pub nonce: AeadNonce,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl DoubleRatchet {
    /// Initialises the session of the party who ran the X3DH handshake against a key bundle.
    ///
    /// The signed pre-key of the responder serves as its first ratchet key. We perform a
    /// Diffie-Hellman ratchet step right away to derive our sending chain. The responder might
    /// send before hearing from us, for this we prepare its initial chain as our receiving chain.
    pub fn init_initiator<P: CryptoProvider>(
        x3dh: &X3dhOutput,
        their_signed_prekey: PublicKey,
        config: &RatchetConfig,
        crypto: &P,
    ) -> Result<RatchetState, RatchetError> {
        let our_ratchet_secret = crypto.generate_secret_key()?;
        let our_ratchet_key = crypto.public_key(&our_ratchet_secret)?;

        let receiving_chain = Chain::initial(&x3dh.ratchet_seed, crypto)?;

        let agreement = crypto.calculate_agreement(&our_ratchet_secret, &their_signed_prekey)?;
        let (root_key, sending_key) = kdf_rk(&x3dh.ratchet_seed, &agreement, crypto)?;

        debug!(ratchet_key = %our_ratchet_key, "initialised ratchet as initiator");

        Ok(RatchetState {
            root_key,
            our_ratchet_secret,
            our_ratchet_key,
            their_ratchet_key: Some(their_signed_prekey),
            sending_chain: Some(Chain::new(sending_key)),
            receiving_chain: Some(receiving_chain),
            previous_sending_length: 0,
            skipped_keys: BoundedMap::new(config.max_skipped_keys),
            retired_keys: BoundedMap::new(config.max_retired_keys),
            associated_data: x3dh.associated_data.clone(),
            max_skip: config.max_skip,
        })
    }

    /// Initialises the session of the party whose key bundle was used in the X3DH handshake.
    ///
    /// Our signed pre-key is our first ratchet key. No chains exist until the first message is
    /// sent or received.
    pub fn init_responder<P: CryptoProvider>(
        x3dh: &X3dhOutput,
        our_prekey_secret: &SecretKey,
        config: &RatchetConfig,
        crypto: &P,
    ) -> Result<RatchetState, RatchetError> {
        let our_ratchet_key = crypto.public_key(our_prekey_secret)?;

        debug!(ratchet_key = %our_ratchet_key, "initialised ratchet as responder");

        Ok(RatchetState {
            root_key: x3dh.ratchet_seed.clone(),
            our_ratchet_secret: our_prekey_secret.clone(),
            our_ratchet_key,
            their_ratchet_key: None,
            sending_chain: None,
            receiving_chain: None,
            previous_sending_length: 0,
            skipped_keys: BoundedMap::new(config.max_skipped_keys),
            retired_keys: BoundedMap::new(config.max_retired_keys),
            associated_data: x3dh.associated_data.clone(),
            max_skip: config.max_skip,
        })
    }

    pub fn encrypt<P: CryptoProvider>(
        mut y: RatchetState,
        plaintext: &[u8],
        crypto: &P,
    ) -> Result<(RatchetState, RatchetCiphertext), RatchetError> {
        let mut chain = match y.sending_chain.take() {
            Some(chain) => chain,
            None => Chain::initial(&y.root_key, crypto)?,
        };

        let header = Header {
            ratchet_key: y.our_ratchet_key,
            previous_chain_length: y.previous_sending_length,
            counter: chain.counter,
        };
        let message_key = chain.advance(crypto)?;
        y.sending_chain = Some(chain);

        let nonce: AeadNonce = crypto.random_array()?;
        let aad = y.aad(&header);
        let ciphertext =
            crypto.aead_encrypt(message_key.as_bytes(), plaintext, nonce, Some(&aad[..]))?;

        Ok((
            y,
            RatchetCiphertext {
                header,
                nonce,
                ciphertext,
            },
        ))
    }

    /// Decrypts a message and returns the successor state.
    ///
    /// The given state is never modified. On any error the caller keeps using it as if the
    /// message never arrived.
    pub fn decrypt<P: CryptoProvider>(
        y: &RatchetState,
        message: &RatchetCiphertext,
        crypto: &P,
    ) -> Result<(RatchetState, Vec<u8>), RatchetError> {
        let header = &message.header;
        let mut y_i = y.clone();

        // Message we skipped over earlier, the key gets deleted after use.
        if let Some(message_key) = y_i
            .skipped_keys
            .remove(&(header.ratchet_key, header.counter))
        {
            let plaintext = Self::decrypt_inner(&y_i, &message_key, message, crypto)?;
            return Ok((y_i, plaintext));
        }

        // Chains of retired ratchet keys are closed, everything not skipped was delivered.
        if y_i.retired_keys.contains_key(&header.ratchet_key) {
            return Err(RatchetError::DuplicateOrUnknownMessage(
                header.ratchet_key,
                header.counter,
            ));
        }

        if y_i.their_ratchet_key != Some(header.ratchet_key) {
            // A new chain of the peer closes the current one after at least as many messages as
            // we received on it. Anything else is a replay from a chain we forgot about.
            if y_i.their_ratchet_key.is_some()
                && y_i.receiving_chain.is_some()
                && header.previous_chain_length < y_i.receiving_counter()
            {
                debug!(
                    ratchet_key = %header.ratchet_key,
                    previous_chain_length = header.previous_chain_length,
                    received = y_i.receiving_counter(),
                    "rejected message claiming an outdated chain"
                );
                return Err(RatchetError::DuplicateOrUnknownMessage(
                    header.ratchet_key,
                    header.counter,
                ));
            }

            Self::skip_message_keys(&mut y_i, header.previous_chain_length, crypto)?;
            Self::dh_ratchet_step(&mut y_i, header.ratchet_key, crypto)?;
        }

        if header.counter < y_i.receiving_counter() {
            return Err(RatchetError::DuplicateOrUnknownMessage(
                header.ratchet_key,
                header.counter,
            ));
        }

        Self::skip_message_keys(&mut y_i, header.counter, crypto)?;

        let message_key = match y_i.receiving_chain.as_mut() {
            Some(chain) => chain.advance(crypto)?,
            None => {
                return Err(RatchetError::DuplicateOrUnknownMessage(
                    header.ratchet_key,
                    header.counter,
                ));
            }
        };

        let plaintext = Self::decrypt_inner(&y_i, &message_key, message, crypto)?;
        Ok((y_i, plaintext))
    }

    fn decrypt_inner<P: CryptoProvider>(
        y: &RatchetState,
        message_key: &Secret<MESSAGE_KEY_SIZE>,
        message: &RatchetCiphertext,
        crypto: &P,
    ) -> Result<Vec<u8>, RatchetError> {
        let aad = y.aad(&message.header);
        crypto
            .aead_decrypt(
                message_key.as_bytes(),
                &message.ciphertext,
                message.nonce,
                Some(aad.as_slice()),
            )
            .map_err(|err| match err {
                CryptoError::AuthenticationFailed => RatchetError::DecryptionFailed,
                err => RatchetError::Crypto(err),
            })
    }

    /// Derives and caches the keys of the current receiving chain up to the given counter.
    fn skip_message_keys<P: CryptoProvider>(
        y: &mut RatchetState,
        until: u32,
        crypto: &P,
    ) -> Result<(), RatchetError> {
        let (Some(their_ratchet_key), Some(chain)) =
            (y.their_ratchet_key, y.receiving_chain.as_mut())
        else {
            return Ok(());
        };

        if until <= chain.counter {
            return Ok(());
        }

        let requested = until - chain.counter;
        if requested > y.max_skip {
            warn!(
                ratchet_key = %their_ratchet_key,
                requested,
                max = y.max_skip,
                "refused to skip message keys"
            );
            return Err(RatchetError::SkipLimitExceeded {
                requested,
                max: y.max_skip,
            });
        }

        while chain.counter < until {
            let counter = chain.counter;
            let message_key = chain.advance(crypto)?;
            let evicted = y
                .skipped_keys
                .insert((their_ratchet_key, counter), message_key);
            if !evicted.is_empty() {
                warn!(
                    evicted = evicted.len(),
                    "evicted oldest skipped message keys"
                );
            }
        }

        debug!(ratchet_key = %their_ratchet_key, skipped = requested, "skipped message keys");

        Ok(())
    }

    fn dh_ratchet_step<P: CryptoProvider>(
        y: &mut RatchetState,
        their_ratchet_key: PublicKey,
        crypto: &P,
    ) -> Result<(), RatchetError> {
        if let Some(retired) = y.their_ratchet_key.replace(their_ratchet_key) {
            y.retired_keys.insert(retired, ());
        }

        y.previous_sending_length = y.sending_counter();

        let agreement = crypto.calculate_agreement(&y.our_ratchet_secret, &their_ratchet_key)?;
        let (root_key, receiving_key) = kdf_rk(&y.root_key, &agreement, crypto)?;

        let our_ratchet_secret = crypto.generate_secret_key()?;
        let agreement = crypto.calculate_agreement(&our_ratchet_secret, &their_ratchet_key)?;
        let (root_key, sending_key) = kdf_rk(&root_key, &agreement, crypto)?;

        y.root_key = root_key;
        y.our_ratchet_key = crypto.public_key(&our_ratchet_secret)?;
        y.our_ratchet_secret = our_ratchet_secret;
        y.receiving_chain = Some(Chain::new(receiving_key));
        y.sending_chain = Some(Chain::new(sending_key));

        debug!(
            their_ratchet_key = %their_ratchet_key,
            our_ratchet_key = %y.our_ratchet_key,
            "performed diffie-hellman ratchet step"
        );

        Ok(())
    }
}

/// Mixes a Diffie-Hellman output into the root key, returning the new root key and a new chain
/// key.
fn kdf_rk<P: CryptoProvider>(
    root_key: &Secret<ROOT_KEY_SIZE>,
    agreement: &[u8],
    crypto: &P,
) -> Result<(Secret<ROOT_KEY_SIZE>, Secret<CHAIN_KEY_SIZE>), RatchetError> {
    let okm: Secret<{ ROOT_KEY_SIZE + CHAIN_KEY_SIZE }> =
        Secret::from_bytes(crypto.hkdf(root_key.as_bytes(), agreement, Some(ROOT_KDF_INFO))?);
    let (root_key, chain_key) = okm.as_bytes().split_at(ROOT_KEY_SIZE);
    Ok((
        Secret::from_bytes(root_key.try_into().expect("okm holds root key")),
        Secret::from_bytes(chain_key.try_into().expect("okm holds chain key")),
    ))
}

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("message requires skipping {requested} message keys, allowed are {max}")]
    SkipLimitExceeded { requested: u32, max: u32 },

    #[error("duplicate or unknown message {1} for ratchet key {0}")]
    DuplicateOrUnknownMessage(PublicKey, u32),

    #[error("could not authenticate and decrypt message")]
    DecryptionFailed,

    #[error("sending or receiving chain reached its maximum length")]
    ChainExhausted,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
