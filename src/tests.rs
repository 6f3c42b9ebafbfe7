// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;
use std::time::Duration;

use assert_matches::assert_matches;

use crate::crypto::{Crypto, CryptoProvider};
use crate::group::{DropReason, GroupEvent, GroupMessage};
use crate::key_store::{FsKeyStore, MemoryKeyStore};
use crate::ratchet::RatchetError;
use crate::test_utils::{InsecureCrypto, RecordingResync};
use crate::traits::KeyStore;
use crate::{Config, GroupConfig, GroupManager, KeyManagerError, SessionError, SessionManager};

type MemberId = &'static str;

type TestSessions<S, P> = SessionManager<MemberId, S, P>;

type TestGroups = GroupManager<MemberId, MemoryKeyStore, InsecureCrypto, RecordingResync<MemberId>>;

async fn member<S: KeyStore, P: CryptoProvider>(store: S, crypto: P) -> TestSessions<S, P> {
    let identity_secret = crypto.generate_secret_key().unwrap();
    let manager = SessionManager::new(store, crypto, Config::default());
    manager.init_identity(&identity_secret).await.unwrap();
    manager
}

/// Alice establishes a session with Bob from his one-time key bundle.
async fn establish<S: KeyStore, P: CryptoProvider>(
    alice: &TestSessions<S, P>,
    bob: &TestSessions<S, P>,
) {
    let bundle = bob.generate_onetime_bundle().await.unwrap();
    let initiation = alice.initiate(&"bob", &bundle).await.unwrap();
    bob.respond(&"alice", &initiation).await.unwrap();
}

#[tokio::test]
async fn pairwise_conversation() {
    let alice = member(MemoryKeyStore::new(), Crypto::from_seed([1; 32])).await;
    let bob = member(MemoryKeyStore::new(), Crypto::from_seed([2; 32])).await;
    establish(&alice, &bob).await;

    assert!(alice.has_session(&"bob").await.unwrap());
    assert!(bob.has_session(&"alice").await.unwrap());

    let message_1 = alice.encrypt_pairwise(&"bob", b"Hello, Bob!").await.unwrap();
    assert_eq!(
        bob.decrypt_pairwise(&"alice", &message_1).await.unwrap(),
        b"Hello, Bob!"
    );

    let message_2 = bob.encrypt_pairwise(&"alice", b"Hi, Alice!").await.unwrap();
    assert_eq!(
        alice.decrypt_pairwise(&"bob", &message_2).await.unwrap(),
        b"Hi, Alice!"
    );

    // Bob's reply moved Alice to a new ratchet key.
    let message_3 = alice.encrypt_pairwise(&"bob", b"How are you?").await.unwrap();
    assert_ne!(message_3.header.ratchet_key, message_1.header.ratchet_key);
    assert_eq!(message_3.header.counter, 0);
    assert_eq!(message_3.header.previous_chain_length, 1);
    assert_eq!(
        bob.decrypt_pairwise(&"alice", &message_3).await.unwrap(),
        b"How are you?"
    );
}

#[tokio::test]
async fn responder_sends_first() {
    let alice = member(MemoryKeyStore::new(), InsecureCrypto::new([1; 32])).await;
    let bob = member(MemoryKeyStore::new(), InsecureCrypto::new([2; 32])).await;
    establish(&alice, &bob).await;

    let message = bob.encrypt_pairwise(&"alice", b"I was faster").await.unwrap();
    assert_eq!(
        alice.decrypt_pairwise(&"bob", &message).await.unwrap(),
        b"I was faster"
    );

    let message = alice.encrypt_pairwise(&"bob", b"Indeed").await.unwrap();
    assert_eq!(
        bob.decrypt_pairwise(&"alice", &message).await.unwrap(),
        b"Indeed"
    );
}

#[tokio::test]
async fn out_of_order_and_duplicates() {
    let alice = member(MemoryKeyStore::new(), InsecureCrypto::new([1; 32])).await;
    let bob = member(MemoryKeyStore::new(), InsecureCrypto::new([2; 32])).await;
    establish(&alice, &bob).await;

    let a = alice.encrypt_pairwise(&"bob", b"A").await.unwrap();
    let b = alice.encrypt_pairwise(&"bob", b"B").await.unwrap();
    let c = alice.encrypt_pairwise(&"bob", b"C").await.unwrap();

    assert_eq!(bob.decrypt_pairwise(&"alice", &c).await.unwrap(), b"C");
    assert_eq!(
        bob.session(&"alice")
            .await
            .unwrap()
            .unwrap()
            .skipped_keys_len(),
        2
    );
    assert_eq!(bob.decrypt_pairwise(&"alice", &a).await.unwrap(), b"A");
    assert_eq!(bob.decrypt_pairwise(&"alice", &b).await.unwrap(), b"B");
    assert_eq!(
        bob.session(&"alice")
            .await
            .unwrap()
            .unwrap()
            .skipped_keys_len(),
        0
    );

    assert_matches!(
        bob.decrypt_pairwise(&"alice", &a).await,
        Err(SessionError::Ratchet(
            RatchetError::DuplicateOrUnknownMessage(_, 0)
        ))
    );
    assert_matches!(
        bob.decrypt_pairwise(&"alice", &c).await,
        Err(SessionError::Ratchet(
            RatchetError::DuplicateOrUnknownMessage(_, 2)
        ))
    );
}

#[tokio::test]
async fn tampered_message_keeps_state() {
    let alice = member(MemoryKeyStore::new(), InsecureCrypto::new([1; 32])).await;
    let bob = member(MemoryKeyStore::new(), InsecureCrypto::new([2; 32])).await;
    establish(&alice, &bob).await;

    let _skipped = alice.encrypt_pairwise(&"bob", b"skipped").await.unwrap();
    let message = alice.encrypt_pairwise(&"bob", b"original").await.unwrap();

    let before = bob.session(&"alice").await.unwrap();

    let mut tampered = message.clone();
    tampered.ciphertext[0] ^= 1;
    assert_matches!(
        bob.decrypt_pairwise(&"alice", &tampered).await,
        Err(SessionError::Ratchet(RatchetError::DecryptionFailed))
    );

    let mut tampered = message.clone();
    tampered.header.previous_chain_length += 1;
    assert_matches!(
        bob.decrypt_pairwise(&"alice", &tampered).await,
        Err(SessionError::Ratchet(RatchetError::DecryptionFailed))
    );

    assert_eq!(bob.session(&"alice").await.unwrap(), before);
    assert_eq!(
        bob.decrypt_pairwise(&"alice", &message).await.unwrap(),
        b"original"
    );
}

#[tokio::test]
async fn onetime_prekey_is_used_once() {
    let alice = member(MemoryKeyStore::new(), InsecureCrypto::new([1; 32])).await;
    let bob = member(MemoryKeyStore::new(), InsecureCrypto::new([2; 32])).await;
    let carol = member(MemoryKeyStore::new(), InsecureCrypto::new([3; 32])).await;

    let bundle = bob.generate_onetime_bundle().await.unwrap();

    let initiation = alice.initiate(&"bob", &bundle).await.unwrap();
    bob.respond(&"alice", &initiation).await.unwrap();

    // Carol got hold of the same bundle.
    let initiation = carol.initiate(&"bob", &bundle).await.unwrap();
    assert_matches!(
        bob.respond(&"carol", &initiation).await,
        Err(SessionError::KeyManager(
            KeyManagerError::UnknownOneTimeSecret(_)
        ))
    );
    assert!(!bob.has_session(&"carol").await.unwrap());
}

#[tokio::test]
async fn long_term_bundle() {
    let alice = member(MemoryKeyStore::new(), InsecureCrypto::new([1; 32])).await;
    let bob = member(MemoryKeyStore::new(), InsecureCrypto::new([2; 32])).await;

    bob.rotate_prekey().await.unwrap();
    let bundle = bob.prekey_bundle().await.unwrap();

    let initiation = alice.initiate(&"bob", &bundle).await.unwrap();
    assert_eq!(initiation.onetime_prekey_id, None);
    bob.respond(&"alice", &initiation).await.unwrap();

    let message = alice.encrypt_pairwise(&"bob", b"long-term").await.unwrap();
    assert_eq!(
        bob.decrypt_pairwise(&"alice", &message).await.unwrap(),
        b"long-term"
    );
}

#[tokio::test]
async fn session_lifecycle() {
    let crypto = InsecureCrypto::new([1; 32]);
    let identity_secret = crypto.generate_secret_key().unwrap();
    let alice: TestSessions<_, _> =
        SessionManager::new(MemoryKeyStore::new(), crypto, Config::default());
    let bob = member(MemoryKeyStore::new(), InsecureCrypto::new([2; 32])).await;

    let bundle = bob.generate_onetime_bundle().await.unwrap();
    assert_matches!(
        alice.initiate(&"bob", &bundle).await,
        Err(SessionError::MissingIdentity)
    );
    alice.init_identity(&identity_secret).await.unwrap();

    alice.initiate(&"bob", &bundle).await.unwrap();
    assert_matches!(
        alice.initiate(&"bob", &bundle).await,
        Err(SessionError::SessionExists(_))
    );

    alice.reset(&"bob").await.unwrap();
    assert!(!alice.has_session(&"bob").await.unwrap());
    assert_matches!(
        alice.encrypt_pairwise(&"bob", b"gone").await,
        Err(SessionError::UnknownSession(_))
    );
}

#[tokio::test]
async fn unknown_sessions_leave_no_locks() {
    let crypto = InsecureCrypto::new([1; 32]);
    let identity_secret = crypto.generate_secret_key().unwrap();
    let sessions: SessionManager<String, _, _> =
        SessionManager::new(MemoryKeyStore::new(), crypto, Config::default());
    sessions.init_identity(&identity_secret).await.unwrap();

    for id in 0..1000 {
        let id = format!("member-{id}");
        assert!(!sessions.has_session(&id).await.unwrap());
        assert!(sessions.session(&id).await.unwrap().is_none());
        assert_matches!(
            sessions.encrypt_pairwise(&id, b"hello?").await,
            Err(SessionError::UnknownSession(_))
        );
    }
    assert_eq!(sessions.lock_entries(), 0);

    let alice = member(MemoryKeyStore::new(), InsecureCrypto::new([2; 32])).await;
    let bob = member(MemoryKeyStore::new(), InsecureCrypto::new([3; 32])).await;
    establish(&alice, &bob).await;

    let message = alice.encrypt_pairwise(&"bob", b"hello").await.unwrap();
    assert_matches!(
        bob.decrypt_pairwise(&"mallory", &message).await,
        Err(SessionError::UnknownSession(_))
    );
    bob.decrypt_pairwise(&"alice", &message).await.unwrap();
    bob.reset(&"alice").await.unwrap();
    assert_eq!(alice.lock_entries(), 0);
    assert_eq!(bob.lock_entries(), 0);
}

#[tokio::test]
async fn concurrent_calls_are_serialised() {
    let alice = member(MemoryKeyStore::new(), InsecureCrypto::new([1; 32])).await;
    let bob = member(MemoryKeyStore::new(), InsecureCrypto::new([2; 32])).await;
    establish(&alice, &bob).await;

    let (one, two, three) = tokio::join!(
        alice.encrypt_pairwise(&"bob", b"one"),
        alice.encrypt_pairwise(&"bob", b"two"),
        alice.encrypt_pairwise(&"bob", b"three"),
    );
    let messages = [one.unwrap(), two.unwrap(), three.unwrap()];

    let counters: BTreeSet<u32> = messages
        .iter()
        .map(|message| message.header.counter)
        .collect();
    assert_eq!(counters, BTreeSet::from([0, 1, 2]));

    for message in &messages {
        bob.decrypt_pairwise(&"alice", message).await.unwrap();
    }
}

#[tokio::test]
async fn sessions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let alice = member(MemoryKeyStore::new(), InsecureCrypto::new([1; 32])).await;
    let bob = member(
        FsKeyStore::open(dir.path()).await.unwrap(),
        InsecureCrypto::new([2; 32]),
    )
    .await;

    let bundle = bob.generate_onetime_bundle().await.unwrap();
    let initiation = alice.initiate(&"bob", &bundle).await.unwrap();
    bob.respond(&"alice", &initiation).await.unwrap();
    drop(bob);

    let bob: TestSessions<_, _> = SessionManager::new(
        FsKeyStore::open(dir.path()).await.unwrap(),
        InsecureCrypto::new([3; 32]),
        Config::default(),
    );
    let message = alice.encrypt_pairwise(&"bob", b"still there?").await.unwrap();
    assert_eq!(
        bob.decrypt_pairwise(&"alice", &message).await.unwrap(),
        b"still there?"
    );

    // The used one-time pre-key was removed from the persisted key manager as well.
    let carol = member(MemoryKeyStore::new(), InsecureCrypto::new([4; 32])).await;
    let initiation = carol.initiate(&"bob", &bundle).await.unwrap();
    assert_matches!(
        bob.respond(&"carol", &initiation).await,
        Err(SessionError::KeyManager(
            KeyManagerError::UnknownOneTimeSecret(_)
        ))
    );
}

fn group_config() -> Config {
    Config {
        group: GroupConfig {
            resync_threshold: 2,
            resync_max_age: Duration::from_secs(3600),
            ..GroupConfig::default()
        },
        ..Config::default()
    }
}

fn groups(seed: u8) -> (TestGroups, MemoryKeyStore) {
    let store = MemoryKeyStore::new();
    let manager = GroupManager::new(
        store.clone(),
        InsecureCrypto::new([seed; 32]),
        RecordingResync::new(),
        group_config(),
    );
    (manager, store)
}

fn decrypted(epoch: u64, plaintext: &[u8]) -> GroupEvent {
    GroupEvent::Decrypted {
        epoch,
        plaintext: plaintext.to_vec(),
    }
}

#[tokio::test]
async fn group_messages_wait_for_their_epoch() {
    let (alice, _) = groups(1);
    let (bob, _) = groups(2);

    alice.set_epoch(&"chat", 1, b"epoch 1".to_vec()).await.unwrap();
    bob.set_epoch(&"chat", 1, b"epoch 1".to_vec()).await.unwrap();

    let message = alice.encrypt_group(&"chat", b"welcome").await.unwrap();
    assert_eq!(
        bob.decrypt_group(&"chat", message).await.unwrap(),
        vec![decrypted(1, b"welcome")]
    );

    // Alice already moved on, Bob did not learn about epoch 2 yet.
    alice.set_epoch(&"chat", 2, b"epoch 2".to_vec()).await.unwrap();
    let mut messages: Vec<GroupMessage> = Vec::new();
    for text in ["one", "two", "three", "four"] {
        messages.push(alice.encrypt_group(&"chat", text.as_bytes()).await.unwrap());
    }

    for message in messages {
        assert_eq!(
            bob.decrypt_group(&"chat", message).await.unwrap(),
            vec![GroupEvent::Buffered { epoch: 2 }]
        );
    }

    // Threshold was exceeded by the third message, only one request per episode.
    let requests = bob.resync().requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "chat");
    assert_eq!(requests[0].1.missing_epochs, BTreeSet::from([2]));
    assert_eq!(requests[0].1.buffered, 3);

    let events = bob
        .set_epoch(&"chat", 2, b"epoch 2".to_vec())
        .await
        .unwrap();
    assert_eq!(
        events,
        vec![
            decrypted(2, b"one"),
            decrypted(2, b"two"),
            decrypted(2, b"three"),
            decrypted(2, b"four"),
        ]
    );
    assert_eq!(bob.current_epoch(&"chat").await.unwrap(), Some(2));
}

#[tokio::test]
async fn group_rejects_forged_messages() {
    let (alice, _) = groups(1);
    let (bob, _) = groups(2);

    alice.set_epoch(&"chat", 1, b"epoch 1".to_vec()).await.unwrap();
    bob.set_epoch(&"chat", 1, b"other secret".to_vec())
        .await
        .unwrap();

    let message = alice.encrypt_group(&"chat", b"hello").await.unwrap();
    assert!(bob.decrypt_group(&"chat", message).await.is_err());

    // Buffered message with a bad secret is dropped after replay.
    alice.set_epoch(&"chat", 2, b"epoch 2".to_vec()).await.unwrap();
    let message = alice.encrypt_group(&"chat", b"hello").await.unwrap();
    bob.decrypt_group(&"chat", message).await.unwrap();

    let events = bob
        .set_epoch(&"chat", 2, b"wrong".to_vec())
        .await
        .unwrap();
    assert_eq!(
        events,
        vec![GroupEvent::Dropped {
            epoch: 2,
            reason: DropReason::DecryptionFailed,
        }]
    );
}

#[tokio::test]
async fn group_epochs_are_persisted() {
    let (alice, store) = groups(1);
    for epoch in 1..=12 {
        alice
            .set_epoch(&"chat", epoch, format!("epoch {epoch}").into_bytes())
            .await
            .unwrap();
    }

    let reloaded = GroupManager::new(
        store.clone(),
        InsecureCrypto::new([9; 32]),
        RecordingResync::new(),
        group_config(),
    );
    assert_eq!(reloaded.current_epoch(&"chat").await.unwrap(), Some(12));

    // Epoch 2 fell out of the window, messages for it are dropped right away.
    let message = GroupMessage {
        epoch: 2,
        nonce: [0; 24],
        ciphertext: vec![0; 32],
    };
    assert_eq!(
        reloaded.decrypt_group(&"chat", message).await.unwrap(),
        vec![GroupEvent::Dropped {
            epoch: 2,
            reason: DropReason::EpochExpired,
        }]
    );

    let message = alice.encrypt_group(&"chat", b"latest").await.unwrap();
    assert_eq!(
        reloaded.decrypt_group(&"chat", message).await.unwrap(),
        vec![decrypted(12, b"latest")]
    );
}

#[tokio::test]
async fn reloaded_groups_use_the_configured_window() {
    let (alice, store) = groups(1);
    for epoch in 1..=12 {
        alice
            .set_epoch(&"chat", epoch, format!("epoch {epoch}").into_bytes())
            .await
            .unwrap();
    }
    let message_9 = {
        let sender: TestGroups = GroupManager::new(
            MemoryKeyStore::new(),
            InsecureCrypto::new([3; 32]),
            RecordingResync::new(),
            group_config(),
        );
        sender
            .set_epoch(&"chat", 9, b"epoch 9".to_vec())
            .await
            .unwrap();
        sender.encrypt_group(&"chat", b"nine").await.unwrap()
    };

    let mut config = group_config();
    config.group.max_epochs = 3;
    let reloaded: TestGroups = GroupManager::new(
        store.clone(),
        InsecureCrypto::new([9; 32]),
        RecordingResync::new(),
        config,
    );
    assert_eq!(reloaded.current_epoch(&"chat").await.unwrap(), Some(12));

    // Epoch 9 was retained in the store but is outside of the smaller window.
    assert_eq!(
        reloaded.decrypt_group(&"chat", message_9).await.unwrap(),
        vec![GroupEvent::Dropped {
            epoch: 9,
            reason: DropReason::EpochExpired,
        }]
    );

    let message = alice.encrypt_group(&"chat", b"latest").await.unwrap();
    assert_eq!(
        reloaded.decrypt_group(&"chat", message).await.unwrap(),
        vec![decrypted(12, b"latest")]
    );
}

#[tokio::test]
async fn leaving_a_group() {
    let (alice, _) = groups(1);
    let (bob, store) = groups(2);

    alice.set_epoch(&"chat", 1, b"epoch 1".to_vec()).await.unwrap();
    bob.set_epoch(&"chat", 3, b"epoch 3".to_vec()).await.unwrap();

    // Epoch 1 is not tracked by Bob but also not expired, the message waits.
    let message = alice.encrypt_group(&"chat", b"bye").await.unwrap();
    bob.decrypt_group(&"chat", message).await.unwrap();

    assert_eq!(
        bob.leave(&"chat").await.unwrap(),
        vec![GroupEvent::Dropped {
            epoch: 1,
            reason: DropReason::Cleared,
        }]
    );
    assert!(store.is_empty().await);
    assert_eq!(bob.current_epoch(&"chat").await.unwrap(), None);
    assert!(bob.encrypt_group(&"chat", b"hello?").await.is_err());
}

#[tokio::test]
async fn unknown_groups_leave_no_state() {
    let store = MemoryKeyStore::new();
    let groups: GroupManager<String, _, _, RecordingResync<String>> = GroupManager::new(
        store.clone(),
        InsecureCrypto::new([1; 32]),
        RecordingResync::new(),
        group_config(),
    );

    for id in 0..1000 {
        let id = format!("group-{id}");
        assert_eq!(groups.current_epoch(&id).await.unwrap(), None);
        groups.poll_resync(&id).await.unwrap();
        assert!(groups.encrypt_group(&id, b"hello?").await.is_err());
    }
    assert_eq!(groups.lock_entries(), 0);
    assert!(store.is_empty().await);

    // Joined groups and groups with waiting messages are kept in memory.
    let chat = "chat".to_string();
    groups.set_epoch(&chat, 1, b"epoch 1".to_vec()).await.unwrap();
    let message = groups.encrypt_group(&chat, b"early").await.unwrap();
    let early = GroupMessage { epoch: 2, ..message };
    groups.decrypt_group(&"other".to_string(), early).await.unwrap();
    assert_eq!(groups.lock_entries(), 2);

    groups.leave(&chat).await.unwrap();
    groups.leave(&"other".to_string()).await.unwrap();
    assert_eq!(groups.lock_entries(), 0);
}
