/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use quill_core::keys::{DeviceIdentity, DeviceKeys};
use quill_core::sync_crypto;
use quill_core::sync_engine::{
    Applied, ConversationKeys, IdentityDirectory, SyncAuthor, SyncEngine, SyncError,
};
use quill_core::sync_store::{ChainHead, SqliteSyncStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

struct Directory(HashMap<String, DeviceKeys>);

impl IdentityDirectory for Directory {
    fn device(&self, device_id: &str) -> Option<DeviceKeys> {
        self.0.get(device_id).cloned()
    }
}

struct Secrets(HashMap<String, Vec<u8>>);

impl ConversationKeys for Secrets {
    fn conversation_secret(&self, conv_id: &str) -> Option<Zeroizing<Vec<u8>>> {
        self.0.get(conv_id).cloned().map(Zeroizing::new)
    }
}

struct Pair {
    alice: Arc<DeviceIdentity>,
    bob: Arc<DeviceIdentity>,
    carol: Arc<DeviceIdentity>,
    secrets: Arc<Secrets>,
    directory: Arc<Directory>,
    dir: tempfile::TempDir,
}

impl Pair {
    fn new() -> Self {
        let alice = Arc::new(DeviceIdentity::generate());
        let bob = Arc::new(DeviceIdentity::generate());
        let carol = Arc::new(DeviceIdentity::generate());
        let directory = Arc::new(Directory(HashMap::from([
            (alice.device_id.clone(), alice.device_keys()),
            (bob.device_id.clone(), bob.device_keys()),
            (carol.device_id.clone(), carol.device_keys()),
        ])));
        let secrets = Arc::new(Secrets(HashMap::from([(
            "conv-1".to_string(),
            vec![7u8; 32],
        )])));
        Self {
            alice,
            bob,
            carol,
            secrets,
            directory,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn engine_for(&self, local: &Arc<DeviceIdentity>) -> SyncEngine {
        let db = self.dir.path().join(format!("{}.db", local.device_id));
        let store = Arc::new(SqliteSyncStore::open(db).unwrap());
        SyncEngine::new(
            store,
            self.directory.clone(),
            self.secrets.clone(),
            local.clone(),
        )
    }

    fn alice_author(&self) -> SyncAuthor {
        SyncAuthor::new(self.alice.clone(), self.secrets.clone())
    }
}

fn accepted(a: Applied) -> (String, bool) {
    match a {
        Applied::Accepted { hash, conflict, .. } => (hash, conflict),
        other => panic!("expected accepted, got {other:?}"),
    }
}

#[tokio::test]
async fn chained_events_apply_in_order_and_hash_links() {
    let p = Pair::new();
    let bob = p.engine_for(&p.bob);
    let author = p.alice_author();
    let bob_keys = p.bob.device_keys();

    let first = author.seal(&bob_keys, "conv-1", b"hello", None).unwrap();
    assert_eq!(first.header.lamport, 1);
    assert!(first.header.prev.is_none());
    let (h1, conflict) = accepted(bob.apply(&first).await.unwrap());
    assert!(!conflict);
    assert_eq!(h1, sync_crypto::event_hash(&first.header, b"hello"));

    let head = ChainHead {
        event_id: first.header.event_id.clone(),
        hash: h1.clone(),
        lamport: 1,
    };
    let second = author
        .seal(&bob_keys, "conv-1", b"world", Some(&head))
        .unwrap();
    assert_eq!(second.header.lamport, 2);
    assert_eq!(second.header.prev.as_deref(), Some(h1.as_str()));
    let (_, conflict) = accepted(bob.apply(&second).await.unwrap());
    assert!(!conflict);

    let events = bob.events("conv-1").await.unwrap();
    let bodies: Vec<&[u8]> = events.iter().map(|e| e.plaintext.as_slice()).collect();
    assert_eq!(bodies, [b"hello".as_slice(), b"world".as_slice()]);
    assert!(bob.conflicts("conv-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn fork_is_stored_as_conflict_and_can_be_resolved() {
    let p = Pair::new();
    let bob = p.engine_for(&p.bob);
    let author = p.alice_author();
    let bob_keys = p.bob.device_keys();

    let first = author.seal(&bob_keys, "conv-1", b"a", None).unwrap();
    accepted(bob.apply(&first).await.unwrap());

    // Also claims to be the first event of the conversation.
    let fork = author.seal(&bob_keys, "conv-1", b"b", None).unwrap();
    let (_, conflict) = accepted(bob.apply(&fork).await.unwrap());
    assert!(conflict);

    let conflicts = bob.conflicts("conv-1").await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].event_id, fork.header.event_id);
    assert_eq!(bob.events("conv-1").await.unwrap().len(), 2);

    assert!(bob.resolve_conflict(&fork.header.event_id).await.unwrap());
    assert!(bob.conflicts("conv-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn replay_is_a_duplicate_without_new_conflict() {
    let p = Pair::new();
    let bob = p.engine_for(&p.bob);
    let author = p.alice_author();
    let env = author
        .seal(&p.bob.device_keys(), "conv-1", b"once", None)
        .unwrap();

    accepted(bob.apply(&env).await.unwrap());
    assert_eq!(
        bob.apply(&env).await.unwrap(),
        Applied::Duplicate {
            event_id: env.header.event_id.clone()
        }
    );
    assert_eq!(bob.events("conv-1").await.unwrap().len(), 1);
    assert!(bob.conflicts("conv-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn tampered_envelope_is_dropped_and_not_stored() {
    let p = Pair::new();
    let bob = p.engine_for(&p.bob);
    let author = p.alice_author();
    let bob_keys = p.bob.device_keys();

    let mut env = author.seal(&bob_keys, "conv-1", b"pay 1", None).unwrap();
    env.header.lamport += 10;
    assert!(matches!(
        bob.apply(&env).await,
        Err(SyncError::InvalidSignature)
    ));

    let mut env = author.seal(&bob_keys, "conv-1", b"pay 1", None).unwrap();
    let other = author.seal(&bob_keys, "conv-1", b"pay 9", None).unwrap();
    env.ciphertext_b64 = other.ciphertext_b64;
    assert!(matches!(
        bob.apply(&env).await,
        Err(SyncError::InvalidSignature)
    ));

    assert!(bob.events("conv-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_author_and_missing_secret_are_rejected() {
    let p = Pair::new();
    let bob = p.engine_for(&p.bob);
    let stranger = Arc::new(DeviceIdentity::generate());
    let env = SyncAuthor::new(stranger, p.secrets.clone())
        .seal(&p.bob.device_keys(), "conv-1", b"hi", None)
        .unwrap();
    assert!(matches!(
        bob.apply(&env).await,
        Err(SyncError::UnknownAuthor(_))
    ));

    let lonely = Arc::new(Secrets(HashMap::from([(
        "conv-2".to_string(),
        vec![1u8; 32],
    )])));
    let env = SyncAuthor::new(p.alice.clone(), lonely)
        .seal(&p.bob.device_keys(), "conv-2", b"hi", None)
        .unwrap();
    assert!(matches!(
        bob.apply(&env).await,
        Err(SyncError::MissingConversationKey(_))
    ));
    assert!(bob.events("conv-2").await.unwrap().is_empty());
}

#[tokio::test]
async fn seal_for_extends_the_local_head() {
    let p = Pair::new();
    let alice = p.engine_for(&p.alice);
    let bob = p.engine_for(&p.bob);

    let first = alice.seal_for(&p.bob.device_id, "conv-1", b"one").await.unwrap();
    let (h1, _) = accepted(bob.apply(&first).await.unwrap());
    let alice_head: Vec<_> = alice.events("conv-1").await.unwrap();
    assert_eq!(alice_head.len(), 1);
    assert_eq!(alice_head[0].hash, h1);

    // The reply extends the head bob just stored.
    let reply = bob.seal_for(&p.alice.device_id, "conv-1", b"two").await.unwrap();
    assert_eq!(reply.header.prev.as_deref(), Some(h1.as_str()));
    assert_eq!(reply.header.lamport, 2);
    let (_, conflict) = accepted(alice.apply(&reply).await.unwrap());
    assert!(!conflict);
    assert!(alice.conflicts("conv-1").await.unwrap().is_empty());

    assert!(alice.seal_for("nobody", "conv-1", b"x").await.is_err());
}

#[tokio::test]
async fn consecutive_sends_chain_without_conflict() {
    let p = Pair::new();
    let alice = p.engine_for(&p.alice);
    let bob = p.engine_for(&p.bob);

    let e1 = alice.seal_for(&p.bob.device_id, "conv-1", b"first").await.unwrap();
    let e2 = alice.seal_for(&p.bob.device_id, "conv-1", b"second").await.unwrap();
    assert_eq!(e1.header.lamport, 1);
    assert_eq!(e2.header.lamport, 2);
    assert!(e2.header.prev.is_some());

    let (_, c1) = accepted(bob.apply(&e1).await.unwrap());
    let (h2, c2) = accepted(bob.apply(&e2).await.unwrap());
    assert!(!c1);
    assert!(!c2);
    assert!(bob.conflicts("conv-1").await.unwrap().is_empty());

    // Both sides agree on where the chain ends.
    let local: Vec<_> = alice.events("conv-1").await.unwrap();
    assert_eq!(local.last().map(|e| e.hash.as_str()), Some(h2.as_str()));
}

#[tokio::test]
async fn every_recipient_links_to_the_same_hash() {
    let p = Pair::new();
    let alice = p.engine_for(&p.alice);
    let bob = p.engine_for(&p.bob);
    let carol = p.engine_for(&p.carol);

    let envs = alice
        .seal_for_devices(
            &[p.bob.device_id.as_str(), p.carol.device_id.as_str()],
            "conv-1",
            b"hi all",
        )
        .await
        .unwrap();
    assert_eq!(envs.len(), 2);
    assert_eq!(envs[0].header, envs[1].header);
    assert_ne!(envs[0].ciphertext_b64, envs[1].ciphertext_b64);

    let (at_bob, _) = accepted(bob.apply(&envs[0]).await.unwrap());
    let (at_carol, _) = accepted(carol.apply(&envs[1]).await.unwrap());
    assert_eq!(at_bob, at_carol);
    assert_eq!(alice.events("conv-1").await.unwrap()[0].hash, at_bob);

    // A follow-up from either recipient chains for everyone.
    let reply = bob
        .seal_for_devices(
            &[p.alice.device_id.as_str(), p.carol.device_id.as_str()],
            "conv-1",
            b"yo",
        )
        .await
        .unwrap();
    let (_, c_alice) = accepted(alice.apply(&reply[0]).await.unwrap());
    let (_, c_carol) = accepted(carol.apply(&reply[1]).await.unwrap());
    assert!(!c_alice);
    assert!(!c_carol);
}

#[tokio::test]
async fn closed_gate_refuses_apply_and_seal() {
    let p = Pair::new();
    let open = Arc::new(AtomicBool::new(true));
    let flag = open.clone();
    let bob = p
        .engine_for(&p.bob)
        .with_gate(Arc::new(move || flag.load(Ordering::SeqCst)));
    let env = p
        .alice_author()
        .seal(&p.bob.device_keys(), "conv-1", b"late", None)
        .unwrap();

    open.store(false, Ordering::SeqCst);
    assert!(matches!(bob.apply(&env).await, Err(SyncError::VaultLocked)));
    assert!(bob.seal_for(&p.alice.device_id, "conv-1", b"x").await.is_err());
    assert!(bob.events("conv-1").await.unwrap().is_empty());

    open.store(true, Ordering::SeqCst);
    accepted(bob.apply(&env).await.unwrap());
}
