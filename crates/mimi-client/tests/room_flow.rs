//! End-to-end room flow over the in-memory store: two participants sharing a
//! secret, wrong secrets, tampering at rest, room switches and send failures.
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use mimi_client::pipeline::{DecryptJob, DecryptOutcome};
use mimi_client::{
    ClientConfig, DisplayBody, Generation, Identity, KeyState, MemoryStore, PipelineEvent, PipelineView,
    RoomSession, SendError,
};
use mimi_crypto::{DecryptResult, KdfConfig, RoomSecret};
use mimi_types::{MessageId, RoomId};

fn fast_config() -> ClientConfig {
    ClientConfig {
        kdf: KdfConfig::new(b"e2ee-chat-salt".to_vec(), 1_000).unwrap(),
        channel_capacity: 64,
        ..ClientConfig::default()
    }
}

fn session(store: &Arc<MemoryStore>, name: &str) -> RoomSession<MemoryStore> {
    RoomSession::start(
        Arc::clone(store),
        &fast_config(),
        Identity::new(format!("uid-{}", name), format!("{}@example.com", name)),
    )
}

async fn wait_for(
    session: &RoomSession<MemoryStore>,
    mut predicate: impl FnMut(&PipelineView) -> bool,
) -> Arc<PipelineView> {
    let mut rx = session.subscribe();
    let view = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|v| predicate(&**v)))
        .await
        .expect("timed out waiting for view")
        .expect("dispatcher stopped");
    Arc::clone(&view)
}

async fn wait_for_key(session: &RoomSession<MemoryStore>, generation: Generation) {
    wait_for(session, |v| {
        v.generation == generation && matches!(v.key_state, KeyState::Ready { .. })
    })
    .await;
}

fn bodies(view: &PipelineView) -> Vec<String> {
    view.messages.iter().map(|m| m.body.to_string()).collect()
}

#[tokio::test]
async fn participants_sharing_a_secret_read_each_other() {
    let store = Arc::new(MemoryStore::new());
    let room = RoomId::new("room-a");
    let secret = RoomSecret::generate();

    let mut alice = session(&store, "alice");
    let generation = alice.join(room.clone(), secret.clone()).await.unwrap();
    wait_for_key(&alice, generation).await;
    alice.send("hi bob").await.unwrap();
    alice.send("are you there?").await.unwrap();

    let mut bob = session(&store, "bob");
    let bob_generation = bob.join(room.clone(), secret).await.unwrap();
    let view = wait_for(&bob, |v| v.messages.len() == 2 && v.is_settled()).await;
    assert_eq!(bodies(&view), vec!["hi bob", "are you there?"]);
    assert_eq!(view.messages[0].sender_display, "alice@example.com");

    wait_for_key(&bob, bob_generation).await;
    bob.send("yes").await.unwrap();

    let view = wait_for(&alice, |v| v.messages.len() == 3 && v.is_settled()).await;
    assert_eq!(bodies(&view), vec!["hi bob", "are you there?", "yes"]);
    assert_eq!(view.messages[2].sender_id, "uid-bob");

    // The store only ever saw ciphertext.
    for record in store.records(&room) {
        assert!(!record.envelope.payload.contains("hi bob"));
    }
}

#[tokio::test]
async fn wrong_secret_shows_failure_markers() {
    let store = Arc::new(MemoryStore::new());
    let room = RoomId::new("room-a");

    let mut alice = session(&store, "alice");
    let generation = alice.join(room.clone(), RoomSecret::new("right")).await.unwrap();
    wait_for_key(&alice, generation).await;
    alice.send("private").await.unwrap();

    let mut eve = session(&store, "eve");
    eve.join(room, RoomSecret::new("wrong")).await.unwrap();
    let view = wait_for(&eve, |v| v.messages.len() == 1 && v.is_settled()).await;
    assert_eq!(view.messages[0].body, DisplayBody::DecryptionFailed);
    assert_eq!(bodies(&view), vec!["[DECRYPTION_FAILED]"]);
}

#[tokio::test]
async fn tampered_digest_at_rest_is_flagged() {
    let store = Arc::new(MemoryStore::new());
    let room = RoomId::new("room-a");
    let secret = RoomSecret::new("shared");

    let mut alice = session(&store, "alice");
    let generation = alice.join(room.clone(), secret).await.unwrap();
    wait_for_key(&alice, generation).await;
    let id = alice.send("pay 10 coins").await.unwrap();
    alice.send("thanks").await.unwrap();
    wait_for(&alice, |v| v.messages.len() == 2 && v.is_settled()).await;

    let mut record = store
        .records(&room)
        .into_iter()
        .find(|r| r.id == id)
        .unwrap();
    let mut digest = BASE64.decode(&record.envelope.digest).unwrap();
    digest[0] ^= 0x01;
    record.envelope.digest = BASE64.encode(digest);
    assert!(store.replace_record(&room, record));

    let view = wait_for(&alice, |v| {
        v.messages.first().map(|m| &m.body) == Some(&DisplayBody::IntegrityWarning)
    })
    .await;
    assert_eq!(bodies(&view), vec!["[MESSAGE INTEGRITY FAILED]", "thanks"]);
}

#[tokio::test]
async fn switching_rooms_resets_context() {
    let store = Arc::new(MemoryStore::new());
    let room_a = RoomId::new("room-a");
    let room_b = RoomId::new("room-b");

    let mut alice = session(&store, "alice");
    let gen_a = alice.join(room_a.clone(), RoomSecret::new("secret-a")).await.unwrap();
    wait_for_key(&alice, gen_a).await;
    alice.send("a1").await.unwrap();
    let m2 = alice.send("a2").await.unwrap();
    let view_a = wait_for(&alice, |v| v.messages.len() == 2 && v.is_settled()).await;
    let a_ids: Vec<MessageId> = view_a.messages.iter().map(|m| m.id.clone()).collect();

    let gen_b = alice.join(room_b.clone(), RoomSecret::new("secret-b")).await.unwrap();
    assert!(gen_b > gen_a);
    assert_eq!(alice.room_id(), Some(&room_b));
    wait_for_key(&alice, gen_b).await;
    alice.send("b1").await.unwrap();

    // A decrypt of room A's M2 that only finishes now.
    let late = DecryptOutcome {
        generation: gen_a,
        id: m2.clone(),
        envelope: store.records(&room_a)[1].envelope.clone(),
        result: DecryptResult::Plaintext("a2".into()),
    };
    alice
        .dispatcher()
        .send(PipelineEvent::DecryptCompleted(late))
        .await
        .unwrap();

    // Queued behind the stale result, so seeing it means that result was handled.
    alice.send("b2").await.unwrap();
    let view = wait_for(&alice, |v| {
        v.generation == gen_b && v.messages.len() == 2 && v.is_settled()
    })
    .await;
    assert_eq!(bodies(&view), vec!["b1", "b2"]);
    assert!(view.messages.iter().all(|m| !a_ids.contains(&m.id)));
    assert!(store.records(&room_a).iter().any(|r| r.id == m2));
}

#[tokio::test]
async fn stale_job_from_previous_room_is_discarded() {
    let store = Arc::new(MemoryStore::new());
    let room_a = RoomId::new("room-a");

    let mut alice = session(&store, "alice");
    let gen_a = alice.join(room_a.clone(), RoomSecret::new("secret-a")).await.unwrap();
    wait_for_key(&alice, gen_a).await;
    alice.send("only in a").await.unwrap();
    wait_for(&alice, |v| v.messages.len() == 1 && v.is_settled()).await;

    alice.leave().await.unwrap();
    assert_eq!(alice.room_id(), None);
    let left = wait_for(&alice, |v| v.generation > gen_a).await;
    assert!(left.messages.is_empty());
    assert_eq!(left.key_state, KeyState::Absent);

    // Re-running a job built in room A cannot repopulate the view.
    let config = KdfConfig::new(b"e2ee-chat-salt".to_vec(), 1_000).unwrap();
    let key = Arc::new(mimi_crypto::derive_key(&RoomSecret::new("secret-a"), &config).unwrap());
    let record = store.records(&room_a).remove(0);
    let outcome = DecryptJob {
        generation: gen_a,
        id: record.id,
        envelope: record.envelope,
        key,
    }
    .run();
    alice
        .dispatcher()
        .send(PipelineEvent::DecryptCompleted(outcome))
        .await
        .unwrap();

    alice
        .dispatcher()
        .send(PipelineEvent::KeyDeriving {
            generation: left.generation,
        })
        .await
        .unwrap();
    let view = wait_for(&alice, |v| v.key_state == KeyState::Deriving).await;
    assert_eq!(view.generation, left.generation);
    assert!(view.messages.is_empty());
}

#[tokio::test]
async fn rejoining_starts_from_scratch() {
    let store = Arc::new(MemoryStore::new());
    let room = RoomId::new("room-a");

    let mut alice = session(&store, "alice");
    let first = alice.join(room.clone(), RoomSecret::new("secret")).await.unwrap();
    wait_for_key(&alice, first).await;
    alice.send("before").await.unwrap();
    wait_for(&alice, |v| v.messages.len() == 1 && v.is_settled()).await;
    alice.leave().await.unwrap();

    let generation = alice.join(room, RoomSecret::new("secret")).await.unwrap();
    let view = wait_for(&alice, |v| {
        v.generation == generation && v.messages.len() == 1 && v.is_settled()
    })
    .await;
    assert_eq!(bodies(&view), vec!["before"]);
}

#[tokio::test]
async fn send_rejects_empty_and_roomless_messages() {
    let store = Arc::new(MemoryStore::new());
    let alice = session(&store, "alice");

    assert!(matches!(
        alice.send("   \n").await,
        Err(SendError::EmptyMessage)
    ));

    let err = alice.send("hello?").await.unwrap_err();
    assert!(matches!(err, SendError::NotInRoom { .. }));
    assert_eq!(err.into_draft(), Some("hello?".to_string()));
}

#[tokio::test]
async fn failed_derivation_blocks_sending_and_keeps_draft() {
    let store = Arc::new(MemoryStore::new());
    let mut alice = session(&store, "alice");
    alice
        .join(RoomId::new("room-a"), RoomSecret::new(""))
        .await
        .unwrap();

    let view = wait_for(&alice, |v| matches!(v.key_state, KeyState::Failed(_))).await;
    assert_eq!(view.key_state, KeyState::Failed("Room secret is empty".into()));
    assert!(!alice.has_key());

    let err = alice.send("draft text").await.unwrap_err();
    assert!(matches!(err, SendError::KeyUnavailable { .. }));
    assert_eq!(err.into_draft(), Some("draft text".to_string()));
}

#[tokio::test]
async fn sink_failure_returns_draft() {
    let store = Arc::new(MemoryStore::new());
    let room = RoomId::new("room-a");
    let mut alice = session(&store, "alice");
    let generation = alice.join(room.clone(), RoomSecret::new("secret")).await.unwrap();
    wait_for_key(&alice, generation).await;

    store.fail_next_append();
    let err = alice.send("will retry").await.unwrap_err();
    assert!(matches!(err, SendError::Sink { .. }));
    let draft = err.into_draft().unwrap();
    assert!(store.records(&room).is_empty());

    alice.send(&draft).await.unwrap();
    let view = wait_for(&alice, |v| v.messages.len() == 1 && v.is_settled()).await;
    assert_eq!(bodies(&view), vec!["will retry"]);
}

#[tokio::test]
async fn out_of_order_records_render_in_arrival_order() {
    use chrono::{TimeZone, Utc};
    use mimi_types::{ArrivalMarker, MessageRecord};

    let store = Arc::new(MemoryStore::new());
    let room = RoomId::new("room-a");
    let config = KdfConfig::new(b"e2ee-chat-salt".to_vec(), 1_000).unwrap();
    let key = mimi_crypto::derive_key(&RoomSecret::new("secret"), &config).unwrap();

    for n in [3, 1, 2] {
        store.insert_record(
            &room,
            MessageRecord {
                id: MessageId::new(format!("m{}", n)),
                sender_id: "uid-bob".into(),
                sender_display: "bob".into(),
                arrival_marker: Some(ArrivalMarker(Utc.timestamp_opt(n, 0).unwrap())),
                envelope: mimi_crypto::encrypt_message(&key, &format!("message {}", n))
                    .unwrap()
                    .to_wire(),
            },
        );
    }

    let mut alice = session(&store, "alice");
    alice.join(room, RoomSecret::new("secret")).await.unwrap();
    let view = wait_for(&alice, |v| v.messages.len() == 3 && v.is_settled()).await;
    assert_eq!(bodies(&view), vec!["message 1", "message 2", "message 3"]);
}

#[tokio::test]
async fn records_trickling_in_out_of_order_are_resorted() {
    use chrono::{TimeZone, Utc};
    use mimi_types::{ArrivalMarker, MessageRecord};

    let store = Arc::new(MemoryStore::new());
    let room = RoomId::new("room-a");
    let config = KdfConfig::new(b"e2ee-chat-salt".to_vec(), 1_000).unwrap();
    let key = mimi_crypto::derive_key(&RoomSecret::new("secret"), &config).unwrap();

    let mut alice = session(&store, "alice");
    let generation = alice.join(room.clone(), RoomSecret::new("secret")).await.unwrap();
    wait_for_key(&alice, generation).await;

    let mut expected: Vec<String> = Vec::new();
    for n in [3, 1, 2] {
        store.insert_record(
            &room,
            MessageRecord {
                id: MessageId::new(format!("m{}", n)),
                sender_id: "uid-bob".into(),
                sender_display: "bob".into(),
                arrival_marker: Some(ArrivalMarker(Utc.timestamp_opt(n, 0).unwrap())),
                envelope: mimi_crypto::encrypt_message(&key, &format!("message {}", n))
                    .unwrap()
                    .to_wire(),
            },
        );
        expected.push(format!("message {}", n));
        expected.sort();

        let count = expected.len();
        let view = wait_for(&alice, |v| v.messages.len() == count && v.is_settled()).await;
        assert_eq!(bodies(&view), expected);
    }
}
