//! Two or more clients talking through an in-process relay.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use hl_crypto::{CryptoBackend, CryptoError, KeyManager};
use hl_proto::{ClientEvent, Connector, MessageStatus, MessageType};
use hl_relay::{Relay, SessionRegistry};
use hl_transport::{
    BackoffConfig, EventStream, SessionTransport, TransportConfig, TransportError, TransportEvent,
};

fn relay_with(users: &[&str]) -> Relay {
    let sessions = Arc::new(SessionRegistry::new());
    let far = chrono::Utc::now() + chrono::Duration::hours(1);
    for user in users {
        sessions.insert(&format!("tok-{user}"), user, far);
    }
    Relay::new(sessions)
}

fn fast_config() -> TransportConfig {
    TransportConfig {
        key_request_timeout_ms: 1_000,
        typing_timeout_ms: 150,
        backoff: BackoffConfig {
            initial_ms: 10,
            max_ms: 40,
            max_attempts: 4,
        },
        ..TransportConfig::default()
    }
}

fn client(relay: &Relay, user: &str) -> (SessionTransport, EventStream) {
    let mut keys = KeyManager::new(CryptoBackend::system());
    keys.generate_identity().unwrap();
    let connector: Arc<dyn Connector> = Arc::new(relay.clone());
    SessionTransport::builder(user, Arc::new(Mutex::new(keys)), connector)
        .config(fast_config())
        .build()
}

fn public_key_of(transport: &SessionTransport) -> String {
    transport.keys().lock().public_key().unwrap().to_b64()
}

async fn next_event(
    events: &mut EventStream,
    pred: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let ev = events.recv().await.expect("transport dropped");
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("timed out waiting for transport event")
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Alice and Bob online, both keys published.
async fn pair(relay: &Relay) -> ((SessionTransport, EventStream), (SessionTransport, EventStream)) {
    let alice = client(relay, "alice");
    let bob = client(relay, "bob");
    alice.0.connect("tok-alice").await.unwrap();
    bob.0.connect("tok-bob").await.unwrap();
    wait_until(|| relay.public_key("alice").is_some() && relay.public_key("bob").is_some()).await;
    (alice, bob)
}

/// Alice sends `text` to Bob and both sides settle on Delivered.
async fn delivered(
    alice: &SessionTransport,
    bob_events: &mut EventStream,
    alice_events: &mut EventStream,
    text: &[u8],
) -> String {
    let local_id = alice
        .send_message("bob", text, "c1", MessageType::Text)
        .await
        .unwrap();
    let TransportEvent::MessageSent { message_id, .. } = next_event(alice_events, |ev| {
        matches!(ev, TransportEvent::MessageSent { local_id: l, .. } if *l == local_id)
    })
    .await
    else {
        unreachable!()
    };
    next_event(bob_events, |ev| {
        matches!(ev, TransportEvent::MessageReceived { envelope, .. } if envelope.id == message_id)
    })
    .await;
    let id = message_id.clone();
    next_event(alice_events, move |ev| {
        matches!(ev, TransportEvent::StatusChanged { message_id, status: MessageStatus::Delivered } if *message_id == id)
    })
    .await;
    message_id
}

#[tokio::test]
async fn hello_is_delivered_then_read() {
    let relay = relay_with(&["alice", "bob"]);
    let ((alice, mut alice_events), (bob, mut bob_events)) = pair(&relay).await;

    let local_id = alice
        .send_message("bob", b"hello", "c1", MessageType::Text)
        .await
        .unwrap();
    assert_eq!(alice.message(&local_id).unwrap().sender_id, "alice");

    let ev = next_event(&mut bob_events, |ev| matches!(ev, TransportEvent::MessageReceived { .. })).await;
    let TransportEvent::MessageReceived { envelope, plaintext } = ev else {
        unreachable!()
    };
    assert_eq!(plaintext.as_slice(), b"hello");
    assert_eq!(envelope.sender_id, "alice");
    assert_eq!(envelope.status, MessageStatus::Delivered);

    let id = envelope.id.clone();
    next_event(&mut alice_events, |ev| {
        matches!(ev, TransportEvent::StatusChanged { status: MessageStatus::Delivered, .. })
    })
    .await;

    assert!(bob.mark_as_read(&id).unwrap());
    assert!(!bob.mark_as_read(&id).unwrap());
    next_event(&mut alice_events, |ev| {
        matches!(ev, TransportEvent::StatusChanged { status: MessageStatus::Read, .. })
    })
    .await;

    // Local id and relay id name the same envelope.
    assert_eq!(alice.message(&local_id).unwrap().id, id);
    assert_eq!(alice.message(&id).unwrap().status, MessageStatus::Read);
    assert_eq!(relay.message(&id).unwrap().status, MessageStatus::Read);
}

#[tokio::test]
async fn own_messages_cannot_be_marked_read() {
    let relay = relay_with(&["alice", "bob"]);
    let ((alice, mut alice_events), (_bob, mut bob_events)) = pair(&relay).await;
    let id = delivered(&alice, &mut bob_events, &mut alice_events, b"hi").await;

    assert!(!alice.mark_as_read(&id).unwrap());
    assert_eq!(alice.message(&id).unwrap().status, MessageStatus::Delivered);
    assert!(matches!(
        alice.mark_as_read("nope"),
        Err(TransportError::UnknownMessage(_))
    ));
}

#[tokio::test]
async fn offline_sends_flush_in_order_exactly_once() {
    let relay = relay_with(&["alice"]);
    let (alice, mut events) = client(&relay, "alice");
    let bob = client(&relay, "bob").0;
    alice.establish_channel("bob", &public_key_of(&bob)).unwrap();

    let mut local_ids = Vec::new();
    for text in ["one", "two", "three"] {
        let id = alice
            .send_message("bob", text.as_bytes(), "c1", MessageType::Text)
            .await
            .unwrap();
        local_ids.push(id);
    }
    assert_eq!(alice.queued().len(), 3);
    assert_eq!(relay.message_count(), 0);

    alice.connect("tok-alice").await.unwrap();

    let mut relay_ids = Vec::new();
    for local in &local_ids {
        let TransportEvent::MessageSent { message_id, .. } = next_event(&mut events, |ev| {
            matches!(ev, TransportEvent::MessageSent { local_id, .. } if local_id == local)
        })
        .await
        else {
            unreachable!()
        };
        relay_ids.push(message_id);
    }

    let stored: Vec<String> = relay.chat_messages("c1").into_iter().map(|m| m.id).collect();
    assert_eq!(stored, relay_ids);
    assert!(alice.queued().is_empty());
    for id in &local_ids {
        assert_eq!(alice.message(id).unwrap().status, MessageStatus::Sent);
    }
}

#[tokio::test]
async fn offline_send_without_channel_fails_fast() {
    let relay = relay_with(&["alice"]);
    let (alice, _events) = client(&relay, "alice");
    let err = alice
        .send_message("bob", b"hi", "c1", MessageType::Text)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Crypto(CryptoError::ChannelNotEstablished(ref peer)) if peer == "bob"
    ));
    assert!(alice.queued().is_empty());
}

#[tokio::test]
async fn send_to_unknown_peer_fails_when_relay_has_no_key() {
    let relay = relay_with(&["alice"]);
    let (alice, _events) = client(&relay, "alice");
    alice.connect("tok-alice").await.unwrap();

    let err = alice
        .send_message("ghost", b"hi", "c1", MessageType::Text)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Crypto(CryptoError::ChannelNotEstablished(_))));
}

#[tokio::test]
async fn connection_loss_reconnects_and_drains_queue() {
    let relay = relay_with(&["alice"]);
    let (alice, mut events) = client(&relay, "alice");
    let bob = client(&relay, "bob").0;
    alice.establish_channel("bob", &public_key_of(&bob)).unwrap();
    alice.connect("tok-alice").await.unwrap();

    relay.set_available(false);
    relay.disconnect_user("alice");
    next_event(&mut events, |ev| {
        matches!(ev, TransportEvent::Disconnected { reconnecting: true })
    })
    .await;
    assert!(!alice.is_connected());

    let local = alice
        .send_message("bob", b"while away", "c1", MessageType::Text)
        .await
        .unwrap();
    assert_eq!(alice.queued().len(), 1);

    relay.set_available(true);
    next_event(&mut events, |ev| matches!(ev, TransportEvent::Connected { .. })).await;
    next_event(&mut events, |ev| {
        matches!(ev, TransportEvent::MessageSent { local_id, .. } if *local_id == local)
    })
    .await;
    assert_eq!(relay.chat_messages("c1").len(), 1);
}

#[tokio::test]
async fn in_flight_send_is_resent_after_link_loss_and_stored_once() {
    let relay = relay_with(&["alice", "bob"]);
    let ((alice, mut alice_events), (bob, mut bob_events)) = pair(&relay).await;
    alice.establish_channel("bob", &public_key_of(&bob)).unwrap();

    // Nothing yields between the write and the drop, so the relay stores the
    // message with no connection left to echo it to.
    let local = alice
        .send_message("bob", b"in flight", "c1", MessageType::Text)
        .await
        .unwrap();
    relay.disconnect_user("alice");
    assert_eq!(alice.queued().len(), 1);

    next_event(&mut alice_events, |ev| {
        matches!(ev, TransportEvent::Disconnected { reconnecting: true })
    })
    .await;
    next_event(&mut alice_events, |ev| {
        matches!(ev, TransportEvent::MessageSent { local_id, .. } if *local_id == local)
    })
    .await;
    assert!(alice.queued().is_empty());
    assert_eq!(relay.message_count(), 1);

    next_event(&mut bob_events, |ev| matches!(ev, TransportEvent::MessageReceived { .. })).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(ev) = bob_events.try_recv() {
        assert!(!matches!(ev, TransportEvent::MessageReceived { .. }));
    }
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let relay = relay_with(&["alice"]);
    relay.set_available(false);
    let (alice, mut events) = client(&relay, "alice");

    let err = alice.connect("tok-alice").await.unwrap_err();
    assert!(matches!(err, TransportError::Network(_)));
    let ev = next_event(&mut events, |ev| matches!(ev, TransportEvent::ReconnectExhausted { .. })).await;
    assert!(matches!(ev, TransportEvent::ReconnectExhausted { attempts: 4 }));
    assert!(!alice.is_connected());
}

#[tokio::test]
async fn rejected_token_is_not_retried() {
    let relay = relay_with(&["alice"]);
    let (alice, mut events) = client(&relay, "alice");

    let err = alice.connect("stolen").await.unwrap_err();
    assert!(matches!(err, TransportError::Auth(_)));
    next_event(&mut events, |ev| matches!(ev, TransportEvent::AuthRejected { .. })).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!alice.is_connected());
    assert_eq!(relay.connection_count("alice"), 0);
}

#[tokio::test]
async fn connect_requires_identity() {
    let relay = relay_with(&["alice"]);
    let connector: Arc<dyn Connector> = Arc::new(relay.clone());
    let keys = Arc::new(Mutex::new(KeyManager::new(CryptoBackend::system())));
    let (alice, _events) = SessionTransport::builder("alice", keys, connector).build();

    let err = alice.connect("tok-alice").await.unwrap_err();
    assert!(matches!(err, TransportError::Crypto(CryptoError::IdentityNotInitialized)));
}

#[tokio::test]
async fn message_under_wrong_key_is_undecryptable() {
    let relay = relay_with(&["bob", "carol"]);
    let (bob, mut bob_events) = client(&relay, "bob");
    let (carol, _carol_events) = client(&relay, "carol");

    // Carol holds a stale key for bob.
    let impostor = client(&relay, "impostor").0;
    carol.establish_channel("bob", &public_key_of(&impostor)).unwrap();

    bob.connect("tok-bob").await.unwrap();
    carol.connect("tok-carol").await.unwrap();
    wait_until(|| relay.public_key("carol").is_some()).await;

    carol
        .send_message("bob", b"secret", "c2", MessageType::Text)
        .await
        .unwrap();

    let ev = next_event(&mut bob_events, |ev| matches!(ev, TransportEvent::Undecryptable { .. })).await;
    let TransportEvent::Undecryptable {
        sender_id, reason, ..
    } = ev
    else {
        unreachable!()
    };
    assert_eq!(sender_id, "carol");
    assert_eq!(reason, CryptoError::DecryptionFailure);
}

#[tokio::test]
async fn typing_indicator_expires_without_stop() {
    let relay = relay_with(&["alice", "bob"]);
    let ((alice, mut alice_events), (bob, _bob_events)) = pair(&relay).await;
    alice.join_chat("c1");
    bob.join_chat("c1");
    wait_until(|| relay.room_members("c1").len() == 2).await;

    bob.start_typing("c1");
    next_event(&mut alice_events, |ev| matches!(ev, TransportEvent::TypingStarted { .. })).await;
    assert_eq!(alice.typing_users("c1"), ["bob"]);

    let ev = next_event(&mut alice_events, |ev| matches!(ev, TransportEvent::TypingStopped { .. })).await;
    assert!(matches!(ev, TransportEvent::TypingStopped { expired: true, .. }));
    assert!(alice.typing_users("c1").is_empty());
}

#[tokio::test]
async fn explicit_stop_clears_typing() {
    let relay = relay_with(&["alice", "bob"]);
    let ((alice, mut alice_events), (bob, _bob_events)) = pair(&relay).await;
    alice.join_chat("c1");
    bob.join_chat("c1");
    wait_until(|| relay.room_members("c1").len() == 2).await;

    bob.start_typing("c1");
    next_event(&mut alice_events, |ev| matches!(ev, TransportEvent::TypingStarted { .. })).await;
    bob.stop_typing("c1");
    let ev = next_event(&mut alice_events, |ev| matches!(ev, TransportEvent::TypingStopped { .. })).await;
    assert!(matches!(ev, TransportEvent::TypingStopped { expired: false, .. }));
}

#[tokio::test]
async fn only_the_sender_edits_and_deletes() {
    let relay = relay_with(&["alice", "bob"]);
    let ((alice, mut alice_events), (bob, mut bob_events)) = pair(&relay).await;
    let id = delivered(&alice, &mut bob_events, &mut alice_events, b"draft").await;

    assert!(matches!(
        bob.edit_message(&id, b"forged"),
        Err(TransportError::NotSender(_))
    ));
    assert!(matches!(
        bob.delete_message(&id).await,
        Err(TransportError::NotSender(_))
    ));

    alice.edit_message(&id, b"final").unwrap();
    let ev = next_event(&mut bob_events, |ev| matches!(ev, TransportEvent::MessageEdited { .. })).await;
    let TransportEvent::MessageEdited { plaintext, .. } = ev else {
        unreachable!()
    };
    assert_eq!(plaintext.as_slice(), b"final");
    assert!(bob.message(&id).unwrap().is_edited);

    assert!(alice.delete_message(&id).await.unwrap());
    assert!(!alice.delete_message(&id).await.unwrap());
    next_event(&mut bob_events, |ev| matches!(ev, TransportEvent::MessageDeleted { .. })).await;

    let tomb = bob.message(&id).unwrap();
    assert!(tomb.is_deleted);
    assert!(tomb.ciphertext.is_empty());
    assert!(matches!(
        alice.edit_message(&id, b"again"),
        Err(TransportError::MessageDeleted(_))
    ));
}

#[tokio::test]
async fn undecryptable_edit_leaves_the_envelope_untouched() {
    let relay = relay_with(&["alice", "bob"]);
    let ((alice, mut alice_events), (bob, mut bob_events)) = pair(&relay).await;
    let id = delivered(&alice, &mut bob_events, &mut alice_events, b"original").await;
    let before = bob.message(&id).unwrap();

    // A second session of alice's pushes content bob cannot open.
    let rogue = relay.open_session("alice");
    rogue
        .outbound
        .send(ClientEvent::EditMessage {
            message_id: id.clone(),
            ciphertext: "AAAA".into(),
            iv: "AAAAAAAAAAAAAAAA".into(),
        })
        .unwrap();

    let ev = next_event(&mut bob_events, |ev| matches!(ev, TransportEvent::Undecryptable { .. })).await;
    assert!(matches!(
        ev,
        TransportEvent::Undecryptable { ref message_id, reason: CryptoError::DecryptionFailure, .. }
            if *message_id == id
    ));
    let after = bob.message(&id).unwrap();
    assert_eq!(after.ciphertext, before.ciphertext);
    assert_eq!(after.iv, before.iv);
    assert!(!after.is_edited);
    assert!(after.edited_at.is_none());
}

#[tokio::test]
async fn deleting_a_queued_send_withdraws_it() {
    let relay = relay_with(&["alice"]);
    let (alice, _events) = client(&relay, "alice");
    let bob = client(&relay, "bob").0;
    alice.establish_channel("bob", &public_key_of(&bob)).unwrap();

    let local = alice
        .send_message("bob", b"oops", "c1", MessageType::Text)
        .await
        .unwrap();
    assert!(alice.delete_message(&local).await.unwrap());
    assert!(alice.queued().is_empty());

    alice.connect("tok-alice").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.message_count(), 0);
}

#[tokio::test]
async fn reactions_are_idempotent_per_user_and_emoji() {
    let relay = relay_with(&["alice", "bob"]);
    let ((alice, mut alice_events), (bob, mut bob_events)) = pair(&relay).await;
    let id = delivered(&alice, &mut bob_events, &mut alice_events, b"nice").await;

    assert!(bob.add_reaction(&id, "🔥").unwrap());
    assert!(!bob.add_reaction(&id, "🔥").unwrap());
    next_event(&mut alice_events, |ev| matches!(ev, TransportEvent::ReactionAdded { .. })).await;
    wait_until(|| relay.message(&id).is_some_and(|m| m.reactions.count("🔥") == 1)).await;
    assert!(alice.message(&id).unwrap().reactions.contains("bob", "🔥"));

    assert!(bob.remove_reaction(&id, "🔥").unwrap());
    assert!(!bob.remove_reaction(&id, "🔥").unwrap());
    next_event(&mut alice_events, |ev| matches!(ev, TransportEvent::ReactionRemoved { .. })).await;
    assert!(alice.message(&id).unwrap().reactions.is_empty());
}

#[tokio::test]
async fn presence_tracks_peer_connections() {
    let relay = relay_with(&["alice", "bob"]);
    let ((alice, mut alice_events), (bob, _bob_events)) = pair(&relay).await;
    next_event(&mut alice_events, |ev| {
        matches!(ev, TransportEvent::PresenceChanged { online: true, .. })
    })
    .await;
    assert!(alice.is_online("bob"));

    bob.disconnect().await;
    next_event(&mut alice_events, |ev| {
        matches!(ev, TransportEvent::PresenceChanged { online: false, .. })
    })
    .await;
    assert!(!alice.is_online("bob"));
}
