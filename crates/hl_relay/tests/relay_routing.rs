//! Relay routing tests
//!
//! The relay only routes: it never decrypts, so payloads here are arbitrary
//! strings.

use std::sync::Arc;
use std::time::Duration;

use hl_proto::{
    ClientEvent, ConnectError, Connection, Connector, MessageStatus, MessageType, ServerEvent,
};
use hl_relay::{Relay, SessionRegistry};

fn relay_with(users: &[&str]) -> Relay {
    let sessions = Arc::new(SessionRegistry::new());
    let far = chrono::Utc::now() + chrono::Duration::hours(1);
    for user in users {
        sessions.insert(&format!("tok-{user}"), user, far);
    }
    Relay::new(sessions)
}

async fn connect(relay: &Relay, user: &str) -> Connection {
    relay.connect(&format!("tok-{user}")).await.unwrap()
}

/// Wait for the first event matching `pred`, skipping everything else.
async fn next_where(conn: &mut Connection, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let ev = conn.inbound.recv().await.expect("relay closed the session");
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("timed out waiting for relay event")
}

/// Round trip on one connection so every earlier event from it is applied.
async fn sync(conn: &mut Connection) {
    conn.outbound
        .send(ClientEvent::RequestPublicKey {
            recipient_id: "__sync".into(),
        })
        .unwrap();
    next_where(conn, |ev| {
        matches!(ev, ServerEvent::PublicKeyResponse { recipient_id, .. } if recipient_id == "__sync")
    })
    .await;
}

fn send(conn: &Connection, chat: &str, to: &str, temp_id: &str) {
    conn.outbound
        .send(ClientEvent::EncryptedMessage {
            chat_id: chat.into(),
            recipient_id: to.into(),
            ciphertext: format!("ct-{temp_id}"),
            iv: "iv".into(),
            message_type: MessageType::Text,
            temp_id: temp_id.into(),
        })
        .unwrap();
}

async fn echo_id(conn: &mut Connection, temp_id: &str) -> String {
    match next_where(conn, |ev| {
        matches!(ev, ServerEvent::EncryptedMessage(m) if m.temp_id.as_deref() == Some(temp_id))
    })
    .await
    {
        ServerEvent::EncryptedMessage(m) => m.id,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    let relay = relay_with(&["alice"]);
    let err = relay.connect("nope").await.unwrap_err();
    assert!(matches!(err, ConnectError::Unauthorized(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn unavailable_relay_is_a_network_error() {
    let relay = relay_with(&["alice"]);
    relay.set_available(false);
    let err = relay.connect("tok-alice").await.unwrap_err();
    assert!(err.is_retryable());

    relay.set_available(true);
    let conn = connect(&relay, "alice").await;
    assert_eq!(conn.user_id, "alice");
}

#[tokio::test]
async fn public_keys_are_served_or_null() {
    let relay = relay_with(&["alice", "bob"]);
    let mut alice = connect(&relay, "alice").await;
    let mut bob = connect(&relay, "bob").await;

    bob.outbound
        .send(ClientEvent::RegisterPublicKey {
            public_key: "bob-pk".into(),
        })
        .unwrap();
    sync(&mut bob).await;

    for (who, expected) in [("bob", Some("bob-pk")), ("carol", None)] {
        alice
            .outbound
            .send(ClientEvent::RequestPublicKey {
                recipient_id: who.into(),
            })
            .unwrap();
        let ev = next_where(&mut alice, |ev| matches!(ev, ServerEvent::PublicKeyResponse { .. })).await;
        assert_eq!(
            ev,
            ServerEvent::PublicKeyResponse {
                recipient_id: who.into(),
                public_key: expected.map(String::from),
            }
        );
    }
}

#[tokio::test]
async fn sender_gets_echo_and_recipient_gets_copy_without_temp_id() {
    let relay = relay_with(&["alice", "bob"]);
    let mut alice = connect(&relay, "alice").await;
    let mut bob = connect(&relay, "bob").await;

    send(&alice, "c1", "bob", "tmp-1");
    let id = echo_id(&mut alice, "tmp-1").await;

    let ev = next_where(&mut bob, |ev| matches!(ev, ServerEvent::EncryptedMessage(_))).await;
    let ServerEvent::EncryptedMessage(copy) = ev else { unreachable!() };
    assert_eq!(copy.id, id);
    assert_eq!(copy.sender_id, "alice");
    assert_eq!(copy.ciphertext, "ct-tmp-1");
    assert!(copy.temp_id.is_none());

    assert_eq!(relay.message(&id).unwrap().status, MessageStatus::Sent);
}

#[tokio::test]
async fn resent_temp_id_is_stored_once() {
    let relay = relay_with(&["alice"]);
    let mut alice = connect(&relay, "alice").await;

    send(&alice, "c1", "bob", "tmp-1");
    let first = echo_id(&mut alice, "tmp-1").await;
    send(&alice, "c1", "bob", "tmp-1");
    let second = echo_id(&mut alice, "tmp-1").await;

    assert_eq!(first, second);
    assert_eq!(relay.chat_messages("c1").len(), 1);
}

#[tokio::test]
async fn chat_messages_keep_arrival_order() {
    let relay = relay_with(&["alice"]);
    let mut alice = connect(&relay, "alice").await;
    for t in ["a", "b", "c"] {
        send(&alice, "c1", "bob", t);
    }
    sync(&mut alice).await;

    let order: Vec<_> = relay
        .chat_messages("c1")
        .into_iter()
        .map(|m| m.ciphertext)
        .collect();
    assert_eq!(order, ["ct-a", "ct-b", "ct-c"]);
}

#[tokio::test]
async fn only_recipient_advances_status_and_never_backwards() {
    let relay = relay_with(&["alice", "bob", "mallory"]);
    let mut alice = connect(&relay, "alice").await;
    let mut bob = connect(&relay, "bob").await;
    let mut mallory = connect(&relay, "mallory").await;

    send(&alice, "c1", "bob", "tmp-1");
    let id = echo_id(&mut alice, "tmp-1").await;

    mallory
        .outbound
        .send(ClientEvent::MessageRead {
            message_id: id.clone(),
            chat_id: "c1".into(),
        })
        .unwrap();
    sync(&mut mallory).await;
    assert_eq!(relay.message(&id).unwrap().status, MessageStatus::Sent);

    bob.outbound
        .send(ClientEvent::MessageRead {
            message_id: id.clone(),
            chat_id: "c1".into(),
        })
        .unwrap();
    bob.outbound
        .send(ClientEvent::MessageDelivered {
            message_id: id.clone(),
        })
        .unwrap();
    sync(&mut bob).await;
    assert_eq!(relay.message(&id).unwrap().status, MessageStatus::Read);

    let ev = next_where(&mut alice, |ev| matches!(ev, ServerEvent::MessageRead { .. })).await;
    assert_eq!(
        ev,
        ServerEvent::MessageRead {
            message_id: id,
            chat_id: "c1".into(),
            read_by: "bob".into(),
        }
    );
}

#[tokio::test]
async fn edit_and_delete_are_sender_only() {
    let relay = relay_with(&["alice", "bob"]);
    let mut alice = connect(&relay, "alice").await;
    let mut bob = connect(&relay, "bob").await;

    send(&alice, "c1", "bob", "tmp-1");
    let id = echo_id(&mut alice, "tmp-1").await;

    bob.outbound
        .send(ClientEvent::EditMessage {
            message_id: id.clone(),
            ciphertext: "forged".into(),
            iv: "iv2".into(),
        })
        .unwrap();
    let ev = next_where(&mut bob, |ev| matches!(ev, ServerEvent::Error { .. })).await;
    assert!(matches!(ev, ServerEvent::Error { message } if message.contains("only the sender")));

    alice
        .outbound
        .send(ClientEvent::EditMessage {
            message_id: id.clone(),
            ciphertext: "ct-2".into(),
            iv: "iv2".into(),
        })
        .unwrap();
    let ev = next_where(&mut bob, |ev| matches!(ev, ServerEvent::MessageEdited { .. })).await;
    assert!(matches!(ev, ServerEvent::MessageEdited { ciphertext, .. } if ciphertext == "ct-2"));

    alice
        .outbound
        .send(ClientEvent::DeleteMessage {
            message_id: id.clone(),
        })
        .unwrap();
    next_where(&mut bob, |ev| matches!(ev, ServerEvent::MessageDeleted { .. })).await;

    let stored = relay.message(&id).unwrap();
    assert!(stored.is_deleted);
    assert!(stored.ciphertext.is_empty());
}

#[tokio::test]
async fn reactions_are_idempotent() {
    let relay = relay_with(&["alice", "bob"]);
    let mut alice = connect(&relay, "alice").await;
    let mut bob = connect(&relay, "bob").await;

    send(&alice, "c1", "bob", "tmp-1");
    let id = echo_id(&mut alice, "tmp-1").await;

    for _ in 0..2 {
        bob.outbound
            .send(ClientEvent::AddReaction {
                message_id: id.clone(),
                emoji: "👍".into(),
            })
            .unwrap();
    }
    sync(&mut bob).await;

    let stored = relay.message(&id).unwrap();
    assert_eq!(stored.reactions.count("👍"), 1);
    assert!(stored.reactions.contains("bob", "👍"));
    next_where(&mut alice, |ev| matches!(ev, ServerEvent::ReactionAdded { .. })).await;

    bob.outbound
        .send(ClientEvent::RemoveReaction {
            message_id: id.clone(),
            emoji: "👍".into(),
        })
        .unwrap();
    next_where(&mut alice, |ev| matches!(ev, ServerEvent::ReactionRemoved { .. })).await;
    assert!(relay.message(&id).unwrap().reactions.is_empty());
}

#[tokio::test]
async fn typing_reaches_room_members_but_not_the_typist() {
    let relay = relay_with(&["alice", "bob"]);
    let mut alice = connect(&relay, "alice").await;
    let mut bob = connect(&relay, "bob").await;

    for conn in [&alice, &bob] {
        conn.outbound
            .send(ClientEvent::JoinChat {
                chat_id: "c1".into(),
            })
            .unwrap();
    }
    sync(&mut alice).await;
    sync(&mut bob).await;

    alice
        .outbound
        .send(ClientEvent::Typing {
            chat_id: "c1".into(),
        })
        .unwrap();
    let ev = next_where(&mut bob, |ev| matches!(ev, ServerEvent::UserTyping { .. })).await;
    assert_eq!(
        ev,
        ServerEvent::UserTyping {
            user_id: "alice".into(),
            chat_id: "c1".into(),
        }
    );

    // Anything addressed to alice by her own typing would arrive before this.
    alice
        .outbound
        .send(ClientEvent::RequestPublicKey {
            recipient_id: "__sync".into(),
        })
        .unwrap();
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(2), alice.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        match ev {
            ServerEvent::PublicKeyResponse { .. } => break,
            ServerEvent::UserTyping { .. } => panic!("typist saw their own typing event"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn presence_follows_first_and_last_connection() {
    let relay = relay_with(&["alice", "bob"]);
    let mut alice = connect(&relay, "alice").await;

    let bob1 = connect(&relay, "bob").await;
    let bob2 = connect(&relay, "bob").await;
    assert_eq!(relay.connection_count("bob"), 2);
    next_where(&mut alice, |ev| matches!(ev, ServerEvent::UserOnline { user_id } if user_id == "bob")).await;

    drop(bob1);
    drop(bob2);
    next_where(&mut alice, |ev| matches!(ev, ServerEvent::UserOffline { user_id } if user_id == "bob")).await;
    assert!(!relay.is_online("bob"));
}

#[tokio::test]
async fn disconnect_user_closes_inbound() {
    let relay = relay_with(&["alice"]);
    let mut alice = connect(&relay, "alice").await;

    assert_eq!(relay.disconnect_user("alice"), 1);
    let closed = tokio::time::timeout(Duration::from_secs(1), alice.inbound.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
    assert!(!relay.is_online("alice"));
}
