//! Inbound dispatch: applies relay events to session state in arrival order.

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use hl_crypto::{CryptoError, EncryptedBlob};
use hl_proto::{codec, ClientEvent, MessageEnvelope, MessageStatus, RelayedMessage, ServerEvent};

use crate::{events::TransportEvent, transport::SessionTransport};

impl SessionTransport {
    pub(crate) async fn handle_server_event(&self, event: ServerEvent) {
        tracing::trace!(event = event.name(), "relay event");
        match event {
            ServerEvent::PublicKeyResponse {
                recipient_id,
                public_key: Some(key),
            } => {
                // Failures are logged and surfaced to waiters.
                let _ = self.establish_channel(&recipient_id, &key);
            }
            ServerEvent::PublicKeyResponse {
                recipient_id,
                public_key: None,
            } => self.fail_key_request(&recipient_id),
            ServerEvent::EncryptedMessage(msg) if msg.sender_id == self.shared.user_id => {
                if self.acknowledge_own(msg) {
                    self.persist_outbox().await;
                }
            }
            ServerEvent::EncryptedMessage(msg) => self.receive_peer_message(msg),
            ServerEvent::UserTyping { user_id, chat_id } => self.typing_started(chat_id, user_id),
            ServerEvent::UserStoppedTyping { user_id, chat_id } => {
                self.typing_stopped(chat_id, user_id)
            }
            ServerEvent::UserOnline { user_id } => self.set_presence(user_id, true),
            ServerEvent::UserOffline { user_id } => self.set_presence(user_id, false),
            ServerEvent::MessageDelivered { message_id, .. } => {
                self.apply_remote_status(&message_id, MessageStatus::Delivered)
            }
            ServerEvent::MessageRead { message_id, .. } => {
                self.apply_remote_status(&message_id, MessageStatus::Read)
            }
            ServerEvent::ReactionAdded {
                message_id,
                user_id,
                emoji,
            } => self.apply_remote_reaction(message_id, user_id, emoji, true),
            ServerEvent::ReactionRemoved {
                message_id,
                user_id,
                emoji,
            } => self.apply_remote_reaction(message_id, user_id, emoji, false),
            ServerEvent::MessageEdited {
                message_id,
                chat_id,
                ciphertext,
                iv,
                edited_at,
            } => self.apply_remote_edit(message_id, chat_id, ciphertext, iv, edited_at),
            ServerEvent::MessageDeleted {
                message_id,
                chat_id,
                deleted_at,
            } => self.apply_remote_delete(message_id, chat_id, deleted_at),
            ServerEvent::Error { message } => {
                tracing::warn!(%message, "relay reported an error");
                self.emit(TransportEvent::RelayError { message });
            }
        }
    }

    /// Relay echo of our own send. Returns true if the outbox changed.
    fn acknowledge_own(&self, msg: RelayedMessage) -> bool {
        let mut st = self.shared.state.lock();
        let Some(local_id) = msg.temp_id.clone() else {
            st.messages
                .entry(msg.id.clone())
                .or_insert_with(|| MessageEnvelope::from_relayed(&msg, MessageStatus::Sent));
            return false;
        };
        let acked = st.outbox.ack(&local_id).is_some();

        match st.messages.remove(&local_id) {
            Some(mut env) => {
                env.id = msg.id.clone();
                env.created_at = msg.created_at;
                let advanced = env.apply_status(MessageStatus::Sent);
                st.aliases.insert(local_id.clone(), msg.id.clone());
                st.messages.insert(msg.id.clone(), env);
                drop(st);

                tracing::debug!(%local_id, message_id = %msg.id, "send acknowledged");
                self.emit(TransportEvent::MessageSent {
                    local_id,
                    message_id: msg.id.clone(),
                });
                if advanced {
                    self.emit(TransportEvent::StatusChanged {
                        message_id: msg.id,
                        status: MessageStatus::Sent,
                    });
                }
            }
            None => {
                // Repeated echo, or a send from another session of ours.
                st.messages
                    .entry(msg.id.clone())
                    .or_insert_with(|| MessageEnvelope::from_relayed(&msg, MessageStatus::Sent));
            }
        }
        acked
    }

    /// Decrypt a peer's message, or park it until the peer's key arrives.
    pub(crate) fn receive_peer_message(&self, msg: RelayedMessage) {
        if msg.recipient_id != self.shared.user_id {
            // Fanned out to the room but encrypted for someone else.
            self.shared
                .state
                .lock()
                .messages
                .entry(msg.id.clone())
                .or_insert_with(|| MessageEnvelope::from_relayed(&msg, MessageStatus::Sent));
            return;
        }
        if self.shared.state.lock().messages.contains_key(&msg.id) {
            tracing::debug!(message_id = %msg.id, "duplicate delivery ignored");
            return;
        }
        if !self.shared.keys.lock().has_channel(&msg.sender_id) {
            self.park(msg);
            return;
        }

        match self.open_content(&msg.sender_id, &msg.ciphertext, &msg.iv) {
            Ok(plaintext) => {
                let envelope = MessageEnvelope::from_relayed(&msg, MessageStatus::Delivered);
                {
                    let mut st = self.shared.state.lock();
                    st.messages.insert(msg.id.clone(), envelope.clone());
                    st.send_control(ClientEvent::MessageDelivered {
                        message_id: msg.id.clone(),
                    });
                }
                tracing::debug!(message_id = %msg.id, sender = %msg.sender_id, "message received");
                self.emit(TransportEvent::MessageReceived {
                    envelope,
                    plaintext,
                });
            }
            Err(reason) => self.surface_undecryptable(&msg, reason),
        }
    }

    /// Decrypt and strip padding. Any failure is a `DecryptionFailure`
    /// except a missing channel.
    fn open_content(
        &self,
        peer_id: &str,
        ciphertext: &str,
        iv: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let blob = EncryptedBlob::from_b64(ciphertext, iv).map_err(|_| CryptoError::DecryptionFailure)?;
        let padded = self.shared.keys.lock().decrypt_from(peer_id, &blob)?;
        codec::unpad(&padded)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::DecryptionFailure)
    }

    fn park(&self, msg: RelayedMessage) {
        let sender_id = msg.sender_id.clone();
        let message_id = msg.id.clone();
        {
            let mut st = self.shared.state.lock();
            let parked = st.parked.entry(sender_id.clone()).or_default();
            if parked.iter().any(|m| m.id == message_id) {
                tracing::debug!(%message_id, "duplicate delivery of a parked message ignored");
                return;
            }
            parked.push(msg);
            st.send_advisory(ClientEvent::RequestPublicKey {
                recipient_id: sender_id.clone(),
            });
        }
        tracing::debug!(%sender_id, %message_id, "message parked until sender key arrives");

        let this = self.clone();
        let timeout = self.shared.config.key_request_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.expire_parked(&sender_id, &message_id);
        });
    }

    fn expire_parked(&self, sender_id: &str, message_id: &str) {
        let expired = {
            let mut st = self.shared.state.lock();
            let Some(list) = st.parked.get_mut(sender_id) else {
                return;
            };
            let msg = list
                .iter()
                .position(|m| m.id == message_id)
                .map(|pos| list.remove(pos));
            let now_empty = list.is_empty();
            if now_empty {
                st.parked.remove(sender_id);
            }
            msg
        };
        if let Some(msg) = expired {
            self.surface_undecryptable(&msg, CryptoError::ChannelNotEstablished(sender_id.to_string()));
        }
    }

    fn fail_key_request(&self, peer_id: &str) {
        let (waiters, parked) = {
            let mut st = self.shared.state.lock();
            (
                st.key_waiters.remove(peer_id).unwrap_or_default(),
                st.parked.remove(peer_id).unwrap_or_default(),
            )
        };
        tracing::warn!(peer_id, "relay has no public key for peer");
        let reason = CryptoError::ChannelNotEstablished(peer_id.to_string());
        for waiter in waiters {
            let _ = waiter.send(Err(reason.clone()));
        }
        for msg in parked {
            self.surface_undecryptable(&msg, reason.clone());
        }
    }

    /// Record the envelope (without acking it) and tell the caller.
    pub(crate) fn surface_undecryptable(&self, msg: &RelayedMessage, reason: CryptoError) {
        self.shared
            .state
            .lock()
            .messages
            .entry(msg.id.clone())
            .or_insert_with(|| MessageEnvelope::from_relayed(msg, MessageStatus::Sent));
        tracing::warn!(message_id = %msg.id, sender = %msg.sender_id, error = %reason, "undecryptable message");
        self.emit(TransportEvent::Undecryptable {
            message_id: msg.id.clone(),
            chat_id: msg.chat_id.clone(),
            sender_id: msg.sender_id.clone(),
            reason,
        });
    }

    fn apply_remote_status(&self, message_id: &str, status: MessageStatus) {
        let changed = {
            let mut st = self.shared.state.lock();
            match st.envelope_mut(message_id) {
                Some(env) => env.apply_status(status).then(|| env.id.clone()),
                None => {
                    tracing::debug!(message_id, ?status, "status for unknown message");
                    None
                }
            }
        };
        if let Some(message_id) = changed {
            self.emit(TransportEvent::StatusChanged { message_id, status });
        }
    }

    fn typing_started(&self, chat_id: String, user_id: String) {
        if user_id == self.shared.user_id {
            return;
        }
        let (seq, fresh) = {
            let mut st = self.shared.state.lock();
            st.typing_seq += 1;
            let seq = st.typing_seq;
            let fresh = st
                .typing
                .insert((chat_id.clone(), user_id.clone()), seq)
                .is_none();
            (seq, fresh)
        };
        if fresh {
            self.emit(TransportEvent::TypingStarted {
                chat_id: chat_id.clone(),
                user_id: user_id.clone(),
            });
        }

        let this = self.clone();
        let timeout = self.shared.config.typing_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.expire_typing(chat_id, user_id, seq);
        });
    }

    fn expire_typing(&self, chat_id: String, user_id: String, seq: u64) {
        let key = (chat_id, user_id);
        let expired = {
            let mut st = self.shared.state.lock();
            if st.typing.get(&key) == Some(&seq) {
                st.typing.remove(&key);
                true
            } else {
                false
            }
        };
        if expired {
            let (chat_id, user_id) = key;
            tracing::debug!(%chat_id, %user_id, "typing indicator expired");
            self.emit(TransportEvent::TypingStopped {
                chat_id,
                user_id,
                expired: true,
            });
        }
    }

    fn typing_stopped(&self, chat_id: String, user_id: String) {
        let key = (chat_id, user_id);
        if self.shared.state.lock().typing.remove(&key).is_some() {
            let (chat_id, user_id) = key;
            self.emit(TransportEvent::TypingStopped {
                chat_id,
                user_id,
                expired: false,
            });
        }
    }

    fn set_presence(&self, user_id: String, online: bool) {
        let changed = {
            let mut st = self.shared.state.lock();
            if online {
                st.online.insert(user_id.clone())
            } else {
                st.online.remove(&user_id)
            }
        };
        if changed {
            self.emit(TransportEvent::PresenceChanged { user_id, online });
        }
    }

    fn apply_remote_reaction(&self, message_id: String, user_id: String, emoji: String, added: bool) {
        let changed = {
            let mut st = self.shared.state.lock();
            match st.envelope_mut(&message_id) {
                Some(env) if added => env.reactions.add(&user_id, &emoji),
                Some(env) => env.reactions.remove(&user_id, &emoji),
                None => false,
            }
        };
        if !changed {
            return;
        }
        self.emit(if added {
            TransportEvent::ReactionAdded {
                message_id,
                user_id,
                emoji,
            }
        } else {
            TransportEvent::ReactionRemoved {
                message_id,
                user_id,
                emoji,
            }
        });
    }

    fn apply_remote_edit(
        &self,
        message_id: String,
        chat_id: String,
        ciphertext: String,
        iv: String,
        edited_at: DateTime<Utc>,
    ) {
        let (id, sender_id, peer_id) = {
            let mut st = self.shared.state.lock();
            let Some(env) = st.envelope_mut(&message_id) else {
                tracing::debug!(%message_id, "edit for unknown message");
                return;
            };
            // Our own edit coming back.
            if env.is_deleted || (env.ciphertext == ciphertext && env.iv == iv) {
                return;
            }
            let peer_id = if env.sender_id == self.shared.user_id {
                env.recipient_id.clone()
            } else {
                env.sender_id.clone()
            };
            (env.id.clone(), env.sender_id.clone(), peer_id)
        };

        // The stored envelope only changes once the new content opens.
        match self.open_content(&peer_id, &ciphertext, &iv) {
            Ok(plaintext) => {
                let applied = self
                    .shared
                    .state
                    .lock()
                    .envelope_mut(&id)
                    .is_some_and(|env| env.apply_edit(ciphertext, iv, edited_at));
                if applied {
                    self.emit(TransportEvent::MessageEdited {
                        message_id: id,
                        chat_id,
                        plaintext,
                    });
                }
            }
            Err(reason) => {
                tracing::warn!(message_id = %id, error = %reason, "undecryptable edit");
                self.emit(TransportEvent::Undecryptable {
                    message_id: id,
                    chat_id,
                    sender_id,
                    reason,
                });
            }
        }
    }

    fn apply_remote_delete(&self, message_id: String, chat_id: String, deleted_at: DateTime<Utc>) {
        let deleted = {
            let mut st = self.shared.state.lock();
            st.envelope_mut(&message_id)
                .filter(|env| !env.is_deleted)
                .map(|env| {
                    env.tombstone(deleted_at);
                    env.id.clone()
                })
        };
        if let Some(message_id) = deleted {
            self.emit(TransportEvent::MessageDeleted {
                message_id,
                chat_id,
            });
        }
    }
}
