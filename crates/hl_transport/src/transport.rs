//! SessionTransport: connection lifecycle, outbound retry queue, and the
//! caller-facing message, typing, reaction, edit and delete operations.
//!
//! All mutable session state sits behind one short-lived lock and is never
//! held across an await. Inbound events are applied in arrival order by a
//! single reader task per connection (see `inbound`).

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;
use zeroize::Zeroizing;

use hl_crypto::{CryptoError, KeyManager};
use hl_proto::{
    codec, ClientEvent, ConnectError, Connection, Connector, MessageEnvelope, MessageStatus,
    MessageType, QueuedMessage, ServerEvent,
};
use hl_store::{SecureVault, OUTBOX_KEY};

use crate::{
    config::TransportConfig, error::TransportError, events::TransportEvent, outbox::Outbox,
};

/// Key manager shared between the transport and its owner.
pub type SharedKeys = Arc<Mutex<KeyManager>>;

/// Receiving half of the transport's notification stream.
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

pub(crate) type KeyWaiter = oneshot::Sender<Result<(), CryptoError>>;

pub(crate) enum Link {
    Offline,
    Online {
        outbound: mpsc::UnboundedSender<ClientEvent>,
        reader: JoinHandle<()>,
    },
}

pub(crate) struct State {
    pub(crate) link: Link,
    /// Bumped on every attach/detach so stale reader tasks are ignored.
    pub(crate) generation: u64,
    pub(crate) token: Option<String>,
    /// Set by an explicit disconnect or an auth rejection.
    pub(crate) stopped: bool,
    pub(crate) reconnecting: bool,
    pub(crate) outbox: Outbox,
    /// Acks, reactions, edits and deletes issued while offline.
    pub(crate) control: VecDeque<ClientEvent>,
    pub(crate) messages: HashMap<String, MessageEnvelope>,
    /// local id -> relay id, once the relay has echoed a send.
    pub(crate) aliases: HashMap<String, String>,
    pub(crate) key_waiters: HashMap<String, Vec<KeyWaiter>>,
    /// Inbound messages waiting for their sender's public key.
    pub(crate) parked: HashMap<String, Vec<hl_proto::RelayedMessage>>,
    pub(crate) joined: BTreeSet<String>,
    /// (chat, user) -> sequence of the latest `typing` seen.
    pub(crate) typing: HashMap<(String, String), u64>,
    pub(crate) typing_seq: u64,
    pub(crate) online: HashSet<String>,
}

impl State {
    fn new(config: &TransportConfig) -> Self {
        Self {
            link: Link::Offline,
            generation: 0,
            token: None,
            stopped: false,
            reconnecting: false,
            outbox: Outbox::new(config.queue.clone()),
            control: VecDeque::new(),
            messages: HashMap::new(),
            aliases: HashMap::new(),
            key_waiters: HashMap::new(),
            parked: HashMap::new(),
            joined: BTreeSet::new(),
            typing: HashMap::new(),
            typing_seq: 0,
            online: HashSet::new(),
        }
    }

    pub(crate) fn outbound(&self) -> Option<&mpsc::UnboundedSender<ClientEvent>> {
        match &self.link {
            Link::Online { outbound, .. } => Some(outbound),
            Link::Offline => None,
        }
    }

    pub(crate) fn is_online(&self) -> bool {
        matches!(self.link, Link::Online { .. })
    }

    pub(crate) fn resolve(&self, id: &str) -> String {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    pub(crate) fn envelope_mut(&mut self, id: &str) -> Option<&mut MessageEnvelope> {
        let id = self.resolve(id);
        self.messages.get_mut(&id)
    }

    /// Write now if online, otherwise hold until the next connect.
    pub(crate) fn send_control(&mut self, event: ClientEvent) {
        let event = match self.outbound() {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        self.control.push_back(event);
    }

    /// Best-effort write; dropped while offline.
    pub(crate) fn send_advisory(&self, event: ClientEvent) {
        if let Some(tx) = self.outbound() {
            let _ = tx.send(event);
        }
    }
}

pub(crate) struct Shared {
    pub(crate) user_id: String,
    pub(crate) keys: SharedKeys,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) vault: Option<Arc<SecureVault>>,
    pub(crate) config: TransportConfig,
    pub(crate) events: mpsc::UnboundedSender<TransportEvent>,
    pub(crate) state: Mutex<State>,
    /// Serialises outbox snapshots into the vault.
    pub(crate) persist: tokio::sync::Mutex<()>,
}

/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct SessionTransport {
    pub(crate) shared: Arc<Shared>,
}

pub struct TransportBuilder {
    user_id: String,
    keys: SharedKeys,
    connector: Arc<dyn Connector>,
    vault: Option<Arc<SecureVault>>,
    config: TransportConfig,
}

impl TransportBuilder {
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist the outbound queue in this vault.
    pub fn vault(mut self, vault: Arc<SecureVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn build(self) -> (SessionTransport, EventStream) {
        let (events, stream) = mpsc::unbounded_channel();
        let state = State::new(&self.config);
        let transport = SessionTransport {
            shared: Arc::new(Shared {
                user_id: self.user_id,
                keys: self.keys,
                connector: self.connector,
                vault: self.vault,
                config: self.config,
                events,
                state: Mutex::new(state),
                persist: tokio::sync::Mutex::new(()),
            }),
        };
        (transport, stream)
    }
}

pub(crate) fn sending_envelope(sender_id: &str, msg: &QueuedMessage) -> MessageEnvelope {
    MessageEnvelope {
        id: msg.local_id.clone(),
        chat_id: msg.chat_id.clone(),
        sender_id: sender_id.to_string(),
        recipient_id: msg.recipient_id.clone(),
        ciphertext: msg.ciphertext.clone(),
        iv: msg.iv.clone(),
        message_type: msg.message_type,
        status: MessageStatus::Sending,
        is_edited: false,
        is_deleted: false,
        reactions: Default::default(),
        created_at: msg.created_at,
        edited_at: None,
        deleted_at: None,
    }
}

impl SessionTransport {
    pub fn builder(
        user_id: impl Into<String>,
        keys: SharedKeys,
        connector: Arc<dyn Connector>,
    ) -> TransportBuilder {
        TransportBuilder {
            user_id: user_id.into(),
            keys,
            connector,
            vault: None,
            config: TransportConfig::default(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn keys(&self) -> &SharedKeys {
        &self.shared.keys
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        // The owner may have dropped the stream; events are then discarded.
        let _ = self.shared.events.send(event);
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    /// Open the authenticated connection.
    ///
    /// On success the public key is registered, joined chats are re-joined,
    /// queued messages are flushed in enqueue order and then queued control
    /// events. A network failure returns an error but keeps reconnecting in
    /// the background with exponential backoff; an auth failure does not.
    pub async fn connect(&self, token: &str) -> Result<(), TransportError> {
        if !self.shared.keys.lock().has_identity() {
            return Err(CryptoError::IdentityNotInitialized.into());
        }
        {
            let mut st = self.shared.state.lock();
            st.token = Some(token.to_string());
            st.stopped = false;
            if st.is_online() {
                return Ok(());
            }
        }

        match self.shared.connector.connect(token).await {
            Ok(conn) => {
                self.attach(conn);
                Ok(())
            }
            Err(ConnectError::Unauthorized(reason)) => {
                self.reject(reason.clone());
                Err(TransportError::Auth(reason))
            }
            Err(ConnectError::Network(e)) => {
                tracing::warn!(error = %e, "relay unreachable; will retry");
                self.schedule_reconnect();
                Err(TransportError::Network(e))
            }
        }
    }

    /// Close the connection and stop reconnecting. In-flight sends go back
    /// to the queue for the next `connect`.
    pub async fn disconnect(&self) {
        let was_online = {
            let mut st = self.shared.state.lock();
            st.stopped = true;
            st.generation += 1;
            st.outbox.requeue_in_flight();
            match std::mem::replace(&mut st.link, Link::Offline) {
                Link::Online { reader, .. } => {
                    reader.abort();
                    true
                }
                Link::Offline => false,
            }
        };
        if was_online {
            tracing::info!("disconnected from relay");
            self.emit(TransportEvent::Disconnected { reconnecting: false });
        }
        self.persist_outbox().await;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().is_online()
    }

    fn reject(&self, reason: String) {
        {
            let mut st = self.shared.state.lock();
            st.token = None;
            st.stopped = true;
        }
        tracing::warn!(%reason, "relay rejected session token");
        self.emit(TransportEvent::AuthRejected { reason });
    }

    fn attach(&self, conn: Connection) {
        let Connection {
            user_id,
            outbound,
            inbound,
        } = conn;
        if user_id != self.shared.user_id {
            tracing::warn!(relay_user = %user_id, "relay authenticated a different user id");
        }
        let public_key = match self.shared.keys.lock().public_key() {
            Some(pk) => pk.to_b64(),
            None => {
                tracing::warn!("identity gone before attach; dropping connection");
                return;
            }
        };

        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        if st.stopped || st.is_online() {
            tracing::debug!("dropping redundant relay connection");
            return;
        }
        st.generation += 1;
        let generation = st.generation;

        let mut ok = outbound
            .send(ClientEvent::RegisterPublicKey { public_key })
            .is_ok();
        for chat_id in &st.joined {
            ok &= outbound
                .send(ClientEvent::JoinChat {
                    chat_id: chat_id.clone(),
                })
                .is_ok();
        }
        for peer in st.key_waiters.keys().chain(st.parked.keys()) {
            ok &= outbound
                .send(ClientEvent::RequestPublicKey {
                    recipient_id: peer.clone(),
                })
                .is_ok();
        }

        let mut flushed = 0usize;
        for msg in st.outbox.take_pending() {
            if ok && outbound.send(msg.to_event()).is_ok() {
                flushed += 1;
                st.outbox.push_in_flight(msg);
            } else {
                ok = false;
                st.outbox.push_pending(msg);
            }
        }
        while ok {
            let Some(event) = st.control.pop_front() else {
                break;
            };
            if let Err(mpsc::error::SendError(event)) = outbound.send(event) {
                st.control.push_front(event);
                ok = false;
            }
        }

        let reader = tokio::spawn(self.clone().read_loop(inbound, generation));
        st.link = Link::Online { outbound, reader };
        drop(guard);

        tracing::info!(user_id = %self.shared.user_id, flushed, "connected to relay");
        self.emit(TransportEvent::Connected {
            user_id: self.shared.user_id.clone(),
        });
    }

    async fn read_loop(self, mut inbound: mpsc::UnboundedReceiver<ServerEvent>, generation: u64) {
        while let Some(event) = inbound.recv().await {
            self.handle_server_event(event).await;
        }
        self.link_lost(generation);
    }

    fn link_lost(&self, generation: u64) {
        let reconnect = {
            let mut st = self.shared.state.lock();
            if st.generation != generation || !st.is_online() {
                return;
            }
            st.link = Link::Offline;
            let requeued = st.outbox.requeue_in_flight();
            tracing::warn!(requeued, "relay connection lost");
            !st.stopped
        };
        self.emit(TransportEvent::Disconnected {
            reconnecting: reconnect,
        });
        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.stopped || st.reconnecting || st.token.is_none() || st.is_online() {
                return;
            }
            st.reconnecting = true;
        }
        tokio::spawn(self.clone().reconnect_loop());
    }

    async fn reconnect_loop(self) {
        let backoff = self.shared.config.backoff.clone();
        for attempt in 0..backoff.max_attempts {
            tokio::time::sleep(backoff.delay(attempt)).await;
            let token = {
                let mut st = self.shared.state.lock();
                match st.token.clone() {
                    Some(token) if !st.stopped && !st.is_online() => token,
                    _ => {
                        st.reconnecting = false;
                        return;
                    }
                }
            };
            match self.shared.connector.connect(&token).await {
                Ok(conn) => {
                    self.shared.state.lock().reconnecting = false;
                    self.attach(conn);
                    return;
                }
                Err(ConnectError::Unauthorized(reason)) => {
                    self.shared.state.lock().reconnecting = false;
                    self.reject(reason);
                    return;
                }
                Err(ConnectError::Network(e)) => {
                    tracing::debug!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        self.shared.state.lock().reconnecting = false;
        tracing::warn!(attempts = backoff.max_attempts, "giving up on relay reconnection");
        self.emit(TransportEvent::ReconnectExhausted {
            attempts: backoff.max_attempts,
        });
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Encrypt and send `plaintext` to `recipient_id`. Returns the local id.
    ///
    /// Without a channel to the recipient the relay is asked for their key
    /// and the call waits up to `key_request_timeout` for it. Offline sends
    /// are queued (and persisted) until the next connect.
    pub async fn send_message(
        &self,
        recipient_id: &str,
        plaintext: &[u8],
        chat_id: &str,
        message_type: MessageType,
    ) -> Result<String, TransportError> {
        self.ensure_channel(recipient_id).await?;

        let padded = Zeroizing::new(codec::pad_to_bucket(plaintext, self.shared.config.padding));
        let blob = self.shared.keys.lock().encrypt_for(recipient_id, &padded)?;

        let local_id = Uuid::new_v4().to_string();
        let queued = QueuedMessage {
            local_id: local_id.clone(),
            chat_id: chat_id.to_string(),
            recipient_id: recipient_id.to_string(),
            ciphertext: blob.ciphertext_b64(),
            iv: blob.iv_b64(),
            message_type,
            created_at: Utc::now(),
            attempts: 0,
        };

        let transmitted = {
            let mut st = self.shared.state.lock();
            st.outbox.check_capacity(recipient_id)?;
            st.messages
                .insert(local_id.clone(), sending_envelope(&self.shared.user_id, &queued));
            let sent = st
                .outbound()
                .map(|tx| tx.send(queued.to_event()).is_ok())
                .unwrap_or(false);
            if sent {
                st.outbox.push_in_flight(queued);
            } else {
                st.outbox.push_pending(queued);
            }
            sent
        };
        tracing::debug!(%local_id, recipient_id, transmitted, "message accepted for delivery");

        self.persist_outbox().await;
        Ok(local_id)
    }

    /// Wait for a channel to `peer_id`, requesting the peer's key if needed.
    async fn ensure_channel(&self, peer_id: &str) -> Result<(), TransportError> {
        if self.shared.keys.lock().has_channel(peer_id) {
            return Ok(());
        }

        let waiter = {
            let mut st = self.shared.state.lock();
            let Some(tx) = st.outbound().cloned() else {
                return Err(CryptoError::ChannelNotEstablished(peer_id.to_string()).into());
            };
            let (wtx, wrx) = oneshot::channel();
            st.key_waiters
                .entry(peer_id.to_string())
                .or_default()
                .push(wtx);
            let _ = tx.send(ClientEvent::RequestPublicKey {
                recipient_id: peer_id.to_string(),
            });
            wrx
        };
        // The response may have landed between the first check and the request.
        if self.shared.keys.lock().has_channel(peer_id) {
            return Ok(());
        }

        tracing::debug!(peer_id, "waiting for peer public key");
        match tokio::time::timeout(self.shared.config.key_request_timeout(), waiter).await {
            Ok(Ok(result)) => result.map_err(TransportError::from),
            _ => {
                {
                    let mut st = self.shared.state.lock();
                    let now_empty = match st.key_waiters.get_mut(peer_id) {
                        Some(waiters) => {
                            waiters.retain(|w| !w.is_closed());
                            waiters.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        st.key_waiters.remove(peer_id);
                    }
                }
                if self.shared.keys.lock().has_channel(peer_id) {
                    Ok(())
                } else {
                    tracing::warn!(peer_id, "timed out waiting for peer public key");
                    Err(CryptoError::ChannelNotEstablished(peer_id.to_string()).into())
                }
            }
        }
    }

    /// Derive a channel from a peer key obtained out of band or from the
    /// relay, release waiting sends and open parked inbound messages.
    pub fn establish_channel(&self, peer_id: &str, public_key: &str) -> Result<(), TransportError> {
        let result = self
            .shared
            .keys
            .lock()
            .establish_channel(peer_id, public_key);
        let (waiters, parked) = {
            let mut st = self.shared.state.lock();
            (
                st.key_waiters.remove(peer_id).unwrap_or_default(),
                st.parked.remove(peer_id).unwrap_or_default(),
            )
        };

        match result {
            Ok(()) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.emit(TransportEvent::ChannelEstablished {
                    peer_id: peer_id.to_string(),
                });
                for msg in parked {
                    self.receive_peer_message(msg);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(peer_id, error = %e, "peer key rejected");
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                for msg in parked {
                    self.surface_undecryptable(&msg, e.clone());
                }
                Err(e.into())
            }
        }
    }

    pub(crate) async fn persist_outbox(&self) {
        let Some(vault) = self.shared.vault.as_ref() else {
            return;
        };
        let _serial = self.shared.persist.lock().await;
        let snapshot = self.shared.state.lock().outbox.snapshot();
        if let Err(e) = vault.set_item(OUTBOX_KEY, &snapshot).await {
            tracing::warn!(error = %e, queued = snapshot.len(), "outbox not persisted");
        }
    }

    /// Reload the persisted outbound queue. Entries already known are skipped.
    pub async fn restore_outbox(&self) -> Result<usize, TransportError> {
        let Some(vault) = self.shared.vault.as_ref() else {
            return Ok(0);
        };
        let entries: Vec<QueuedMessage> = vault.get_item(OUTBOX_KEY).await?.unwrap_or_default();
        let restored = entries.len();
        let mut st = self.shared.state.lock();
        for msg in &entries {
            st.messages
                .entry(msg.local_id.clone())
                .or_insert_with(|| sending_envelope(&self.shared.user_id, msg));
        }
        st.outbox.restore(entries);
        tracing::debug!(restored, "outbox restored");
        Ok(restored)
    }

    // ── Acks, typing, reactions ──────────────────────────────────────────────

    /// Mark a received message read. Returns false if it already was.
    pub fn mark_as_read(&self, message_id: &str) -> Result<bool, TransportError> {
        let (id, chat_id) = {
            let mut st = self.shared.state.lock();
            let env = st
                .envelope_mut(message_id)
                .ok_or_else(|| TransportError::UnknownMessage(message_id.to_string()))?;
            if env.sender_id == self.shared.user_id || !env.apply_status(MessageStatus::Read) {
                return Ok(false);
            }
            let (id, chat_id) = (env.id.clone(), env.chat_id.clone());
            st.send_control(ClientEvent::MessageRead {
                message_id: id.clone(),
                chat_id: chat_id.clone(),
            });
            (id, chat_id)
        };
        tracing::debug!(message_id = %id, %chat_id, "marked read");
        self.emit(TransportEvent::StatusChanged {
            message_id: id,
            status: MessageStatus::Read,
        });
        Ok(true)
    }

    pub fn start_typing(&self, chat_id: &str) {
        self.shared
            .state
            .lock()
            .send_advisory(ClientEvent::Typing {
                chat_id: chat_id.to_string(),
            });
    }

    pub fn stop_typing(&self, chat_id: &str) {
        self.shared
            .state
            .lock()
            .send_advisory(ClientEvent::StoppedTyping {
                chat_id: chat_id.to_string(),
            });
    }

    pub fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<bool, TransportError> {
        self.update_reaction(message_id, emoji, true)
    }

    pub fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<bool, TransportError> {
        self.update_reaction(message_id, emoji, false)
    }

    fn update_reaction(&self, message_id: &str, emoji: &str, add: bool) -> Result<bool, TransportError> {
        let mut st = self.shared.state.lock();
        let env = st
            .envelope_mut(message_id)
            .ok_or_else(|| TransportError::UnknownMessage(message_id.to_string()))?;
        if env.is_deleted {
            return Err(TransportError::MessageDeleted(env.id.clone()));
        }
        if env.status == MessageStatus::Sending {
            return Err(TransportError::NotYetSent(env.id.clone()));
        }
        let changed = if add {
            env.reactions.add(&self.shared.user_id, emoji)
        } else {
            env.reactions.remove(&self.shared.user_id, emoji)
        };
        if changed {
            let message_id = env.id.clone();
            let emoji = emoji.to_string();
            st.send_control(if add {
                ClientEvent::AddReaction { message_id, emoji }
            } else {
                ClientEvent::RemoveReaction { message_id, emoji }
            });
        }
        Ok(changed)
    }

    // ── Edit / delete ────────────────────────────────────────────────────────

    /// Re-encrypt new content for an own message, with a fresh IV.
    pub fn edit_message(&self, message_id: &str, plaintext: &[u8]) -> Result<(), TransportError> {
        let (id, peer_id) = {
            let mut st = self.shared.state.lock();
            let env = st
                .envelope_mut(message_id)
                .ok_or_else(|| TransportError::UnknownMessage(message_id.to_string()))?;
            env.ensure_sender(&self.shared.user_id)?;
            if env.is_deleted {
                return Err(TransportError::MessageDeleted(env.id.clone()));
            }
            if env.status == MessageStatus::Sending {
                return Err(TransportError::NotYetSent(env.id.clone()));
            }
            (env.id.clone(), env.recipient_id.clone())
        };

        let padded = Zeroizing::new(codec::pad_to_bucket(plaintext, self.shared.config.padding));
        let blob = self.shared.keys.lock().encrypt_for(&peer_id, &padded)?;
        self.commit_edit(id, blob.ciphertext_b64(), blob.iv_b64())
    }

    /// Apply a locally sealed edit and queue it for the relay. A delete may
    /// have landed while the state lock was released.
    fn commit_edit(&self, id: String, ciphertext: String, iv: String) -> Result<(), TransportError> {
        let mut st = self.shared.state.lock();
        let applied = st
            .messages
            .get_mut(&id)
            .is_some_and(|env| env.apply_edit(ciphertext.clone(), iv.clone(), Utc::now()));
        if !applied {
            return Err(TransportError::MessageDeleted(id));
        }
        st.send_control(ClientEvent::EditMessage {
            message_id: id,
            ciphertext,
            iv,
        });
        Ok(())
    }

    /// Tombstone an own message. A send still waiting in the queue is
    /// withdrawn instead of being transmitted. Returns false if the message
    /// was already deleted.
    pub async fn delete_message(&self, message_id: &str) -> Result<bool, TransportError> {
        let (id, chat_id, withdrawn) = {
            let mut st = self.shared.state.lock();
            let env = st
                .envelope_mut(message_id)
                .ok_or_else(|| TransportError::UnknownMessage(message_id.to_string()))?;
            env.ensure_sender(&self.shared.user_id)?;
            if env.is_deleted {
                return Ok(false);
            }
            let (id, chat_id) = (env.id.clone(), env.chat_id.clone());
            let unsent = env.status == MessageStatus::Sending;
            if unsent && !st.outbox.withdraw_pending(&id) {
                // Already written to the relay; delete once it is acknowledged.
                return Err(TransportError::NotYetSent(id));
            }
            if let Some(env) = st.messages.get_mut(&id) {
                env.tombstone(Utc::now());
            }
            if !unsent {
                st.send_control(ClientEvent::DeleteMessage {
                    message_id: id.clone(),
                });
            }
            (id, chat_id, unsent)
        };
        self.emit(TransportEvent::MessageDeleted {
            message_id: id,
            chat_id,
        });
        if withdrawn {
            self.persist_outbox().await;
        }
        Ok(true)
    }

    // ── Chats, presence, inspection ──────────────────────────────────────────

    /// Join a chat room; remembered and re-joined on every connect.
    pub fn join_chat(&self, chat_id: &str) {
        let mut st = self.shared.state.lock();
        if st.joined.insert(chat_id.to_string()) {
            st.send_advisory(ClientEvent::JoinChat {
                chat_id: chat_id.to_string(),
            });
        }
    }

    pub fn leave_chat(&self, chat_id: &str) {
        let mut st = self.shared.state.lock();
        if st.joined.remove(chat_id) {
            st.send_advisory(ClientEvent::LeaveChat {
                chat_id: chat_id.to_string(),
            });
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.shared.state.lock().online.contains(user_id)
    }

    pub fn typing_users(&self, chat_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .shared
            .state
            .lock()
            .typing
            .keys()
            .filter(|(chat, _)| chat == chat_id)
            .map(|(_, user)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Envelope by relay id or by the local id returned from `send_message`.
    pub fn message(&self, id: &str) -> Option<MessageEnvelope> {
        let st = self.shared.state.lock();
        st.messages.get(&st.resolve(id)).cloned()
    }

    /// Envelopes of one chat, oldest first.
    pub fn chat_messages(&self, chat_id: &str) -> Vec<MessageEnvelope> {
        let mut out: Vec<MessageEnvelope> = self
            .shared
            .state
            .lock()
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Seed envelopes from a history cache. Known ids are left alone.
    pub fn import_history(&self, envelopes: Vec<MessageEnvelope>) -> usize {
        let mut st = self.shared.state.lock();
        let mut imported = 0;
        for env in envelopes {
            if let std::collections::hash_map::Entry::Vacant(slot) = st.messages.entry(env.id.clone()) {
                slot.insert(env);
                imported += 1;
            }
        }
        imported
    }

    /// Messages not yet acknowledged by the relay.
    pub fn queued(&self) -> Vec<QueuedMessage> {
        self.shared.state.lock().outbox.snapshot()
    }
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("user_id", &self.shared.user_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use hl_crypto::CryptoBackend;
    use hl_relay::{Relay, SessionRegistry};

    use super::*;

    #[test]
    fn edit_of_a_message_deleted_mid_edit_is_not_sent() {
        let keys = Arc::new(Mutex::new(KeyManager::new(CryptoBackend::system())));
        let connector: Arc<dyn Connector> = Arc::new(Relay::new(Arc::new(SessionRegistry::new())));
        let (alice, _events) = SessionTransport::builder("alice", keys, connector).build();

        let queued = QueuedMessage {
            local_id: "m1".into(),
            chat_id: "c1".into(),
            recipient_id: "bob".into(),
            ciphertext: "old".into(),
            iv: "old-iv".into(),
            message_type: MessageType::Text,
            created_at: Utc::now(),
            attempts: 0,
        };
        let mut env = sending_envelope("alice", &queued);
        env.status = MessageStatus::Sent;
        env.tombstone(Utc::now());
        alice.shared.state.lock().messages.insert("m1".into(), env);

        let err = alice
            .commit_edit("m1".into(), "new".into(), "new-iv".into())
            .unwrap_err();
        assert!(matches!(err, TransportError::MessageDeleted(ref id) if id == "m1"));

        let st = alice.shared.state.lock();
        assert!(st.control.is_empty());
        assert!(!st.messages["m1"].is_edited);
    }
}
