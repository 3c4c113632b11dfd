//! Channel and session registry shared by every connection task.
//!
//! The set of channels is fixed when the registry is built, so the outer map
//! is never mutated and needs no lock. Each channel guards its own member
//! table and history with an independent mutex; joins, renames and removals
//! on different channels never contend.
//!
//! Lock order is always session membership first, channel second. Fan-out
//! holds only the channel lock and releases it before evicting anyone.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, warn};

use crate::protocol::Broadcast;

pub type SessionId = u64;

/// Where a session currently sits: both halves are set together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub channel: String,
    pub username: String,
}

/// A chat line retained in a channel's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub username: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("channel does not exist")]
    ChannelNotFound,
    #[error("username is already taken in this channel")]
    UsernameTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RenameError {
    #[error("session has not joined a channel")]
    NotJoined,
    #[error("username is already taken in this channel")]
    UsernameTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    Full,
    #[error("session is gone")]
    Closed,
}

/// A line waiting for the session's writer.
///
/// It holds a slot in the budget it was charged to until the writer takes it
/// off the queue.
#[derive(Debug)]
pub struct Outbound {
    line: String,
    _slot: OwnedSemaphorePermit,
}

impl Outbound {
    pub fn into_line(self) -> String {
        self.line
    }
}

pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Server-side handle for one connected client.
///
/// Cloning is cheap; every clone refers to the same session. The membership
/// slot is only ever touched by [`Registry`].
///
/// Replies and broadcasts share one FIFO so the client sees them in the order
/// they were produced, but each draws on its own budget. Only a broadcast
/// backlog marks a session as a slow consumer.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    broadcast_slots: Arc<Semaphore>,
    reply_slots: Arc<Semaphore>,
    evicted: Notify,
    membership: Mutex<Option<Membership>>,
}

impl SessionHandle {
    /// Creates a session allowing `capacity` queued lines per budget.
    pub fn new(id: SessionId, capacity: usize) -> (Self, OutboundReceiver) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            inner: Arc::new(SessionInner {
                id,
                outbound,
                broadcast_slots: Arc::new(Semaphore::new(capacity)),
                reply_slots: Arc::new(Semaphore::new(capacity)),
                evicted: Notify::new(),
                membership: Mutex::new(None),
            }),
        };
        (handle, receiver)
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Queues a broadcast without waiting; a full broadcast budget counts as a
    /// failure.
    pub fn deliver(&self, line: &str) -> Result<(), DeliveryError> {
        if self.inner.outbound.is_closed() {
            return Err(DeliveryError::Closed);
        }
        let slot = Arc::clone(&self.inner.broadcast_slots)
            .try_acquire_owned()
            .map_err(|_| DeliveryError::Full)?;
        self.push(line.to_string(), slot)
    }

    /// Queues a direct reply, waiting for room in the reply budget.
    pub async fn send(&self, line: String) -> Result<(), DeliveryError> {
        let slot = Arc::clone(&self.inner.reply_slots)
            .acquire_owned()
            .await
            .map_err(|_| DeliveryError::Closed)?;
        self.push(line, slot)
    }

    fn push(&self, line: String, slot: OwnedSemaphorePermit) -> Result<(), DeliveryError> {
        self.inner
            .outbound
            .send(Outbound { line, _slot: slot })
            .map_err(|_| DeliveryError::Closed)
    }

    /// Completes once the registry has dropped this session.
    pub async fn evicted(&self) {
        self.inner.evicted.notified().await;
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .finish()
    }
}

#[derive(Default)]
struct Channel {
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    members: HashMap<String, SessionHandle>,
    history: Vec<ChatMessage>,
}

impl ChannelState {
    fn remove_if_held(&mut self, username: &str, id: SessionId) -> bool {
        match self.members.get(username) {
            Some(holder) if holder.id() == id => {
                self.members.remove(username);
                true
            }
            _ => false,
        }
    }

    /// Delivers to every member except `exclude`, returning the ones that failed.
    fn fan_out(&self, line: &str, exclude: Option<SessionId>) -> Vec<Failed> {
        let mut failed = Vec::new();
        for (username, session) in &self.members {
            if Some(session.id()) == exclude {
                continue;
            }
            if let Err(err) = session.deliver(line) {
                warn!(%username, session = session.id(), error = %err, "dropping recipient");
                failed.push((session.clone(), err));
            }
        }
        failed
    }
}

type Failed = (SessionHandle, DeliveryError);

pub struct Registry {
    channels: BTreeMap<String, Channel>,
}

impl Registry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = names
            .into_iter()
            .map(|name| (name.into(), Channel::default()))
            .collect();
        Self { channels }
    }

    /// Channel names in sorted order.
    pub fn channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Sorted usernames in `channel`; empty for unknown or idle channels.
    pub async fn users(&self, channel: &str) -> Vec<String> {
        let Some(channel) = self.channels.get(channel) else {
            return Vec::new();
        };
        let state = channel.state.lock().await;
        let mut users: Vec<String> = state.members.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn membership(&self, session: &SessionHandle) -> Option<Membership> {
        session.inner.membership.lock().await.clone()
    }

    /// Places `session` in `channel` under `username`.
    ///
    /// On success any previous membership is released and returned when it
    /// differs from the new one. Rejoining with the same pair is a no-op.
    pub async fn try_join(
        &self,
        channel: &str,
        username: &str,
        session: &SessionHandle,
    ) -> Result<Option<Membership>, JoinError> {
        let target = self
            .channels
            .get(channel)
            .ok_or(JoinError::ChannelNotFound)?;

        let mut membership = session.inner.membership.lock().await;
        {
            let mut state = target.state.lock().await;
            if let Some(holder) = state.members.get(username)
                && holder.id() != session.id()
            {
                return Err(JoinError::UsernameTaken);
            }
            state
                .members
                .insert(username.to_string(), session.clone());
        }

        let joined = Membership {
            channel: channel.to_string(),
            username: username.to_string(),
        };
        let previous = membership.replace(joined.clone());

        match previous {
            Some(previous) if previous != joined => {
                if let Some(old) = self.channels.get(&previous.channel) {
                    old.state
                        .lock()
                        .await
                        .remove_if_held(&previous.username, session.id());
                }
                Ok(Some(previous))
            }
            _ => Ok(None),
        }
    }

    /// Changes the username of a joined session, returning the old name.
    pub async fn rename(
        &self,
        session: &SessionHandle,
        username: &str,
    ) -> Result<String, RenameError> {
        let mut membership = session.inner.membership.lock().await;
        let current = membership.as_mut().ok_or(RenameError::NotJoined)?;
        if current.username == username {
            return Ok(current.username.clone());
        }

        let channel = self
            .channels
            .get(&current.channel)
            .ok_or(RenameError::NotJoined)?;
        let mut state = channel.state.lock().await;
        if state.members.contains_key(username) {
            return Err(RenameError::UsernameTaken);
        }
        state.remove_if_held(&current.username, session.id());
        state
            .members
            .insert(username.to_string(), session.clone());

        Ok(std::mem::replace(
            &mut current.username,
            username.to_string(),
        ))
    }

    /// Drops the session from its channel. Safe to call any number of times.
    pub async fn remove(&self, session: &SessionHandle) -> Option<Membership> {
        let mut membership = session.inner.membership.lock().await;
        let previous = membership.take()?;
        if let Some(channel) = self.channels.get(&previous.channel) {
            channel
                .state
                .lock()
                .await
                .remove_if_held(&previous.username, session.id());
        }
        Some(previous)
    }

    pub async fn append_history(&self, channel: &str, message: ChatMessage) {
        if let Some(channel) = self.channels.get(channel) {
            channel.state.lock().await.history.push(message);
        }
    }

    pub async fn history(&self, channel: &str) -> Vec<ChatMessage> {
        match self.channels.get(channel) {
            Some(channel) => channel.state.lock().await.history.clone(),
            None => Vec::new(),
        }
    }

    /// Sends `line` to everyone in `channel` except `exclude`.
    ///
    /// Recipients whose queue is full or closed are evicted; the rest still
    /// receive the line. Returns the number of successful deliveries.
    pub async fn broadcast(&self, channel: &str, line: &str, exclude: Option<SessionId>) -> usize {
        let Some(target) = self.channels.get(channel) else {
            return 0;
        };
        let (attempted, failed) = {
            let state = target.state.lock().await;
            let attempted = state
                .members
                .values()
                .filter(|session| Some(session.id()) != exclude)
                .count();
            (attempted, state.fan_out(line, exclude))
        };
        let delivered = attempted - failed.len();
        self.evict_all(failed).await;
        delivered
    }

    /// Records a chat message and relays it in one step, so history order and
    /// delivery order agree.
    pub async fn relay(&self, channel: &str, message: ChatMessage, exclude: Option<SessionId>) {
        let Some(target) = self.channels.get(channel) else {
            return;
        };
        let line = Broadcast::Receive {
            username: message.username.clone(),
            text: message.text.clone(),
        }
        .to_string();
        let failed = {
            let mut state = target.state.lock().await;
            state.history.push(message);
            state.fan_out(&line, exclude)
        };
        self.evict_all(failed).await;
    }

    /// Drops every failed recipient and wakes its handler.
    ///
    /// A slow consumer leaves silently. A session whose writer is already gone
    /// is announced with `LEFT`, and anyone that announcement fails to reach is
    /// dropped in turn.
    async fn evict_all(&self, mut pending: Vec<Failed>) {
        while let Some((session, reason)) = pending.pop() {
            let removed = self.remove(&session).await;
            session.inner.evicted.notify_one();
            let Some(membership) = removed else {
                continue;
            };
            debug!(
                session = session.id(),
                channel = %membership.channel,
                username = %membership.username,
                %reason,
                "evicted session"
            );
            if reason != DeliveryError::Closed {
                continue;
            }
            let Some(channel) = self.channels.get(&membership.channel) else {
                continue;
            };
            let left = Broadcast::Left {
                username: membership.username,
            }
            .to_string();
            let failed = channel.state.lock().await.fan_out(&left, Some(session.id()));
            pending.extend(failed);
        }
    }
}
