//! Registry of live client sessions and their in-flight deliveries.

use crate::error::{PipeError, Result};
use crate::frame::Frame;
use crate::message::MessageId;
use crate::observability::events;
use crate::session::{ClientSession, ConnectionState, Role, SessionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SESSION_REGISTRY_TAG: &str = "SessionRegistry:";
const SESSION_REGISTRY_FN_REGISTER_TAG: &str = "register():";
const SESSION_REGISTRY_FN_UNREGISTER_TAG: &str = "unregister():";
const SESSION_REGISTRY_FN_DELIVER_TAG: &str = "deliver():";

/// Why a frame could not be handed to a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliverError {
    NotRegistered,
    NotOpen,
    QueueFull,
    QueueClosed,
}

impl Display for DeliverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            DeliverError::NotRegistered => "session not registered",
            DeliverError::NotOpen => "session not open",
            DeliverError::QueueFull => "outbound queue full",
            DeliverError::QueueClosed => "outbound queue closed",
        };
        f.write_str(reason)
    }
}

impl<T> From<TrySendError<T>> for DeliverError {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => DeliverError::QueueFull,
            TrySendError::Closed(_) => DeliverError::QueueClosed,
        }
    }
}

struct SessionEntry {
    session: ClientSession,
    registered_seq: u64,
    outbound: Sender<Frame>,
    in_flight: HashSet<MessageId>,
    close: CancellationToken,
}

/// Sessions keyed by id. Each entry is guarded by its own shard lock, so work on
/// distinct sessions does not contend while work on one session is serialized.
pub(crate) struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    next_seq: AtomicU64,
    idle: Notify,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_seq: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }

    pub(crate) fn register(
        &self,
        mut session: ClientSession,
        outbound: Sender<Frame>,
        close: CancellationToken,
    ) -> Result<()> {
        match self.sessions.entry(session.session_id.clone()) {
            Entry::Occupied(_) => {
                warn!(
                    event = events::SESSION_REJECTED,
                    session_id = %session.session_id,
                    "{SESSION_REGISTRY_TAG}:{SESSION_REGISTRY_FN_REGISTER_TAG} duplicate session"
                );
                Err(PipeError::DuplicateSession {
                    session_id: session.session_id,
                })
            }
            Entry::Vacant(vacant) => {
                session.connection_state = ConnectionState::Open;
                session.last_activity = Instant::now();
                info!(
                    event = events::SESSION_OPEN,
                    session_id = %session.session_id,
                    role = %session.role,
                    pipe_address = %session.pipe_address,
                    "{SESSION_REGISTRY_TAG}:{SESSION_REGISTRY_FN_REGISTER_TAG} session registered"
                );
                vacant.insert(SessionEntry {
                    session,
                    registered_seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    outbound,
                    in_flight: HashSet::new(),
                    close,
                });
                Ok(())
            }
        }
    }

    /// Removes the session and hands back the ids of messages still targeting it.
    pub(crate) fn unregister(&self, session_id: &SessionId) -> Option<(ClientSession, Vec<MessageId>)> {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            debug!("{SESSION_REGISTRY_TAG}:{SESSION_REGISTRY_FN_UNREGISTER_TAG} {session_id} already gone");
            return None;
        };

        let mut session = entry.session;
        session.connection_state = ConnectionState::Closed;
        let in_flight: Vec<MessageId> = entry.in_flight.into_iter().collect();
        info!(
            event = events::SESSION_CLOSED,
            session_id = %session_id,
            in_flight = in_flight.len(),
            "{SESSION_REGISTRY_TAG}:{SESSION_REGISTRY_FN_UNREGISTER_TAG} session removed"
        );
        self.idle.notify_waiters();
        Some((session, in_flight))
    }

    pub(crate) fn mark_closing(&self, session_id: &SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.session.connection_state = ConnectionState::Closing;
        }
    }

    pub(crate) fn touch(&self, session_id: &SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.session.last_activity = Instant::now();
        }
    }

    pub(crate) fn get(&self, session_id: &SessionId) -> Option<ClientSession> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    /// Open sessions for `pipe_address` with `role`, oldest registration first.
    pub(crate) fn list_by_address(&self, pipe_address: &str, role: Role) -> Vec<ClientSession> {
        let mut eligible: Vec<(u64, ClientSession)> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.session.role == role
                    && entry.session.pipe_address == pipe_address
                    && entry.session.is_open()
            })
            .map(|entry| (entry.registered_seq, entry.session.clone()))
            .collect();
        eligible.sort_by_key(|(seq, _)| *seq);
        eligible.into_iter().map(|(_, session)| session).collect()
    }

    /// Queues a delivery frame on an open session and records it as in flight.
    pub(crate) fn deliver(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        frame: Frame,
    ) -> std::result::Result<(), DeliverError> {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return Err(DeliverError::NotRegistered);
        };
        if !entry.session.is_open() {
            return Err(DeliverError::NotOpen);
        }
        entry.outbound.try_send(frame).map_err(|err| {
            debug!("{SESSION_REGISTRY_TAG}:{SESSION_REGISTRY_FN_DELIVER_TAG} {session_id}: {err}");
            DeliverError::from(err)
        })?;
        entry.in_flight.insert(message_id.clone());
        Ok(())
    }

    /// Queues a control frame (receipt, failure notice) without tracking it.
    pub(crate) fn notify(&self, session_id: &SessionId, frame: Frame) -> std::result::Result<(), DeliverError> {
        let Some(entry) = self.sessions.get(session_id) else {
            return Err(DeliverError::NotRegistered);
        };
        entry.outbound.try_send(frame)?;
        Ok(())
    }

    /// Drops `message_id` from the session's in-flight set.
    pub(crate) fn release(&self, session_id: &SessionId, message_id: &MessageId) -> bool {
        let released = match self.sessions.get_mut(session_id) {
            Some(mut entry) => entry.in_flight.remove(message_id),
            None => false,
        };
        if released {
            self.idle.notify_waiters();
        }
        released
    }

    pub(crate) fn in_flight(&self, session_id: &SessionId) -> Vec<MessageId> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.in_flight.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn pending_counts(&self) -> Vec<(SessionId, usize)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.in_flight.len()))
            .collect()
    }

    pub(crate) fn pending_total(&self) -> usize {
        self.sessions.iter().map(|entry| entry.in_flight.len()).sum()
    }

    /// Future that resolves the next time a delivery is released or a session leaves.
    pub(crate) fn idle_notified(&self) -> Notified<'_> {
        self.idle.notified()
    }

    pub(crate) fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Signals the session worker to stop; it unregisters itself on the way out.
    pub(crate) fn close(&self, session_id: &SessionId) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.session.connection_state = ConnectionState::Closing;
                entry.close.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn close_all(&self) -> usize {
        let ids = self.session_ids();
        ids.iter().filter(|id| self.close(id)).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
