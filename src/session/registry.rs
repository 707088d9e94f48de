//! Concurrent session registry.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{Session, SessionKey, SessionState};
use crate::error::{QueryError, Result, RoutingError};
use crate::protocol::{CapabilityDescriptor, SessionId};

/// Registry of live sessions.
///
/// Backed by a sharded map: operations on different sessions never contend
/// on a global lock. A record is present only while its session is
/// negotiating or active.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session in `Negotiating`.
    ///
    /// Fails with `DuplicateSession` if `id` is already active; a record
    /// still negotiating under the same id is replaced.
    pub fn create(
        &self,
        id: SessionId,
        key: SessionKey,
        offered: CapabilityDescriptor,
    ) -> Result<Session> {
        let session = Session::new(id, key, offered);
        match self.sessions.entry(id) {
            Entry::Occupied(mut entry) => {
                if entry.get().state == SessionState::Active {
                    return Err(QueryError::DuplicateSession(id));
                }
                debug!(session = %id, "Replacing stale negotiating session");
                entry.insert(session.clone());
            },
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            },
        }
        Ok(session)
    }

    /// Record the client's offer on a negotiating session. Returns false if
    /// the session is gone or no longer negotiating.
    pub fn record_offer(&self, id: SessionId, offered: CapabilityDescriptor) -> bool {
        match self.sessions.get_mut(&id) {
            Some(mut session) if session.state == SessionState::Negotiating => {
                session.negotiated_capability = offered;
                session.touch();
                true
            },
            _ => false,
        }
    }

    /// Move a negotiating session to `Active` with its negotiated descriptor.
    pub fn activate(&self, id: SessionId, negotiated: CapabilityDescriptor) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(RoutingError::UnknownSession(id))?;
        if session.state != SessionState::Negotiating {
            return Err(QueryError::InvalidState(format!(
                "session {id} is {}, expected negotiating",
                session.state
            )));
        }
        session.negotiated_capability = negotiated;
        session.state = SessionState::Active;
        session.touch();
        Ok(())
    }

    /// Refresh the activity timestamp. Returns false if absent.
    pub fn touch(&self, id: SessionId) -> bool {
        match self.sessions.get_mut(&id) {
            Some(mut session) => {
                session.touch();
                true
            },
            None => false,
        }
    }

    /// Remove every session idle longer than `timeout_secs` as of `now`.
    ///
    /// All sessions are judged against the same `now`. Removed ids are
    /// returned so the caller can close their channels.
    pub fn sweep(&self, now: Instant, timeout_secs: u32) -> Vec<SessionId> {
        let timeout = Duration::from_secs(u64::from(timeout_secs));
        let mut expired = Vec::new();

        self.sessions.retain(|id, session| {
            if session.is_expired(now, timeout) {
                session.state = SessionState::TimedOut;
                expired.push(*id);
                false
            } else {
                true
            }
        });

        expired
    }

    /// Remove a session. Removing an absent session is not an error.
    pub fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id).map(|(_, mut session)| {
            session.state = SessionState::Removed;
            session
        })
    }

    /// Remove a session, recording the state it ended in.
    pub fn finish(&self, id: SessionId, state: SessionState) -> Option<Session> {
        self.sessions.remove(&id).map(|(_, mut session)| {
            session.state = state;
            session
        })
    }

    /// Snapshot of one session.
    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Whether `id` is registered and active.
    pub fn is_active(&self, id: SessionId) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|s| s.state == SessionState::Active)
    }

    /// Get current session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registered ids.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshots of all sessions.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Account for an inbound frame and decide whether to keep it.
    ///
    /// On datagram sessions a frame whose ordinal does not exceed the last
    /// accepted one is stale and yields `Ok(false)`.
    pub fn accept_inbound(&self, id: SessionId, ordinal: u64, bytes: usize) -> Result<bool> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(RoutingError::UnknownSession(id))?;
        if session.state != SessionState::Active {
            return Err(QueryError::SessionNotActive);
        }

        let fresh = session.inbound.admit(ordinal);
        if !fresh && session.key.is_datagram() {
            session.stats.stale_dropped += 1;
            return Ok(false);
        }

        session.stats.frames_in += 1;
        session.stats.bytes_in += bytes as u64;
        session.touch();
        Ok(true)
    }

    /// Count a routed frame dropped on a full session queue.
    pub fn record_queue_drop(&self, id: SessionId) -> bool {
        match self.sessions.get_mut(&id) {
            Some(mut session) => {
                session.stats.queue_dropped += 1;
                true
            },
            None => false,
        }
    }

    /// Stamp the next outbound ordinal for an active session.
    pub fn next_outbound(&self, id: SessionId, bytes: usize) -> Result<u64> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(RoutingError::UnknownSession(id))?;
        if session.state != SessionState::Active {
            return Err(QueryError::SessionNotActive);
        }

        let ordinal = session.next_outbound;
        session.next_outbound += 1;
        session.stats.frames_out += 1;
        session.stats.bytes_out += bytes as u64;
        Ok(ordinal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn caps() -> CapabilityDescriptor {
        "other/tensors,num_tensors=1,dimensions=3:300:300:1,types=uint8"
            .parse()
            .unwrap()
    }

    fn stream_key(port: u16) -> SessionKey {
        SessionKey::Stream {
            local: SocketAddr::from(([127, 0, 0, 1], 3001)),
            peer: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    fn datagram_key(nonce: u32) -> SessionKey {
        SessionKey::Datagram {
            local_port: 3001,
            peer: SocketAddr::from(([127, 0, 0, 1], 40000)),
            nonce,
        }
    }

    fn active(registry: &SessionRegistry, key: SessionKey) -> SessionId {
        let id = key.session_id();
        registry.create(id, key, caps()).unwrap();
        registry.activate(id, caps()).unwrap();
        id
    }

    #[test]
    fn test_create_and_activate() {
        let registry = SessionRegistry::new();
        let key = stream_key(50000);
        let id = key.session_id();

        let session = registry.create(id, key, caps()).unwrap();
        assert_eq!(session.state, SessionState::Negotiating);
        assert!(!registry.is_active(id));

        registry.activate(id, caps()).unwrap();
        assert!(registry.is_active(id));
        assert!(registry.activate(id, caps()).is_err());
    }

    #[test]
    fn test_duplicate_active_rejected() {
        let registry = SessionRegistry::new();
        let key = stream_key(50000);
        let id = active(&registry, key);

        let err = registry.create(id, key, caps()).unwrap_err();
        assert!(matches!(err, QueryError::DuplicateSession(dup) if dup == id));
    }

    #[test]
    fn test_stale_negotiating_replaced() {
        let registry = SessionRegistry::new();
        let key = stream_key(50000);
        let id = key.session_id();
        registry.create(id, key, caps()).unwrap();
        assert!(registry.create(id, key, caps()).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = active(&registry, stream_key(50000));

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.state, SessionState::Removed);
        assert!(registry.remove(id).is_none());
        assert!(!registry.contains(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_idle() {
        let registry = SessionRegistry::new();
        let idle = active(&registry, stream_key(50000));
        std::thread::sleep(Duration::from_millis(20));
        let fresh = active(&registry, stream_key(50001));

        let created = registry.get(fresh).unwrap().last_activity;
        let now = registry.get(idle).unwrap().last_activity + Duration::from_secs(1) + Duration::from_millis(10);
        assert!(now > created);

        // fresh was created 20ms after idle, so it is within one second at `now`
        let expired = registry.sweep(now, 1);
        assert_eq!(expired, vec![idle]);
        assert!(!registry.contains(idle));
        assert!(registry.contains(fresh));
    }

    #[test]
    fn test_sweep_with_current_time_keeps_touched() {
        let registry = SessionRegistry::new();
        let id = active(&registry, stream_key(50000));
        assert!(registry.touch(id));
        assert!(registry.sweep(Instant::now(), 10).is_empty());
        assert!(!registry.touch(SessionId::new(12345)));
    }

    #[test]
    fn test_datagram_ordinals() {
        let registry = SessionRegistry::new();
        let id = active(&registry, datagram_key(7));

        let kept: Vec<u64> = [1, 3, 2]
            .into_iter()
            .filter(|o| registry.accept_inbound(id, *o, 10).unwrap())
            .collect();
        assert_eq!(kept, vec![1, 3]);

        let session = registry.get(id).unwrap();
        assert_eq!(session.stats.frames_in, 2);
        assert_eq!(session.stats.stale_dropped, 1);
        assert_eq!(session.last_inbound_ordinal(), Some(3));
    }

    #[test]
    fn test_stream_ordinals_not_filtered() {
        let registry = SessionRegistry::new();
        let id = active(&registry, stream_key(50000));
        assert!(registry.accept_inbound(id, 5, 1).unwrap());
        assert!(registry.accept_inbound(id, 5, 1).unwrap());
    }

    #[test]
    fn test_outbound_ordinals_increase() {
        let registry = SessionRegistry::new();
        let id = active(&registry, stream_key(50000));

        assert_eq!(registry.next_outbound(id, 4).unwrap(), 1);
        assert_eq!(registry.next_outbound(id, 4).unwrap(), 2);
        assert_eq!(registry.get(id).unwrap().stats.bytes_out, 8);

        let err = registry.next_outbound(SessionId::new(1), 4).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Routing(RoutingError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_offer_recorded_only_while_negotiating() {
        let registry = SessionRegistry::new();
        let key = stream_key(50010);
        let id = key.session_id();
        let placeholder: CapabilityDescriptor =
            "other/tensors,num_tensors=1,dimensions=4,types=uint8".parse().unwrap();
        registry.create(id, key, placeholder).unwrap();

        assert!(registry.record_offer(id, caps()));
        assert_eq!(registry.get(id).unwrap().negotiated_capability, caps());
        registry.activate(id, caps()).unwrap();
        assert!(!registry.record_offer(id, caps()));
        assert!(!registry.record_offer(SessionId::new(1), caps()));
    }

    #[test]
    fn test_queue_drops_counted() {
        let registry = SessionRegistry::new();
        let id = active(&registry, stream_key(50011));

        assert!(registry.record_queue_drop(id));
        assert!(registry.record_queue_drop(id));
        assert_eq!(registry.get(id).unwrap().stats.queue_dropped, 2);
        assert!(!registry.record_queue_drop(SessionId::new(1)));
    }

    #[test]
    fn test_concurrent_access() {
        let registry = std::sync::Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let id = active(&registry, stream_key(50000 + i));
                    for _ in 0..100 {
                        registry.next_outbound(id, 1).unwrap();
                        registry.touch(id);
                    }
                    id
                })
            })
            .collect();

        for handle in handles {
            let id = handle.join().unwrap();
            assert_eq!(registry.get(id).unwrap().next_outbound_ordinal(), 101);
        }
        assert_eq!(registry.len(), 8);
    }
}
