//! Rendezvous: pairing agent-originated connections with parked user-side
//! sockets (`SPEC_FULL.md`, `[RENDEZVOUS]`; spec.md §4.3, §3, §8).
//!
//! Invariant (spec.md §3, §8 "Rendezvous symmetry"): every live entry has
//! at most one of `{user, agent}` populated; the instant both are present
//! the entry is removed and handed to the caller as a pair to bridge.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use overlord_proto::mode::SpawnParams;
use uuid::Uuid;

use crate::bridge::ByteDuplex;

struct PendingSession {
    mid: String,
    params: SpawnParams,
    created_at: Instant,
    user: Option<Box<dyn ByteDuplex>>,
    agent: Option<Box<dyn ByteDuplex>>,
}

/// Outcome of attaching one side of a session.
pub enum Attach {
    /// The other side was already parked; here is the completed pair.
    Paired {
        user: Box<dyn ByteDuplex>,
        agent: Box<dyn ByteDuplex>,
        mid: String,
        params: SpawnParams,
    },
    /// No other side yet; this one is now parked waiting.
    Parked,
    /// No session exists under this id.
    NotFound,
    /// This side was already attached once (race already resolved).
    AlreadyAttached,
}

/// A reaped orphan: whichever side was parked, to be closed by the caller.
pub enum Orphaned {
    User(Box<dyn ByteDuplex>),
    Agent(Box<dyn ByteDuplex>),
}

/// Pending agent-originated sessions awaiting pairing, keyed by session id.
#[derive(Default)]
pub struct RendezvousMap {
    sessions: DashMap<Uuid, PendingSession>,
}

impl RendezvousMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step 1-3 of `open_session` (spec.md §4.3): mint a session id and
    /// park an empty slot for it. The caller still owns sending the
    /// `spawn` request on the agent's control RPC (step 4).
    pub fn open_session(&self, mid: String, params: SpawnParams) -> Uuid {
        let sid = Uuid::new_v4();
        self.sessions.insert(
            sid,
            PendingSession {
                mid,
                params,
                created_at: Instant::now(),
                user: None,
                agent: None,
            },
        );
        sid
    }

    pub fn attach_user_side(&self, sid: Uuid, user: Box<dyn ByteDuplex>) -> Attach {
        match self.sessions.entry(sid) {
            Entry::Vacant(_) => Attach::NotFound,
            Entry::Occupied(mut e) => {
                if e.get().user.is_some() {
                    return Attach::AlreadyAttached;
                }
                if e.get().agent.is_some() {
                    let (_, mut session) = e.remove_entry();
                    let agent = session.agent.take().expect("checked is_some above");
                    Attach::Paired {
                        user,
                        agent,
                        mid: session.mid,
                        params: session.params,
                    }
                } else {
                    e.get_mut().user = Some(user);
                    Attach::Parked
                }
            }
        }
    }

    pub fn attach_agent_side(&self, sid: Uuid, agent: Box<dyn ByteDuplex>) -> Attach {
        match self.sessions.entry(sid) {
            Entry::Vacant(_) => Attach::NotFound,
            Entry::Occupied(mut e) => {
                if e.get().agent.is_some() {
                    return Attach::AlreadyAttached;
                }
                if e.get().user.is_some() {
                    let (_, mut session) = e.remove_entry();
                    let user = session.user.take().expect("checked is_some above");
                    Attach::Paired {
                        user,
                        agent,
                        mid: session.mid,
                        params: session.params,
                    }
                } else {
                    e.get_mut().agent = Some(agent);
                    Attach::Parked
                }
            }
        }
    }

    /// Cancel a not-yet-paired session outright (spawn request failed or
    /// timed out). No-op if the session was never opened or already paired.
    pub fn cancel(&self, sid: Uuid) -> bool {
        self.sessions.remove(&sid).is_some()
    }

    /// Whether a session id is known to the map (paired or not). Used to
    /// validate a `register` arriving with an `sid` (spec.md §4.2 rule 3).
    pub fn contains(&self, sid: Uuid) -> bool {
        self.sessions.contains_key(&sid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Reap entries older than `grace` with one side still unpaired
    /// (spec.md §4.3 "Orphan collection", §8 "Orphan reap").
    pub fn reap_orphans(&self, grace: Duration) -> Vec<Orphaned> {
        let now = Instant::now();
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|e| now.duration_since(e.value().created_at) > grace)
            .map(|e| *e.key())
            .collect();

        let mut orphaned = Vec::new();
        for sid in stale {
            if let Some((_, mut session)) = self.sessions.remove(&sid) {
                if let Some(user) = session.user.take() {
                    orphaned.push(Orphaned::User(user));
                }
                if let Some(agent) = session.agent.take() {
                    orphaned.push(Orphaned::Agent(agent));
                }
            }
        }
        orphaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RawByteDuplex;
    use tokio::io::duplex;

    fn dummy_duplex() -> Box<dyn ByteDuplex> {
        let (a, _b) = duplex(64);
        Box::new(RawByteDuplex::from_stream(a))
    }

    fn logcat_params() -> SpawnParams {
        SpawnParams::Logcat
    }

    #[test]
    fn symmetry_exactly_one_side_parked() {
        let map = RendezvousMap::new();
        let sid = map.open_session("m1".into(), logcat_params());
        assert!(matches!(
            map.attach_user_side(sid, dummy_duplex()),
            Attach::Parked
        ));
        // the entry still exists, with only the user side present
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn agent_arriving_after_user_pairs_immediately() {
        let map = RendezvousMap::new();
        let sid = map.open_session("m1".into(), logcat_params());
        assert!(matches!(
            map.attach_user_side(sid, dummy_duplex()),
            Attach::Parked
        ));
        match map.attach_agent_side(sid, dummy_duplex()) {
            Attach::Paired { mid, .. } => assert_eq!(mid, "m1"),
            _ => panic!("expected pairing"),
        }
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn user_arriving_after_agent_pairs_immediately() {
        let map = RendezvousMap::new();
        let sid = map.open_session("m1".into(), logcat_params());
        assert!(matches!(
            map.attach_agent_side(sid, dummy_duplex()),
            Attach::Parked
        ));
        match map.attach_user_side(sid, dummy_duplex()) {
            Attach::Paired { mid, .. } => assert_eq!(mid, "m1"),
            _ => panic!("expected pairing"),
        }
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn unknown_session_id_is_not_found() {
        let map = RendezvousMap::new();
        assert!(matches!(
            map.attach_user_side(Uuid::new_v4(), dummy_duplex()),
            Attach::NotFound
        ));
    }

    #[test]
    fn double_attach_same_side_is_rejected() {
        let map = RendezvousMap::new();
        let sid = map.open_session("m1".into(), logcat_params());
        assert!(matches!(
            map.attach_user_side(sid, dummy_duplex()),
            Attach::Parked
        ));
        assert!(matches!(
            map.attach_user_side(sid, dummy_duplex()),
            Attach::AlreadyAttached
        ));
    }

    #[test]
    fn orphan_past_grace_period_is_reaped() {
        let map = RendezvousMap::new();
        let sid = map.open_session("m1".into(), logcat_params());
        map.attach_user_side(sid, dummy_duplex());
        std::thread::sleep(Duration::from_millis(5));
        let orphans = map.reap_orphans(Duration::from_millis(1));
        assert_eq!(orphans.len(), 1);
        assert!(matches!(orphans[0], Orphaned::User(_)));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn fresh_session_is_not_reaped() {
        let map = RendezvousMap::new();
        let sid = map.open_session("m1".into(), logcat_params());
        map.attach_user_side(sid, dummy_duplex());
        let orphans = map.reap_orphans(Duration::from_secs(60));
        assert!(orphans.is_empty());
        assert_eq!(map.len(), 1);
    }
}
