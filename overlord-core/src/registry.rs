//! Agent registry (`SPEC_FULL.md`, `[AGENT-REGISTRY]`; spec.md §4.2, §3).
//!
//! Authoritative mapping from `machine_id` to the live Control RPC handle
//! plus the agent's declared properties. Backed by `DashMap` for the
//! "many readers, few writers" access pattern spec.md §5 calls for.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use overlord_proto::mode::Properties;
use serde::Serialize;

use crate::rpc::RpcFramer;

/// A live, registered Control-mode agent.
pub struct Agent {
    pub mid: String,
    pub sid: String,
    pub properties: dashmap::DashMap<String, overlord_proto::mode::PropertyValue>,
    pub last_seen_unix: std::sync::atomic::AtomicU64,
    pub rpc: Arc<RpcFramer>,
}

impl Agent {
    pub fn new(mid: String, sid: String, properties: Properties, rpc: Arc<RpcFramer>) -> Self {
        let map = DashMap::new();
        for (k, v) in properties {
            map.insert(k, v);
        }
        Self {
            mid,
            sid,
            properties: map,
            last_seen_unix: std::sync::atomic::AtomicU64::new(now_unix()),
            rpc,
        }
    }

    pub fn touch(&self) {
        self.last_seen_unix
            .store(now_unix(), std::sync::atomic::Ordering::Relaxed);
    }

    pub fn merge_properties(&self, updates: Properties) {
        for (k, v) in updates {
            self.properties.insert(k, v);
        }
    }

    /// Snapshot of this agent suitable for HTTP/event-bus payloads.
    pub fn public_view(&self) -> AgentView {
        let properties: std::collections::HashMap<_, _> = self
            .properties
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        AgentView {
            mid: self.mid.clone(),
            sid: self.sid.clone(),
            properties,
            last_seen_unix: self.last_seen_unix.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct AgentView {
    pub mid: String,
    pub sid: String,
    pub properties: std::collections::HashMap<String, overlord_proto::mode::PropertyValue>,
    pub last_seen_unix: u64,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Registry of live Control agents, keyed by `machine_id`.
///
/// Invariant (spec.md §8, "Unique live mid"): at most one entry per `mid`
/// at any instant. Re-registration under the same `mid` must close the
/// prior control connection first — see `AgentRegistry::insert`.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly-registered Control agent, returning the prior entry
    /// (if any) so the caller can gracefully close its connection first
    /// per spec.md §4.2 rule 2 / §4.9 "Registry collision on mid".
    pub fn insert(&self, agent: Arc<Agent>) -> Option<Arc<Agent>> {
        self.agents.insert(agent.mid.clone(), agent)
    }

    pub fn remove(&self, mid: &str) -> Option<Arc<Agent>> {
        self.agents.remove(mid).map(|(_, a)| a)
    }

    pub fn get(&self, mid: &str) -> Option<Arc<Agent>> {
        self.agents.get(mid).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, mid: &str) -> bool {
        self.agents.contains_key(mid)
    }

    pub fn list(&self) -> Vec<AgentView> {
        self.agents.iter().map(|e| e.value().public_view()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use tokio::io::duplex;

    fn dummy_rpc() -> Arc<RpcFramer> {
        let (client, _server) = duplex(4096);
        let (framer, _reqs) = RpcFramer::spawn(client, &CoreConfig::default());
        framer
    }

    #[test]
    fn insert_returns_prior_entry_on_mid_collision() {
        let registry = AgentRegistry::new();
        let a1 = Arc::new(Agent::new("m1".into(), "host1".into(), Properties::new(), dummy_rpc()));
        let a2 = Arc::new(Agent::new("m1".into(), "host2".into(), Properties::new(), dummy_rpc()));

        assert!(registry.insert(a1).is_none());
        let prior = registry.insert(a2);
        assert!(prior.is_some());
        assert_eq!(prior.unwrap().sid, "host1");
        assert_eq!(registry.get("m1").unwrap().sid, "host2");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn merge_properties_is_additive() {
        let agent = Agent::new("m1".into(), "h".into(), Properties::new(), dummy_rpc());
        let mut updates = Properties::new();
        updates.insert(
            "ip".into(),
            overlord_proto::mode::PropertyValue::Single("10.0.0.1".into()),
        );
        agent.merge_properties(updates);
        assert_eq!(agent.properties.len(), 1);
    }
}
