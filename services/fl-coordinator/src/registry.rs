//! Per-session client state. Everything here is plain data mutated under the
//! coordinator's single lock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use treefed_core::WeightPayload;
use treefed_proto::{EvaluationMetrics, ModelMetadata};

#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub capabilities: HashMap<String, String>,
    pub joined_at: DateTime<Utc>,
    pub joined_instant: Instant,
}

#[derive(Debug, Clone)]
pub struct StoredWeights {
    /// `None` when the client submitted a literal `null` document.
    pub payload: Option<WeightPayload>,
    pub declared_size_bytes: u64,
    pub declared_trees: u64,
    seq: u64,
}

impl StoredWeights {
    pub fn tree_count(&self) -> usize { self.payload.as_ref().map_or(0, |p| p.trees.len()) }
}

/// Result of one aggregation, shared by every quorum member of the session.
#[derive(Debug)]
pub struct RoundResult {
    pub contributors: BTreeSet<String>,
    pub round_number: u64,
    pub model: Vec<u8>,
    pub metadata: ModelMetadata,
}

#[derive(Debug, Clone)]
pub struct ClientMetricsRecord {
    pub client_id: String,
    pub session_id: String,
    pub metrics: EvaluationMetrics,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub connected_clients: usize,
    pub clients_with_weights: usize,
    pub clients_with_metrics: usize,
    pub clients_received_model: usize,
    pub expected_clients: usize,
}

pub fn new_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", Utc::now().timestamp(), &suffix[..8])
}

pub struct SessionState {
    pub session_id: String,
    pub expected_clients: usize,
    pub clients: HashMap<String, ClientRegistration>,
    pub weights: HashMap<String, StoredWeights>,
    pub metrics: HashMap<String, EvaluationMetrics>,
    pub received_model: HashSet<String>,
    pub round_result: Option<Arc<RoundResult>>,
    pub pending_reset: Option<JoinHandle<()>>,
    next_seq: u64,
}

impl SessionState {
    pub fn new(expected_clients: usize) -> Self {
        Self {
            session_id: new_session_id(),
            expected_clients,
            clients: HashMap::new(),
            weights: HashMap::new(),
            metrics: HashMap::new(),
            received_model: HashSet::new(),
            round_result: None,
            pending_reset: None,
            next_seq: 0,
        }
    }

    pub fn is_full(&self) -> bool { self.clients.len() >= self.expected_clients }

    /// Registers (or re-registers) a client; false when the session is full.
    pub fn register(&mut self, client_id: &str, capabilities: HashMap<String, String>) -> bool {
        if self.is_full() {
            return false;
        }
        self.clients.insert(
            client_id.to_string(),
            ClientRegistration { capabilities, joined_at: Utc::now(), joined_instant: Instant::now() },
        );
        true
    }

    pub fn store_weights(&mut self, client_id: &str, payload: Option<WeightPayload>, declared_size_bytes: u64, declared_trees: u64) {
        // a resubmission keeps the client's original arrival slot
        let seq = match self.weights.get(client_id) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.weights.insert(client_id.to_string(), StoredWeights { payload, declared_size_bytes, declared_trees, seq });
        // new input invalidates whatever this session aggregated before
        self.round_result = None;
    }

    /// Payloads in arrival order, as the aggregator expects them.
    pub fn ordered_payloads(&self) -> Vec<Option<&WeightPayload>> {
        let mut entries: Vec<&StoredWeights> = self.weights.values().collect();
        entries.sort_by_key(|w| w.seq);
        entries.into_iter().map(|w| w.payload.as_ref()).collect()
    }

    pub fn contributors(&self) -> BTreeSet<String> { self.weights.keys().cloned().collect() }

    pub fn missing_weights(&self) -> Vec<String> {
        let mut missing: Vec<String> = self.clients.keys().filter(|c| !self.weights.contains_key(*c)).cloned().collect();
        missing.sort();
        missing
    }

    /// Drops registrations without weights whose join is older than `idle`.
    pub fn evict_idle_without_weights(&mut self, idle: Duration, now: Instant) -> Vec<String> {
        let stale: Vec<String> = self
            .clients
            .iter()
            .filter(|(id, reg)| !self.weights.contains_key(*id) && now.saturating_duration_since(reg.joined_instant) > idle)
            .map(|(id, _)| id.clone())
            .collect();
        self.remove_clients(&stale);
        stale
    }

    pub fn remove_clients(&mut self, ids: &[String]) {
        for id in ids {
            self.clients.remove(id);
            self.weights.remove(id);
            self.metrics.remove(id);
            self.received_model.remove(id);
        }
    }

    pub fn everyone_received(&self) -> bool { self.clients.keys().all(|c| self.received_model.contains(c)) }

    /// Clears every per-client map and rotates the session id. Returns the old id.
    pub fn reset(&mut self) -> String {
        if let Some(pending) = self.pending_reset.take() {
            pending.abort();
        }
        self.clients.clear();
        self.weights.clear();
        self.metrics.clear();
        self.received_model.clear();
        self.round_result = None;
        std::mem::replace(&mut self.session_id, new_session_id())
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            connected_clients: self.clients.len(),
            clients_with_weights: self.weights.len(),
            clients_with_metrics: self.metrics.len(),
            clients_received_model: self.received_model.len(),
            expected_clients: self.expected_clients,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(trees: usize) -> WeightPayload {
        WeightPayload::decode(format!(r#"{{"trees":[{}]}}"#, vec!["{}"; trees].join(",")).as_bytes()).unwrap().unwrap()
    }

    #[test]
    fn register_respects_capacity() {
        let mut st = SessionState::new(2);
        assert!(st.register("a", HashMap::new()));
        assert!(st.register("b", HashMap::new()));
        assert!(!st.register("c", HashMap::new()));
        assert_eq!(st.clients.len(), 2);
    }

    #[test]
    fn payloads_follow_arrival_order() {
        let mut st = SessionState::new(3);
        st.store_weights("zeta", Some(payload(1)), 0, 1);
        st.store_weights("alpha", None, 0, 0);
        st.store_weights("mid", Some(payload(3)), 0, 3);
        let ordered = st.ordered_payloads();
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].map(|p| p.trees.len()), Some(1));
        assert!(ordered[1].is_none());
        assert_eq!(ordered[2].map(|p| p.trees.len()), Some(3));
    }

    #[test]
    fn resubmission_keeps_arrival_slot() {
        let mut st = SessionState::new(2);
        st.store_weights("A", Some(payload(1)), 0, 1);
        st.store_weights("B", Some(payload(2)), 0, 2);
        st.store_weights("A", Some(payload(4)), 0, 4);
        let counts: Vec<usize> = st.ordered_payloads().iter().map(|p| p.map_or(0, |p| p.trees.len())).collect();
        assert_eq!(counts, vec![4, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_spares_clients_with_weights() {
        let mut st = SessionState::new(3);
        st.register("quiet", HashMap::new());
        st.register("busy", HashMap::new());
        st.store_weights("busy", Some(payload(2)), 10, 2);
        tokio::time::advance(Duration::from_secs(121)).await;
        st.register("late", HashMap::new());
        let evicted = st.evict_idle_without_weights(Duration::from_secs(120), Instant::now());
        assert_eq!(evicted, vec!["quiet".to_string()]);
        assert!(st.clients.contains_key("busy"));
        assert!(st.clients.contains_key("late"));
    }

    #[test]
    fn reset_rotates_session_and_clears_maps() {
        let mut st = SessionState::new(2);
        st.register("a", HashMap::new());
        st.store_weights("a", Some(payload(1)), 0, 1);
        st.metrics.insert("a".into(), EvaluationMetrics::default());
        st.received_model.insert("a".into());
        let before = st.session_id.clone();
        let old = st.reset();
        assert_eq!(old, before);
        assert_ne!(st.session_id, before);
        assert!(st.clients.is_empty() && st.weights.is_empty() && st.metrics.is_empty() && st.received_model.is_empty());
    }

    #[test]
    fn store_invalidates_cached_round() {
        let mut st = SessionState::new(2);
        st.round_result = Some(Arc::new(RoundResult {
            contributors: BTreeSet::new(),
            round_number: 1,
            model: Vec::new(),
            metadata: ModelMetadata::default(),
        }));
        st.store_weights("a", None, 0, 0);
        assert!(st.round_result.is_none());
    }
}
