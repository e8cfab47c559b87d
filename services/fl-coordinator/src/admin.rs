//! Read-mostly introspection RPCs. Each takes the coordinator lock once and
//! copies what it needs out.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use treefed_core::federated_learning::AggregationStats;
use treefed_proto::{
    ClientInfo, ClientMetricsSummary, ConnectedClientsResponse, ModelInfoResponse, ResetSessionResponse,
    ServerStatusResponse, TrainingStatsResponse,
};

use crate::registry::SessionStatus;
use crate::{FederatedLearningService, ResetReason};

impl FederatedLearningService {
    pub fn server_status(&self) -> ServerStatusResponse {
        // sampled before locking, an aggregation holds the lock while it runs
        let aggregation_in_progress = self.shared.aggregation_in_progress.load(Ordering::SeqCst);
        let inner = self.shared.inner.lock();
        ServerStatusResponse {
            running: true,
            session_id: inner.session.session_id.clone(),
            connected_clients_count: inner.session.clients.len() as u32,
            expected_clients: self.shared.config.expected_clients as u32,
            server_start_time: self.shared.started_at_ms,
            total_rounds_completed: inner.rounds_completed,
            aggregation_in_progress,
        }
    }

    pub fn connected_clients(&self) -> ConnectedClientsResponse {
        let inner = self.shared.inner.lock();
        let session = &inner.session;
        let mut clients: Vec<ClientInfo> = session
            .clients
            .iter()
            .map(|(client_id, reg)| {
                let stored = session.weights.get(client_id);
                ClientInfo {
                    client_id: client_id.clone(),
                    joined_at: reg.joined_at.timestamp_millis(),
                    has_sent_weights: stored.is_some(),
                    has_sent_metrics: session.metrics.contains_key(client_id),
                    model_size_bytes: stored.map_or(0, |w| w.declared_size_bytes),
                    num_trees: stored.map_or(0, |w| w.tree_count() as u64),
                }
            })
            .collect();
        clients.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.client_id.cmp(&b.client_id)));
        let total_count = clients.len() as u32;
        ConnectedClientsResponse { clients, total_count }
    }

    /// Lifetime counters plus the latest metrics each client ever reported,
    /// including clients from sessions that have since been reset.
    pub fn training_stats(&self) -> TrainingStatsResponse {
        let inner = self.shared.inner.lock();
        let mut latest = BTreeMap::new();
        for record in &inner.metrics_history {
            latest.insert(record.client_id.as_str(), record);
        }
        let client_metrics = latest
            .into_values()
            .map(|r| ClientMetricsSummary {
                client_id: r.client_id.clone(),
                accuracy: r.metrics.accuracy,
                f1_score: r.metrics.f1_score,
                training_samples: r.metrics.training_samples,
            })
            .collect();
        TrainingStatsResponse {
            total_weights_received: inner.weights_received_total,
            total_metrics_received: inner.metrics_received_total,
            aggregations_completed: inner.aggregations_completed,
            last_aggregation_time: inner.last_aggregation_ms,
            client_metrics,
        }
    }

    pub fn model_info(&self) -> ModelInfoResponse {
        let info = self.shared.inner.lock().model.info();
        ModelInfoResponse {
            current_round: info.current_round,
            has_current_model: info.has_current_model,
            history_length: info.history_length as u64,
            is_persistent: info.is_persistent,
            save_path: info.save_path,
        }
    }

    /// Drops every registration and payload and starts a new session.
    pub fn reset_session(&self) -> ResetSessionResponse {
        let mut inner = self.shared.inner.lock();
        let previous_session_id = self.reset_locked(&mut inner, ResetReason::Admin);
        ResetSessionResponse { previous_session_id, session_id: inner.session.session_id.clone() }
    }

    pub fn session_status(&self) -> SessionStatus { self.shared.inner.lock().session.status() }

    pub fn aggregation_stats(&self) -> AggregationStats { self.shared.inner.lock().aggregator.stats() }

    /// Snapshot served on the health server's `/status` route.
    pub fn status_snapshot(&self) -> serde_json::Value {
        let inner = self.shared.inner.lock();
        serde_json::json!({
            "session": inner.session.status(),
            "model": inner.model.info(),
            "aggregator": inner.aggregator.stats(),
            "rounds_completed": inner.rounds_completed,
            "aggregation_in_progress": self.shared.aggregation_in_progress.load(Ordering::SeqCst),
        })
    }
}
