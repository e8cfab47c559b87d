//! Federated tree-ensemble coordination service.
//!
//! Clients join a session, upload their locally trained trees, then block in
//! [`FederatedLearningService::request_global_model`] until the quorum is in.
//! The first caller past the barrier aggregates and blends the round; every
//! other member of the quorum gets the same bytes back.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument, warn};
use treefed_core::federated_learning::{BaggingAggregator, GlobalModelManager};
use treefed_core::{coordinator_metrics, WeightPayload};
use treefed_proto::{
    GlobalModelRequest, GlobalModelResponse, JoinRequest, JoinResponse, ModelMetadata, SubmitMetricsRequest,
    SubmitMetricsResponse, SubmitWeightsRequest, SubmitWeightsResponse, TrainingConfiguration,
};

mod admin;
pub mod http;
pub mod registry;

use registry::{ClientMetricsRecord, RoundResult, SessionState};

pub const MODEL_ALGORITHM: &str = "xgboost_ensemble";
pub const MAX_MODEL_BYTES: usize = 50 * 1024 * 1024;

/// Wait budget of the quorum barrier and related housekeeping.
#[derive(Debug, Clone)]
pub struct BarrierTimings {
    pub quorum_deadline: Duration,
    /// How long a caller waits before it starts evicting silent clients.
    pub eviction_grace: Duration,
    pub idle_eviction: Duration,
    /// Registrations without weights older than this are dropped on entry.
    pub stale_registration: Duration,
    pub poll_interval: Duration,
    pub reset_delay: Duration,
    pub health_check_interval: Duration,
}

impl Default for BarrierTimings {
    fn default() -> Self {
        Self {
            quorum_deadline: Duration::from_secs(120),
            eviction_grace: Duration::from_secs(30),
            idle_eviction: Duration::from_secs(120),
            stale_registration: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            reset_delay: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub expected_clients: usize,
    pub model_save_path: PathBuf,
    pub max_model_bytes: usize,
    pub timings: BarrierTimings,
}

impl CoordinatorConfig {
    pub fn new(expected_clients: usize, model_save_path: impl Into<PathBuf>) -> Self {
        Self {
            expected_clients,
            model_save_path: model_save_path.into(),
            max_model_bytes: MAX_MODEL_BYTES,
            timings: BarrierTimings::default(),
        }
    }
}

/// Liveness of one in-flight RPC. The transport cancels it when the peer
/// goes away; the barrier gives up as soon as it is no longer active.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self { Self::default() }
    pub fn is_active(&self) -> bool { !self.token.is_cancelled() }
    pub fn cancel(&self) { self.token.cancel() }
    pub async fn cancelled(&self) { self.token.cancelled().await }
    /// Guard that cancels this context when dropped.
    pub fn cancel_on_drop(&self) -> DropGuard { self.token.clone().drop_guard() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetReason {
    RoundComplete,
    QuorumFailed,
    Admin,
}

impl ResetReason {
    fn as_str(self) -> &'static str {
        match self {
            ResetReason::RoundComplete => "round_complete",
            ResetReason::QuorumFailed => "quorum_failed",
            ResetReason::Admin => "admin",
        }
    }
}

enum Barrier {
    Pending,
    Ready,
    Failed,
}

/// Everything guarded by the coordinator lock.
struct Coordinator {
    session: SessionState,
    model: GlobalModelManager,
    aggregator: BaggingAggregator,
    metrics_history: Vec<ClientMetricsRecord>,
    rounds_completed: u64,
    aggregations_completed: u64,
    last_aggregation_ms: i64,
    weights_received_total: u64,
    metrics_received_total: u64,
}

struct Shared {
    config: CoordinatorConfig,
    inner: Mutex<Coordinator>,
    changes: watch::Sender<u64>,
    aggregation_in_progress: AtomicBool,
    started_at_ms: i64,
}

/// Runs synchronous file IO without parking a multi-thread worker.
fn blocking_io<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Raises the in-progress flag for the lifetime of the value.
struct AggregationFlag<'a>(&'a AtomicBool);

impl<'a> AggregationFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for AggregationFlag<'_> {
    fn drop(&mut self) { self.0.store(false, Ordering::SeqCst); }
}

#[derive(Clone)]
pub struct FederatedLearningService {
    shared: Arc<Shared>,
}

impl FederatedLearningService {
    pub fn new(config: CoordinatorConfig) -> Self {
        let model = GlobalModelManager::open(&config.model_save_path);
        let session = SessionState::new(config.expected_clients);
        info!(
            session_id = %session.session_id,
            expected_clients = config.expected_clients,
            round = model.round_number(),
            "coordinator_initialized"
        );
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Coordinator {
                    session,
                    model,
                    aggregator: BaggingAggregator::new(),
                    metrics_history: Vec::new(),
                    rounds_completed: 0,
                    aggregations_completed: 0,
                    last_aggregation_ms: 0,
                    weights_received_total: 0,
                    metrics_received_total: 0,
                }),
                config,
                changes,
                aggregation_in_progress: AtomicBool::new(false),
                started_at_ms: Utc::now().timestamp_millis(),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig { &self.shared.config }

    pub fn session_id(&self) -> String { self.shared.inner.lock().session.session_id.clone() }

    fn notify(&self) { self.shared.changes.send_modify(|seq| *seq = seq.wrapping_add(1)); }

    fn training_configuration(&self) -> TrainingConfiguration {
        let hyperparameters = BTreeMap::from([
            ("learning_rate".to_string(), "0.1".to_string()),
            ("max_depth".to_string(), "6".to_string()),
            ("num_trees".to_string(), "100".to_string()),
        ]);
        TrainingConfiguration {
            num_rounds: 1,
            expected_clients: self.shared.config.expected_clients as u32,
            hyperparameters,
        }
    }

    #[instrument(skip(self, req), fields(client_id = %req.client_id))]
    pub fn join(&self, req: JoinRequest) -> JoinResponse {
        let metrics = coordinator_metrics();
        let mut inner = self.shared.inner.lock();
        if !inner.session.register(&req.client_id, req.capabilities) {
            metrics.session.joins_rejected_total.add(1, &[]);
            warn!(
                registered = inner.session.clients.len(),
                expected = inner.session.expected_clients,
                "join_rejected_session_full"
            );
            return JoinResponse { accepted: false, session_id: String::new(), config: TrainingConfiguration::default() };
        }
        let session_id = inner.session.session_id.clone();
        let registered = inner.session.clients.len();
        drop(inner);
        metrics.session.joins_total.add(1, &[]);
        self.notify();
        info!(%session_id, registered, expected = self.shared.config.expected_clients, "client_joined");
        JoinResponse { accepted: true, session_id, config: self.training_configuration() }
    }

    #[instrument(skip(self, req), fields(client_id = %req.client_id, bytes = req.model_weights.len()))]
    pub fn submit_weights(&self, req: SubmitWeightsRequest) -> SubmitWeightsResponse {
        let metrics = coordinator_metrics();
        let decoded = WeightPayload::decode(&req.model_weights);
        let mut inner = self.shared.inner.lock();
        if req.session_id != inner.session.session_id {
            metrics.round.weights_rejected_total.add(1, &[KeyValue::new("reason", "stale_session")]);
            warn!(session_id = %req.session_id, current = %inner.session.session_id, "weights_rejected_stale_session");
            return SubmitWeightsResponse { success: false, message: "Invalid session ID".into() };
        }
        let payload = match decoded {
            Ok(payload) => payload,
            Err(e) => {
                metrics.round.weights_rejected_total.add(1, &[KeyValue::new("reason", "malformed")]);
                warn!(error = %e, "weights_rejected_malformed");
                return SubmitWeightsResponse { success: false, message: format!("Error processing weights: {e}") };
            }
        };
        if !inner.session.clients.contains_key(&req.client_id) {
            warn!("weights_from_unregistered_client");
        }
        let trees = payload.as_ref().map_or(0, |p| p.trees.len());
        inner.session.store_weights(&req.client_id, payload, req.metadata.model_size_bytes, req.metadata.num_trees);
        inner.weights_received_total += 1;
        let received = inner.session.weights.len();
        let registered = inner.session.clients.len();
        drop(inner);
        metrics.round.weights_received_total.add(1, &[]);
        self.notify();
        info!(trees, received, registered, "weights_received");
        SubmitWeightsResponse { success: true, message: "Weights received successfully".into() }
    }

    /// Blocks until every registered client has submitted weights (or the
    /// deadline resolves the round), then returns the blended global model.
    #[instrument(skip(self, req, ctx), fields(client_id = %req.client_id))]
    pub async fn request_global_model(&self, req: GlobalModelRequest, ctx: CallContext) -> GlobalModelResponse {
        let timings = self.shared.config.timings.clone();
        let metrics = coordinator_metrics();
        {
            let mut inner = self.shared.inner.lock();
            if req.session_id != inner.session.session_id {
                metrics.round.round_failures_total.add(1, &[KeyValue::new("reason", "stale_session")]);
                warn!(session_id = %req.session_id, "global_model_rejected_stale_session");
                return GlobalModelResponse::failure();
            }
            let evicted = inner.session.evict_idle_without_weights(timings.stale_registration, Instant::now());
            if !evicted.is_empty() {
                metrics.session.evictions_total.add(evicted.len() as u64, &[]);
                info!(?evicted, "stale_registrations_evicted");
            }
        }
        self.notify();

        let mut changes = self.shared.changes.subscribe();
        let entered = Instant::now();
        let deadline = entered + timings.quorum_deadline;
        let grace_until = entered + timings.eviction_grace;
        let mut tick = tokio::time::interval(timings.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            match self.check_barrier(&req.session_id, &ctx, deadline, grace_until) {
                Barrier::Ready => break,
                Barrier::Failed => return GlobalModelResponse::failure(),
                Barrier::Pending => {}
            }
            tokio::select! {
                _ = changes.changed() => {}
                _ = tick.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {}
                _ = ctx.cancelled() => {}
            }
        }
        debug!(waited_ms = entered.elapsed().as_millis() as u64, "barrier_released");
        self.complete_round(&req.client_id, &req.session_id, &ctx)
    }

    fn check_barrier(&self, session_id: &str, ctx: &CallContext, deadline: Instant, grace_until: Instant) -> Barrier {
        let metrics = coordinator_metrics();
        let timings = &self.shared.config.timings;
        let mut inner = self.shared.inner.lock();
        if inner.session.session_id != session_id {
            metrics.round.round_failures_total.add(1, &[KeyValue::new("reason", "session_changed")]);
            warn!(session_id, "session_changed_while_waiting");
            return Barrier::Failed;
        }
        let received = inner.session.weights.len();
        let registered = inner.session.clients.len();
        if received >= registered {
            info!(received, registered, "quorum_reached");
            return Barrier::Ready;
        }
        if !ctx.is_active() {
            metrics.round.round_failures_total.add(1, &[KeyValue::new("reason", "caller_gone")]);
            info!(received, registered, "caller_disconnected_while_waiting");
            return Barrier::Failed;
        }
        let now = Instant::now();
        if now >= deadline {
            if received >= 2 {
                let missing = inner.session.missing_weights();
                inner.session.remove_clients(&missing);
                metrics.session.evictions_total.add(missing.len() as u64, &[]);
                drop(inner);
                self.notify();
                warn!(received, dropped = ?missing, "partial_quorum_fallback");
                return Barrier::Ready;
            }
            metrics.round.round_failures_total.add(1, &[KeyValue::new("reason", "deadline")]);
            warn!(received, registered, "quorum_deadline_exceeded");
            self.reset_locked(&mut inner, ResetReason::QuorumFailed);
            return Barrier::Failed;
        }
        if now >= grace_until {
            let evicted = inner.session.evict_idle_without_weights(timings.idle_eviction, now);
            if !evicted.is_empty() {
                metrics.session.evictions_total.add(evicted.len() as u64, &[]);
                drop(inner);
                self.notify();
                info!(?evicted, "idle_clients_evicted");
            }
        }
        Barrier::Pending
    }

    fn complete_round(&self, client_id: &str, session_id: &str, ctx: &CallContext) -> GlobalModelResponse {
        let metrics = coordinator_metrics();
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        if inner.session.session_id != session_id {
            metrics.round.round_failures_total.add(1, &[KeyValue::new("reason", "session_changed")]);
            return GlobalModelResponse::failure();
        }
        let contributors = inner.session.contributors();
        let cached = inner.session.round_result.clone().filter(|r| r.contributors == contributors);
        let result = match cached {
            Some(result) => {
                debug!(round = result.round_number, "round_result_reused");
                result
            }
            None => {
                let _flag = AggregationFlag::raise(&self.shared.aggregation_in_progress);
                let started = Instant::now();
                let Some(aggregated) = inner.aggregator.aggregate(&inner.session.ordered_payloads()) else {
                    metrics.round.round_failures_total.add(1, &[KeyValue::new("reason", "no_trees")]);
                    error!(contributors = contributors.len(), "aggregation_produced_no_trees");
                    return GlobalModelResponse::failure();
                };
                let candidate = inner.model.prepare(aggregated);
                let bytes = match serde_json::to_vec(&candidate.aggregated_weights) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        metrics.round.round_failures_total.add(1, &[KeyValue::new("reason", "encode")]);
                        error!(error = %e, "global_model_encode_failed");
                        return GlobalModelResponse::failure();
                    }
                };
                if bytes.len() > self.shared.config.max_model_bytes {
                    metrics.round.round_failures_total.add(1, &[KeyValue::new("reason", "too_large")]);
                    error!(size = bytes.len(), limit = self.shared.config.max_model_bytes, "global_model_too_large");
                    return GlobalModelResponse::failure();
                }
                if !ctx.is_active() {
                    metrics.round.round_failures_total.add(1, &[KeyValue::new("reason", "caller_gone")]);
                    info!("caller_disconnected_before_commit");
                    return GlobalModelResponse::failure();
                }
                let metadata = ModelMetadata {
                    num_trees: candidate.aggregated_weights.trees.len() as u64,
                    num_features: candidate.aggregated_weights.num_features,
                    model_size_bytes: bytes.len() as u64,
                    algorithm: MODEL_ALGORITHM.into(),
                    timestamp: Utc::now().timestamp(),
                };
                let round_number = blocking_io(|| inner.model.commit(candidate).round_number);
                inner.aggregations_completed += 1;
                inner.last_aggregation_ms = Utc::now().timestamp_millis();
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                metrics.round.aggregation_latency_ms.record(elapsed_ms, &[]);
                metrics.round.rounds_total.add(1, &[]);
                info!(
                    round = round_number,
                    trees = metadata.num_trees,
                    features = metadata.num_features,
                    size = metadata.model_size_bytes,
                    contributors = contributors.len(),
                    elapsed_ms,
                    "global_model_built"
                );
                let result = Arc::new(RoundResult { contributors, round_number, model: bytes, metadata });
                inner.session.round_result = Some(result.clone());
                result
            }
        };
        if !ctx.is_active() {
            metrics.round.round_failures_total.add(1, &[KeyValue::new("reason", "caller_gone")]);
            info!(round = result.round_number, "caller_disconnected_before_delivery");
            return GlobalModelResponse::failure();
        }
        inner.session.received_model.insert(client_id.to_string());
        if inner.session.everyone_received() && inner.session.pending_reset.is_none() {
            self.schedule_reset(inner, session_id);
        }
        drop(guard);
        self.notify();
        GlobalModelResponse { success: true, global_model: result.model.clone(), metadata: result.metadata.clone() }
    }

    /// Arms the post-round reset. The timer only fires against the session
    /// it was armed for; any earlier reset aborts it.
    fn schedule_reset(&self, inner: &mut Coordinator, session_id: &str) {
        let service = self.clone();
        let session_id = session_id.to_string();
        let delay = self.shared.config.timings.reset_delay;
        info!(%session_id, delay_ms = delay.as_millis() as u64, "session_reset_scheduled");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = service.shared.inner.lock();
            if inner.session.session_id != session_id {
                debug!(%session_id, "scheduled_reset_skipped_session_changed");
                return;
            }
            // this task is the pending reset; detach it so reset() doesn't abort it
            inner.session.pending_reset = None;
            service.reset_locked(&mut inner, ResetReason::RoundComplete);
        });
        inner.session.pending_reset = Some(handle);
    }

    fn reset_locked(&self, inner: &mut Coordinator, reason: ResetReason) -> String {
        let previous = inner.session.reset();
        if reason == ResetReason::RoundComplete {
            inner.rounds_completed += 1;
        }
        coordinator_metrics().session.session_resets_total.add(1, &[KeyValue::new("reason", reason.as_str())]);
        info!(
            previous_session_id = %previous,
            session_id = %inner.session.session_id,
            reason = reason.as_str(),
            "session_reset"
        );
        self.notify();
        previous
    }

    #[instrument(skip(self, req), fields(client_id = %req.client_id))]
    pub fn submit_metrics(&self, req: SubmitMetricsRequest) -> SubmitMetricsResponse {
        info!(
            accuracy = req.metrics.accuracy,
            f1_score = req.metrics.f1_score,
            samples = req.metrics.training_samples,
            "metrics_received"
        );
        let mut inner = self.shared.inner.lock();
        let session_id = inner.session.session_id.clone();
        inner.session.metrics.insert(req.client_id.clone(), req.metrics.clone());
        inner.metrics_history.push(ClientMetricsRecord {
            client_id: req.client_id,
            session_id,
            metrics: req.metrics,
            recorded_at: Utc::now(),
        });
        inner.metrics_received_total += 1;
        drop(inner);
        coordinator_metrics().round.metrics_received_total.add(1, &[]);
        SubmitMetricsResponse { success: true }
    }

    /// Periodic debug dump of every registration.
    pub fn spawn_health_check(&self) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        let period = self.shared.config.timings.health_check_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                let inner = service.shared.inner.lock();
                let now = Instant::now();
                debug!(
                    session_id = %inner.session.session_id,
                    registered = inner.session.clients.len(),
                    with_weights = inner.session.weights.len(),
                    "connection_health_check"
                );
                for (client_id, reg) in &inner.session.clients {
                    debug!(
                        %client_id,
                        has_weights = inner.session.weights.contains_key(client_id),
                        has_metrics = inner.session.metrics.contains_key(client_id),
                        idle_secs = now.saturating_duration_since(reg.joined_instant).as_secs(),
                        "client_health"
                    );
                }
            }
        })
    }
}
