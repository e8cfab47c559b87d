//! Request and response types for the coordinator's JSON RPC surface.
//!
//! Every RPC is an HTTP POST of a JSON body to the matching path in
//! [`routes`]. Byte fields are standard base64 strings.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub mod routes {
    pub const JOIN_TRAINING: &str = "/federated.FederatedLearningService/JoinTraining";
    pub const SEND_MODEL_WEIGHTS: &str = "/federated.FederatedLearningService/SendModelWeights";
    pub const GET_GLOBAL_MODEL: &str = "/federated.FederatedLearningService/GetGlobalModel";
    pub const SEND_METRICS: &str = "/federated.FederatedLearningService/SendMetrics";
    pub const GET_SERVER_STATUS: &str = "/federated.FederatedLearningService/GetServerStatus";
    pub const GET_CONNECTED_CLIENTS: &str = "/federated.FederatedLearningService/GetConnectedClients";
    pub const GET_TRAINING_STATS: &str = "/federated.FederatedLearningService/GetTrainingStats";
    pub const GET_MODEL_INFO: &str = "/federated.FederatedLearningService/GetModelInfo";
    pub const RESET_SESSION: &str = "/federated.FederatedLearningService/ResetSession";
}

/// serde adapter for `Vec<u8>` fields carried as base64 text.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub client_id: String,
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfiguration {
    pub num_rounds: u32,
    pub expected_clients: u32,
    #[serde(default)]
    pub hyperparameters: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub accepted: bool,
    pub session_id: String,
    pub config: TrainingConfiguration,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WeightsMetadata {
    #[serde(default)]
    pub model_size_bytes: u64,
    #[serde(default)]
    pub num_trees: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitWeightsRequest {
    pub client_id: String,
    pub session_id: String,
    #[serde(with = "base64_bytes")]
    pub model_weights: Vec<u8>,
    #[serde(default)]
    pub metadata: WeightsMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitWeightsResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalModelRequest {
    pub client_id: String,
    pub session_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub num_trees: u64,
    pub num_features: u64,
    pub model_size_bytes: u64,
    pub algorithm: String,
    /// Unix seconds.
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GlobalModelResponse {
    pub success: bool,
    #[serde(with = "base64_bytes", default)]
    pub global_model: Vec<u8>,
    #[serde(default)]
    pub metadata: ModelMetadata,
}

impl GlobalModelResponse {
    pub fn failure() -> Self { Self::default() }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub roc_auc: f64,
    pub log_loss: f64,
    pub training_samples: u64,
    pub validation_samples: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitMetricsRequest {
    pub client_id: String,
    #[serde(default)]
    pub metrics: EvaluationMetrics,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitMetricsResponse {
    pub success: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerStatusResponse {
    pub running: bool,
    pub session_id: String,
    pub connected_clients_count: u32,
    pub expected_clients: u32,
    /// Unix milliseconds.
    pub server_start_time: i64,
    pub total_rounds_completed: u64,
    pub aggregation_in_progress: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    /// Unix milliseconds.
    pub joined_at: i64,
    pub has_sent_weights: bool,
    pub has_sent_metrics: bool,
    pub model_size_bytes: u64,
    pub num_trees: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectedClientsResponse {
    pub clients: Vec<ClientInfo>,
    pub total_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientMetricsSummary {
    pub client_id: String,
    pub accuracy: f64,
    pub f1_score: f64,
    pub training_samples: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingStatsResponse {
    pub total_weights_received: u64,
    pub total_metrics_received: u64,
    pub aggregations_completed: u64,
    /// Unix milliseconds, 0 when no aggregation has run.
    pub last_aggregation_time: i64,
    pub client_metrics: Vec<ClientMetricsSummary>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInfoResponse {
    pub current_round: u64,
    pub has_current_model: bool,
    pub history_length: u64,
    pub is_persistent: bool,
    pub save_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResetSessionResponse {
    pub previous_session_id: String,
    pub session_id: String,
}
