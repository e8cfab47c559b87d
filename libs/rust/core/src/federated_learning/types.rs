use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// One serialized tree exactly as the client produced it.
///
/// The coordinator never looks inside; the raw JSON text is carried through
/// aggregation, persistence and redistribution unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeBlob(Box<RawValue>);

impl TreeBlob {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        Ok(Self(RawValue::from_string(text.to_owned())?))
    }

    pub fn as_str(&self) -> &str { self.0.get() }
}

impl PartialEq for TreeBlob {
    fn eq(&self, other: &Self) -> bool { self.as_str() == other.as_str() }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not a valid weight document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-client contribution submitted through `SubmitWeights`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightPayload {
    #[serde(default)]
    pub trees: Vec<TreeBlob>,
    #[serde(default)]
    pub feature_importance: BTreeMap<String, f64>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub num_features: u64,
}

impl WeightPayload {
    /// Decodes the UTF-8 JSON document a client sends. A literal `null`
    /// document decodes to `None` and is skipped later by the aggregator.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, PayloadError> {
        let text = std::str::from_utf8(bytes)?;
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleTree {
    pub tree_structure: TreeBlob,
    /// 1-based position of the contributing payload in the aggregation input.
    pub client_id: usize,
    pub original_tree_id: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientContribution {
    pub client_id: usize,
    pub num_trees: usize,
    pub num_features: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationMetadata {
    pub method: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_clients: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_trees: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_trees: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_trees: Option<usize>,
}

/// Merged ensemble produced by bagging (and later blending).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedEnsemble {
    pub trees: Vec<EnsembleTree>,
    pub feature_importance: BTreeMap<String, f64>,
    pub config: Option<serde_json::Value>,
    pub num_boosted_rounds: usize,
    pub num_features: u64,
    pub client_contributions: Vec<ClientContribution>,
    pub aggregation_metadata: AggregationMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleInfo {
    pub total_trees: usize,
    pub num_clients: usize,
    pub aggregation_method: String,
    pub creation_timestamp: String,
    pub is_incremental: bool,
}

/// The global model for one round, as persisted under `current_model`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleModel {
    pub model_type: String,
    pub round_number: u64,
    pub aggregated_weights: AggregatedEnsemble,
    pub ensemble_info: EnsembleInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u64,
    pub num_trees: usize,
    pub num_clients: usize,
    pub timestamp: String,
    pub is_incremental: bool,
}

/// On-disk document written after every round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedModel {
    #[serde(default)]
    pub current_model: Option<EnsembleModel>,
    #[serde(default)]
    pub model_history: Vec<RoundSummary>,
    #[serde(default)]
    pub round_number: u64,
    #[serde(default)]
    pub last_saved: String,
}

/// Local wall-clock timestamp in ISO-8601 form without offset.
pub fn iso_timestamp() -> String {
    chrono::Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}
