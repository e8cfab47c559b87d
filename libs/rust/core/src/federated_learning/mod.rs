//! Federated tree-ensemble primitives: payload and ensemble types, bagging
//! aggregation, and the persistent global model.

pub mod aggregator;
pub mod global_model;
mod types;

pub use aggregator::{aggregate_bagging, AggregationStats, BaggingAggregator};
pub use global_model::{blend, GlobalModelManager, ModelInfo, ModelStoreError, MAX_TOTAL_TREES};
pub use types::{
    iso_timestamp, AggregatedEnsemble, AggregationMetadata, ClientContribution, EnsembleInfo, EnsembleModel,
    EnsembleTree, PayloadError, PersistedModel, RoundSummary, TreeBlob, WeightPayload,
};
