//! Bagging aggregation of per-client tree ensembles.
//!
//! Trees are concatenated rather than averaged. Feature importance is summed
//! after dividing every entry by the length of the input list, null and
//! tree-less entries included.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::{
    iso_timestamp, AggregatedEnsemble, AggregationMetadata, ClientContribution, EnsembleTree, WeightPayload,
};

pub const BAGGING_METHOD: &str = "bagging";

/// Merges the given payloads. Returns `None` when no payload carried a tree.
pub fn aggregate_bagging(payloads: &[Option<&WeightPayload>]) -> Option<AggregatedEnsemble> {
    if payloads.is_empty() {
        warn!("bagging_no_payloads");
        return None;
    }
    let list_len = payloads.len() as f64;
    let mut trees = Vec::new();
    let mut feature_importance: BTreeMap<String, f64> = BTreeMap::new();
    let mut config = None;
    let mut client_contributions = Vec::new();

    for (idx, payload) in payloads.iter().enumerate() {
        let ordinal = idx + 1;
        let Some(payload) = payload else {
            warn!(client = ordinal, "bagging_null_payload_skipped");
            continue;
        };
        if payload.trees.is_empty() {
            warn!(client = ordinal, "bagging_empty_payload_skipped");
            continue;
        }
        debug!(client = ordinal, trees = payload.trees.len(), features = payload.num_features, "bagging_client");

        trees.extend(payload.trees.iter().enumerate().map(|(tree_idx, tree)| EnsembleTree {
            tree_structure: tree.clone(),
            client_id: ordinal,
            original_tree_id: tree_idx,
        }));
        for (feature, importance) in &payload.feature_importance {
            *feature_importance.entry(feature.clone()).or_insert(0.0) += importance / list_len;
        }
        if config.is_none() && payload.config.is_some() {
            config = payload.config.clone();
        }
        client_contributions.push(ClientContribution {
            client_id: ordinal,
            num_trees: payload.trees.len(),
            num_features: payload.num_features,
        });
    }

    if client_contributions.is_empty() {
        warn!(inputs = payloads.len(), "bagging_no_valid_clients");
        return None;
    }

    let num_features = payloads.iter().flatten().map(|p| p.num_features).max().unwrap_or(0);
    info!(
        valid = client_contributions.len(),
        inputs = payloads.len(),
        trees = trees.len(),
        features = num_features,
        "bagging_completed"
    );
    Some(AggregatedEnsemble {
        num_boosted_rounds: trees.len(),
        trees,
        feature_importance,
        config,
        num_features,
        client_contributions,
        aggregation_metadata: AggregationMetadata {
            method: BAGGING_METHOD.into(),
            timestamp: iso_timestamp(),
            num_clients: Some(payloads.len()),
            existing_trees: None,
            new_trees: None,
            total_trees: None,
        },
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationStats {
    pub total_rounds: u64,
    pub successful_aggregations: u64,
    pub failed_aggregations: u64,
}

/// Stateful wrapper that keeps success/failure tallies around [`aggregate_bagging`].
#[derive(Debug, Default)]
pub struct BaggingAggregator {
    stats: AggregationStats,
}

impl BaggingAggregator {
    pub fn new() -> Self { Self::default() }

    pub fn aggregate(&mut self, payloads: &[Option<&WeightPayload>]) -> Option<AggregatedEnsemble> {
        let out = aggregate_bagging(payloads);
        if out.is_some() {
            self.stats.successful_aggregations += 1;
            self.stats.total_rounds += 1;
        } else {
            self.stats.failed_aggregations += 1;
        }
        out
    }

    pub fn stats(&self) -> AggregationStats { self.stats }
}
