//! Persistent global ensemble: blending of fresh rounds into history and
//! durable storage of the result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::types::{
    iso_timestamp, AggregatedEnsemble, AggregationMetadata, EnsembleInfo, EnsembleModel, PersistedModel, RoundSummary,
};

pub const MAX_TOTAL_TREES: usize = 100;
pub const IMPORTANCE_DECAY: f64 = 0.7;
pub const MAX_HISTORY_ENTRIES: usize = 1_000;
pub const MODEL_TYPE: &str = "persistent_xgb_ensemble";
pub const ENSEMBLE_METHOD: &str = "bagging_with_persistence";
pub const BLEND_METHOD: &str = "simple_blend";

#[derive(Debug, Error)]
pub enum ModelStoreError {
    #[error("model file io error at {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("model file encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub current_round: u64,
    pub has_current_model: bool,
    pub history_length: usize,
    pub is_persistent: bool,
    pub save_path: String,
}

/// Blends `new` into `prior`.
///
/// Prior trees are dropped from the front until the combined list fits
/// [`MAX_TOTAL_TREES`]; new trees are never dropped. Prior importance decays
/// by [`IMPORTANCE_DECAY`] before the new value is added. The config always
/// comes from the new round, even when that round carried none.
pub fn blend(prior: &AggregatedEnsemble, new: AggregatedEnsemble) -> AggregatedEnsemble {
    let new_count = new.trees.len();
    let mut existing = prior.trees.as_slice();
    if existing.len() + new_count > MAX_TOTAL_TREES {
        let keep = MAX_TOTAL_TREES.saturating_sub(new_count);
        existing = &existing[existing.len() - keep..];
    }
    let existing_count = existing.len();
    let mut trees = existing.to_vec();
    trees.extend(new.trees);

    let mut feature_importance: BTreeMap<String, f64> =
        prior.feature_importance.iter().map(|(k, v)| (k.clone(), v * IMPORTANCE_DECAY)).collect();
    for (feature, value) in new.feature_importance {
        *feature_importance.entry(feature).or_insert(0.0) += value;
    }

    let mut client_contributions = prior.client_contributions.clone();
    client_contributions.extend(new.client_contributions);

    debug!(existing = existing_count, new = new_count, total = trees.len(), "blend_trees");
    AggregatedEnsemble {
        num_boosted_rounds: trees.len(),
        aggregation_metadata: AggregationMetadata {
            method: BLEND_METHOD.into(),
            timestamp: iso_timestamp(),
            num_clients: None,
            existing_trees: Some(existing_count),
            new_trees: Some(new_count),
            total_trees: Some(trees.len()),
        },
        trees,
        feature_importance,
        config: new.config,
        num_features: prior.num_features.max(new.num_features),
        client_contributions,
    }
}

pub struct GlobalModelManager {
    save_path: PathBuf,
    current: Option<EnsembleModel>,
    history: Vec<RoundSummary>,
    round_number: u64,
}

impl GlobalModelManager {
    /// Opens the manager, restoring a previously saved model when the file
    /// exists and parses. Any load problem starts a fresh model at round 0.
    pub fn open(save_path: impl Into<PathBuf>) -> Self {
        let save_path = save_path.into();
        let mut mgr = Self { save_path, current: None, history: Vec::new(), round_number: 0 };
        match Self::load(&mgr.save_path) {
            Ok(Some(saved)) => {
                if let Some(model) = &saved.current_model {
                    info!(
                        path = %mgr.save_path.display(),
                        round = saved.round_number,
                        trees = model.aggregated_weights.trees.len(),
                        features = model.aggregated_weights.num_features,
                        "global_model_restored"
                    );
                } else {
                    info!(path = %mgr.save_path.display(), "global_model_file_without_model");
                }
                mgr.current = saved.current_model;
                mgr.history = saved.model_history;
                mgr.round_number = saved.round_number;
            }
            Ok(None) => info!(path = %mgr.save_path.display(), "global_model_fresh_start"),
            Err(e) => warn!(error = %e, "global_model_load_failed_starting_fresh"),
        }
        mgr
    }

    fn load(path: &Path) -> Result<Option<PersistedModel>, ModelStoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path).map_err(|source| ModelStoreError::Io { path: path.to_path_buf(), source })?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn round_number(&self) -> u64 { self.round_number }
    pub fn current(&self) -> Option<&EnsembleModel> { self.current.as_ref() }
    pub fn history(&self) -> &[RoundSummary] { &self.history }
    pub fn save_path(&self) -> &Path { &self.save_path }

    /// Builds the next round's model without touching any state.
    pub fn prepare(&self, aggregated: AggregatedEnsemble) -> EnsembleModel {
        let is_incremental = self.current.is_some();
        let weights = match &self.current {
            Some(prior) => blend(&prior.aggregated_weights, aggregated),
            None => aggregated,
        };
        EnsembleModel {
            model_type: MODEL_TYPE.into(),
            round_number: self.round_number + 1,
            ensemble_info: EnsembleInfo {
                total_trees: weights.trees.len(),
                num_clients: weights.client_contributions.len(),
                aggregation_method: ENSEMBLE_METHOD.into(),
                creation_timestamp: iso_timestamp(),
                is_incremental,
            },
            aggregated_weights: weights,
        }
    }

    /// Installs a model built by [`prepare`](Self::prepare), advances the
    /// round and writes the document to disk. A failed write is logged; the
    /// in-memory round stays advanced.
    pub fn commit(&mut self, model: EnsembleModel) -> &EnsembleModel {
        debug_assert_eq!(model.round_number, self.round_number + 1);
        self.history.push(RoundSummary {
            round: model.round_number,
            num_trees: model.ensemble_info.total_trees,
            num_clients: model.ensemble_info.num_clients,
            timestamp: model.ensemble_info.creation_timestamp.clone(),
            is_incremental: model.ensemble_info.is_incremental,
        });
        if self.history.len() > MAX_HISTORY_ENTRIES {
            let overflow = self.history.len() - MAX_HISTORY_ENTRIES;
            self.history.drain(..overflow);
        }
        self.round_number += 1;
        info!(
            round = self.round_number,
            trees = model.ensemble_info.total_trees,
            clients = model.ensemble_info.num_clients,
            incremental = model.ensemble_info.is_incremental,
            "global_model_round_committed"
        );
        if let Err(e) = self.write_document(Some(&model)) {
            error!(error = %e, round = self.round_number, "global_model_save_failed");
        }
        &*self.current.insert(model)
    }

    pub fn create_ensemble(&mut self, aggregated: AggregatedEnsemble) -> &EnsembleModel {
        let model = self.prepare(aggregated);
        self.commit(model)
    }

    /// Writes the full document via a sibling temp file and a rename, so
    /// readers never observe a half-written model.
    pub fn save(&self) -> Result<(), ModelStoreError> { self.write_document(self.current.as_ref()) }

    fn write_document(&self, current: Option<&EnsembleModel>) -> Result<(), ModelStoreError> {
        let doc = PersistedModel {
            current_model: current.cloned(),
            model_history: self.history.clone(),
            round_number: self.round_number,
            last_saved: iso_timestamp(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        let io_err = |source: std::io::Error| ModelStoreError::Io { path: self.save_path.clone(), source };
        if let Some(parent) = self.save_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut tmp = self.save_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &self.save_path).map_err(io_err)?;
        debug!(path = %self.save_path.display(), "global_model_saved");
        Ok(())
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            current_round: self.round_number,
            has_current_model: self.current.is_some(),
            history_length: self.history.len(),
            is_persistent: true,
            save_path: self.save_path.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::aggregator::aggregate_bagging;
    use crate::federated_learning::types::{TreeBlob, WeightPayload};

    fn ensemble(trees: usize, tag: &str, importance: &[(&str, f64)], features: u64) -> AggregatedEnsemble {
        let payload = WeightPayload {
            trees: (0..trees).map(|i| TreeBlob::from_json(&format!(r#"{{"tag":"{tag}","i":{i}}}"#)).unwrap()).collect(),
            feature_importance: importance.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            config: None,
            num_features: features,
        };
        aggregate_bagging(&[Some(&payload)]).unwrap()
    }

    fn tag_of(t: &crate::federated_learning::types::EnsembleTree) -> String {
        let v: serde_json::Value = serde_json::from_str(t.tree_structure.as_str()).unwrap();
        format!("{}{}", v["tag"].as_str().unwrap(), v["i"])
    }

    #[test]
    fn first_round_is_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = GlobalModelManager::open(dir.path().join("model.json"));
        let agg = ensemble(8, "a", &[("hr", 1.0)], 3);
        let model = mgr.create_ensemble(agg.clone()).clone();
        assert_eq!(model.aggregated_weights, agg);
        assert_eq!(model.round_number, 1);
        assert!(!model.ensemble_info.is_incremental);
        assert_eq!(mgr.round_number(), 1);
    }

    #[test]
    fn blend_truncates_only_oldest_prior_trees() {
        let prior = ensemble(95, "old", &[], 1);
        let new = ensemble(10, "new", &[], 1);
        let out = blend(&prior, new);
        assert_eq!(out.trees.len(), MAX_TOTAL_TREES);
        assert_eq!(tag_of(&out.trees[0]), "old5");
        assert_eq!(tag_of(&out.trees[89]), "old94");
        assert!(out.trees[90..].iter().map(tag_of).eq((0..10).map(|i| format!("new{i}"))));
        assert_eq!(out.aggregation_metadata.existing_trees, Some(90));
        assert_eq!(out.aggregation_metadata.new_trees, Some(10));
    }

    #[test]
    fn blend_under_cap_keeps_everything() {
        let out = blend(&ensemble(20, "old", &[], 1), ensemble(30, "new", &[], 1));
        assert_eq!(out.trees.len(), 50);
        assert_eq!(out.num_boosted_rounds, 50);
    }

    #[test]
    fn blend_never_drops_new_trees_even_past_cap() {
        let out = blend(&ensemble(40, "old", &[], 1), ensemble(120, "new", &[], 1));
        assert_eq!(out.trees.len(), 120);
        assert!(out.trees.iter().all(|t| tag_of(t).starts_with("new")));
    }

    #[test]
    fn blend_decays_prior_importance() {
        let prior = ensemble(1, "old", &[("both", 2.0), ("prior_only", 1.0)], 4);
        let new = ensemble(1, "new", &[("both", 0.5), ("new_only", 0.25)], 9);
        let out = blend(&prior, new);
        assert_eq!(out.feature_importance["both"], 2.0 * 0.7 + 0.5);
        assert_eq!(out.feature_importance["prior_only"], 1.0 * 0.7);
        assert_eq!(out.feature_importance["new_only"], 0.25);
        assert_eq!(out.num_features, 9);
        assert_eq!(out.client_contributions.len(), 2);
        assert_eq!(out.aggregation_metadata.method, BLEND_METHOD);
    }

    #[test]
    fn blend_takes_config_from_new_round_even_when_absent() {
        let mut prior = ensemble(2, "old", &[], 1);
        prior.config = Some(serde_json::json!({"eta": 0.3}));
        let out = blend(&prior, ensemble(2, "new", &[], 1));
        assert!(out.config.is_none());

        let mut new = ensemble(1, "new", &[], 1);
        new.config = Some(serde_json::json!({"eta": 0.1}));
        assert_eq!(blend(&prior, new).config, Some(serde_json::json!({"eta": 0.1})));
    }

    #[test]
    fn rounds_increment_once_per_ensemble() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = GlobalModelManager::open(dir.path().join("model.json"));
        for k in 1..=4u64 {
            let model = mgr.create_ensemble(ensemble(30, "r", &[], 2));
            assert_eq!(model.round_number, k);
        }
        assert_eq!(mgr.round_number(), 4);
        assert_eq!(mgr.history().len(), 4);
        assert!(mgr.history()[1].is_incremental);
        assert_eq!(mgr.current().unwrap().aggregated_weights.trees.len(), 100);
    }

    #[test]
    fn prepare_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let mgr = GlobalModelManager::open(&path);
        let candidate = mgr.prepare(ensemble(2, "a", &[], 1));
        assert_eq!(candidate.round_number, 1);
        assert_eq!(mgr.round_number(), 0);
        assert!(mgr.current().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn persisted_model_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model.json");
        {
            let mut mgr = GlobalModelManager::open(&path);
            mgr.create_ensemble(ensemble(3, "a", &[("hr", 1.0)], 3));
            mgr.create_ensemble(ensemble(5, "b", &[("hr", 1.0)], 3));
        }
        let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["round_number"], 2);
        assert_eq!(doc["current_model"]["aggregated_weights"]["num_boosted_rounds"], 8);
        assert!(doc["last_saved"].is_string());

        let mut reopened = GlobalModelManager::open(&path);
        assert_eq!(reopened.round_number(), 2);
        assert_eq!(reopened.history().len(), 2);
        let next = reopened.create_ensemble(ensemble(1, "c", &[("hr", 1.0)], 3));
        assert_eq!(next.round_number, 3);
        assert_eq!(next.aggregated_weights.trees.len(), 9);
        assert!((next.aggregated_weights.feature_importance["hr"] - (1.7 * 0.7 + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn unreadable_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, b"{ definitely not json").unwrap();
        let mgr = GlobalModelManager::open(&path);
        assert_eq!(mgr.round_number(), 0);
        assert!(mgr.current().is_none());
    }

    #[test]
    fn save_failure_still_advances_round() {
        let dir = tempfile::tempdir().unwrap();
        // a directory in place of the file makes the rename fail
        let path = dir.path().join("model.json");
        std::fs::create_dir(&path).unwrap();
        let mut mgr = GlobalModelManager::open(&path);
        assert_eq!(mgr.round_number(), 0);
        mgr.create_ensemble(ensemble(2, "a", &[], 1));
        assert_eq!(mgr.round_number(), 1);
        assert!(mgr.save().is_err());
    }
}
