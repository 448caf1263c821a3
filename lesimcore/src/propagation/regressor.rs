//! Path loss predicted by a pretrained tree ensemble.
//!
//! Trees are stored in the flat array layout used by scikit-learn and XGBoost dumps:
//! node `i` splits on `feature[i] <= threshold[i]`, going to `children_left[i]`
//! when true and `children_right[i]` otherwise. Leaves have both children set to `-1`
//! and carry the prediction in `value[i]`.
//!
//! Inputs are `[distance in km, gateway antenna height in m, device altitude in m]`,
//! standardised with the stored scaler before prediction.

use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    sim_file::{SimFileError, load_file},
    units::*,
};

use super::{ImplPropagationModel, ModelError};

pub const FEATURE_COUNT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StandardScaler {
    pub mean: [f64; FEATURE_COUNT],
    pub scale: [f64; FEATURE_COUNT],
}

impl StandardScaler {
    fn transform(&self, features: [f64; FEATURE_COUNT]) -> [f64; FEATURE_COUNT] {
        let mut out = features;
        for (i, x) in out.iter_mut().enumerate() {
            *x = (*x - self.mean[i]) / self.scale[i];
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegressionTree {
    pub children_left: Vec<i32>,
    pub children_right: Vec<i32>,
    pub feature: Vec<usize>,
    pub threshold: Vec<f64>,
    pub value: Vec<f64>,
}

impl RegressionTree {
    pub fn leaf(value: f64) -> Self {
        Self {
            children_left: vec![-1],
            children_right: vec![-1],
            feature: vec![0],
            threshold: vec![0.0],
            value: vec![value],
        }
    }

    /// Checks the arrays describe a tree that [`Self::predict`] can walk without
    /// indexing out of bounds or looping.
    fn check(&self) -> Result<(), String> {
        let len = self.value.len();

        if len == 0 {
            return Err("tree has no nodes".to_owned());
        }
        if [
            self.children_left.len(),
            self.children_right.len(),
            self.feature.len(),
            self.threshold.len(),
        ]
        .iter()
        .any(|x| *x != len)
        {
            return Err("tree arrays differ in length".to_owned());
        }

        for node in 0..len {
            let left = self.children_left[node];
            let right = self.children_right[node];

            if left == -1 && right == -1 {
                continue;
            }

            // Children always come after their parent, which rules out cycles.
            let in_range = |child: i32| child > node as i32 && (child as usize) < len;
            if !in_range(left) || !in_range(right) {
                return Err(format!("node {node} has invalid children"));
            }
            if self.feature[node] >= FEATURE_COUNT {
                return Err(format!("node {node} splits on unknown feature"));
            }
        }

        Ok(())
    }

    pub fn predict(&self, features: &[f64; FEATURE_COUNT]) -> f64 {
        let mut node = 0;

        while self.children_left[node] != -1 {
            node = if features[self.feature[node]] <= self.threshold[node] {
                self.children_left[node]
            } else {
                self.children_right[node]
            } as usize;
        }

        self.value[node]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum Aggregation {
    /// Decision trees and random forests.
    Mean,
    /// Gradient boosting, leaf values already include the learning rate.
    Sum { base_score: f64 },
}

/// Regressor predicting path loss in dB.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PretrainedRegressor {
    pub name: String,
    pub scaler: StandardScaler,
    pub trees: Vec<RegressionTree>,
    pub aggregation: Aggregation,
    pub gateway_height: Length,
}

impl PretrainedRegressor {
    /// Loads and validates a regressor from a JSON or MessagePack file.
    pub fn load(path: PathBuf) -> Result<Self, SimFileError> {
        let regressor: PretrainedRegressor = load_file(path)?;
        regressor.validate()?;

        tracing::debug!(
            name = %regressor.name,
            trees = regressor.trees.len(),
            "loaded pretrained regressor"
        );

        Ok(regressor)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let malformed = |reason: String| ModelError::MalformedRegressor {
            model: self.name.clone(),
            reason,
        };

        if self.trees.is_empty() {
            return Err(malformed("no trees".to_owned()));
        }
        if self.scaler.scale.iter().any(|x| *x == 0.0 || !x.is_finite()) {
            return Err(malformed("scaler has a zero or non-finite scale".to_owned()));
        }

        for (i, tree) in self.trees.iter().enumerate() {
            tree.check().map_err(|x| malformed(format!("tree {i}: {x}")))?;
        }

        Ok(())
    }

    pub fn path_loss(&self, distance: Length, altitude: Length) -> Dbf {
        let features = self.scaler.transform([
            distance.km(),
            self.gateway_height.metres(),
            altitude.metres(),
        ]);

        let total: f64 = self.trees.iter().map(|x| x.predict(&features)).sum();

        let loss = match self.aggregation {
            Aggregation::Mean => total / self.trees.len() as f64,
            Aggregation::Sum { base_score } => base_score + total,
        };

        Dbf::from_db_value(loss)
    }
}

impl ImplPropagationModel for PretrainedRegressor {
    fn tp_to_rss<R: Rng + ?Sized>(
        &self,
        _rng: &mut R,
        _indoor: bool,
        tx_power: Dbm,
        distance: Length,
        altitude: Length,
    ) -> Result<Dbm, ModelError> {
        Ok(tx_power - self.path_loss(distance, altitude))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    use super::*;
    use crate::{assert_close, propagation::PropagationModel};

    /// Splits on distance at 1 km, 110 dB closer and 130 dB further away.
    fn stump() -> RegressionTree {
        RegressionTree {
            children_left: vec![1, -1, -1],
            children_right: vec![2, -1, -1],
            feature: vec![0, 0, 0],
            threshold: vec![1.0, 0.0, 0.0],
            value: vec![0.0, 110.0, 130.0],
        }
    }

    fn regressor(trees: Vec<RegressionTree>, aggregation: Aggregation) -> PretrainedRegressor {
        PretrainedRegressor {
            name: "forest".to_owned(),
            scaler: StandardScaler {
                mean: [0.0; 3],
                scale: [1.0; 3],
            },
            trees,
            aggregation,
            gateway_height: Length::from_metres(10.0),
        }
    }

    #[test]
    fn forest_averages_trees() {
        let model = regressor(vec![stump(), RegressionTree::leaf(120.0)], Aggregation::Mean);
        assert_eq!(model.validate(), Ok(()));

        let near = model.path_loss(Length::from_metres(500.0), Length::from_metres(0.0));
        let far = model.path_loss(Length::from_metres(2500.0), Length::from_metres(0.0));

        assert_close(near.as_db_float(), 115.0);
        assert_close(far.as_db_float(), 125.0);
    }

    #[test]
    fn boosting_sums_trees() {
        let model = regressor(
            vec![RegressionTree::leaf(20.0), RegressionTree::leaf(-5.0)],
            Aggregation::Sum { base_score: 100.0 },
        );
        let loss = model.path_loss(Length::from_metres(500.0), Length::from_metres(0.0));
        assert_close(loss.as_db_float(), 115.0);
    }

    #[test]
    fn rss_is_tx_power_minus_prediction() {
        let model: PropagationModel = regressor(vec![stump()], Aggregation::Mean).into();
        let mut rng = ChaCha12Rng::seed_from_u64(0);

        let rss = model
            .tp_to_rss(
                &mut rng,
                true,
                Dbm::from_dbm(14.0),
                Length::from_metres(800.0),
                Length::from_metres(3.0),
            )
            .unwrap();

        assert_close(rss.dbm(), -96.0);
        assert_eq!(model.name(), "forest");
    }

    #[test]
    fn cyclic_tree_is_rejected() {
        let mut tree = stump();
        tree.children_left[0] = 0;
        let model = regressor(vec![tree], Aggregation::Mean);

        assert!(matches!(
            model.validate(),
            Err(ModelError::MalformedRegressor { .. })
        ));
    }
}
