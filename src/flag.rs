use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::rules::Rule;

/// Value of a flag variation. Variations may hold any JSON value.
pub type FlagValue = serde_json::Value;

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

/// A feature flag definition, as supplied by a [`FlagSource`](crate::FlagSource).
///
/// Flags are immutable snapshots: evaluation never modifies them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    /// Incremented by the flag source on every update.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    /// Possible values, addressed by index.
    #[serde(default)]
    pub variations: Vec<FlagValue>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub salt: String,
}

impl FeatureFlag {
    /// Map a variation index to its value.
    ///
    /// Returns `None` if there is no index, the index is out of range, or the variation is JSON
    /// `null`.
    pub fn variation_value(&self, index: Option<usize>) -> Option<FlagValue> {
        match self.variations.get(index?) {
            None | Some(FlagValue::Null) => None,
            Some(value) => Some(value.clone()),
        }
    }
}

/// An explicit list of user keys that receive a fixed variation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub values: HashSet<String>,
    pub variation: usize,
}

/// Another flag that must resolve to `variation` before the dependent flag can be on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    /// Key of the prerequisite flag.
    pub key: String,
    /// The variation index the prerequisite flag must resolve to.
    pub variation: usize,
}

/// Either a fixed variation or a percentage rollout.
///
/// If both are present, `variation` wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

impl VariationOrRollout {
    pub fn rollout(rollout: Rollout) -> VariationOrRollout {
        VariationOrRollout {
            variation: None,
            rollout: Some(rollout),
        }
    }
}

/// Percentage-based assignment of users to variations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    /// Weighted variations walked in declared order. Weights are expected to sum to
    /// [`Rollout::WEIGHT_SCALE`], but the last entry absorbs any shortfall.
    pub variations: Vec<WeightedVariation>,
    /// User attribute to bucket by. Defaults to `"key"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
    /// Replaces the `flag_key.salt` hash prefix when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default)]
    pub kind: RolloutKind,
}

impl Rollout {
    /// Sum of weights corresponding to 100%.
    pub const WEIGHT_SCALE: u32 = 100_000;

    pub fn is_experiment(&self) -> bool {
        self.kind == RolloutKind::Experiment
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    /// Outcomes count as experiment exposures.
    Experiment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    /// In thousandths of a percent, `0..=100_000`.
    pub weight: u32,
    /// Suppresses experiment exposure for users landing in this bucket.
    #[serde(default)]
    pub untracked: bool,
}
