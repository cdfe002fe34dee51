use std::collections::HashSet;

use serde::Serialize;

use crate::{
    bucketing::bucket_user,
    event::{now_millis, Event, FeatureRequestEvent},
    flag::{Rollout, Target, VariationOrRollout},
    Error, FeatureFlag, FlagSource, FlagValue, Result, User,
};

/// Why a flag resolved to its variation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// The flag is off.
    Off,
    /// A prerequisite was missing, off, or resolved to another variation. The flag is treated
    /// as off.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    /// The user key is listed in one of the flag's targets.
    TargetMatch,
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        rule_id: Option<String>,
    },
    /// No target or rule matched.
    Fallthrough,
    /// The flag could not be evaluated and the caller's default is used.
    #[serde(rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    FlagNotFound,
    /// The flag references a variation that does not exist.
    MalformedFlag,
    SourceUnavailable,
    /// The client is offline or its SDK key was rejected.
    ClientOffline,
}

/// Result of evaluating a flag for a user.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub variation_index: Option<usize>,
    /// `None` means the caller's default should be used.
    pub value: Option<FlagValue>,
    /// Whether this outcome counts as an experiment exposure.
    pub in_experiment: bool,
    pub reason: Reason,
    /// Feature events for every prerequisite checked along the way, in evaluation order.
    pub prerequisite_events: Vec<Event>,
}

impl FeatureFlag {
    /// Evaluate the flag for `user`, resolving prerequisites through `flag_source`.
    ///
    /// Evaluation has no side effects: events for prerequisites are returned in the
    /// [`Decision`] for the caller to queue.
    ///
    /// Fails only with [`Error::Unauthorized`], when `flag_source` rejects the SDK key while
    /// fetching a prerequisite. Any other fetch error fails that prerequisite.
    pub fn evaluate(&self, user: &User, flag_source: &dyn FlagSource) -> Result<Decision> {
        let mut evaluator = Evaluator {
            user,
            flag_source,
            in_progress: HashSet::new(),
            events: Vec::new(),
            unauthorized: false,
        };

        let outcome = evaluator.evaluate(self);
        if evaluator.unauthorized {
            return Err(Error::Unauthorized);
        }
        let value = self.variation_value(outcome.variation_index);

        log::trace!(target: "flagship",
                    flag_key:display = self.key,
                    user_key = user.key(),
                    variation_index:debug = outcome.variation_index,
                    reason:serde = outcome.reason;
                    "evaluated a flag");

        Ok(Decision {
            variation_index: outcome.variation_index,
            value,
            in_experiment: outcome.in_experiment,
            reason: outcome.reason,
            prerequisite_events: evaluator.events,
        })
    }
}

struct Outcome {
    variation_index: Option<usize>,
    in_experiment: bool,
    reason: Reason,
    /// A prerequisite cycle was found somewhere below this flag.
    cycle: bool,
}

impl Outcome {
    fn off(flag: &FeatureFlag, reason: Reason, cycle: bool) -> Outcome {
        Outcome {
            variation_index: flag.off_variation,
            in_experiment: false,
            reason,
            cycle,
        }
        .checked(flag)
    }

    /// Replace indices that do not address a variation with an error.
    fn checked(self, flag: &FeatureFlag) -> Outcome {
        match self.variation_index {
            Some(index) if index >= flag.variations.len() => {
                log::warn!(target: "flagship",
                           flag_key:display = flag.key,
                           variation_index = index;
                           "flag references a variation that does not exist");
                Outcome {
                    variation_index: None,
                    in_experiment: false,
                    reason: Reason::Error {
                        error_kind: ErrorKind::MalformedFlag,
                    },
                    cycle: self.cycle,
                }
            }
            _ => self,
        }
    }
}

/// Holds per-call state so that `FeatureFlag::evaluate` stays free of shared mutable state.
struct Evaluator<'a> {
    user: &'a User,
    flag_source: &'a dyn FlagSource,
    /// Keys of flags on the current evaluation path, used to detect prerequisite cycles.
    in_progress: HashSet<String>,
    events: Vec<Event>,
    /// The flag source rejected the SDK key. Evaluation stops and the outcome is discarded.
    unauthorized: bool,
}

impl<'a> Evaluator<'a> {
    fn evaluate(&mut self, flag: &FeatureFlag) -> Outcome {
        if !flag.on {
            return Outcome::off(flag, Reason::Off, false);
        }

        self.in_progress.insert(flag.key.clone());
        let outcome = self.evaluate_on(flag);
        self.in_progress.remove(&flag.key);
        outcome
    }

    fn evaluate_on(&mut self, flag: &FeatureFlag) -> Outcome {
        let (failed_prerequisite, cycle) = self.check_prerequisites(flag);
        if let Some(prerequisite_key) = failed_prerequisite {
            return Outcome::off(flag, Reason::PrerequisiteFailed { prerequisite_key }, cycle);
        }

        if let Some(variation) = match_target(&flag.targets, self.user) {
            return Outcome {
                variation_index: Some(variation),
                in_experiment: false,
                reason: Reason::TargetMatch,
                cycle,
            }
            .checked(flag);
        }

        let (variation_or_rollout, reason) = flag
            .rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(self.user))
            .map(|(rule_index, rule)| {
                let reason = Reason::RuleMatch {
                    rule_index,
                    rule_id: rule.id.clone(),
                };
                (&rule.variation_or_rollout, reason)
            })
            .unwrap_or((&flag.fallthrough, Reason::Fallthrough));

        let (variation_index, in_experiment) =
            variation_or_rollout.variation_index_for_user(self.user, &flag.key, &flag.salt);

        Outcome {
            variation_index,
            in_experiment,
            reason,
            cycle,
        }
        .checked(flag)
    }

    /// Check every prerequisite of `flag`, recording one event per prerequisite.
    ///
    /// All prerequisites are checked even after one fails. Returns the key of the first failed
    /// prerequisite, if any, and whether a cycle was detected.
    fn check_prerequisites(&mut self, flag: &FeatureFlag) -> (Option<String>, bool) {
        let mut first_failure = None;
        let mut cycle = false;

        for prerequisite in &flag.prerequisites {
            if self.unauthorized {
                break;
            }
            let passed = match self.flag_source.get_flag(&prerequisite.key) {
                Ok(Some(prerequisite_flag)) if self.in_progress.contains(&prerequisite.key) => {
                    log::warn!(target: "flagship",
                               flag_key:display = flag.key,
                               prerequisite_key:display = prerequisite.key;
                               "prerequisite cycle detected");
                    cycle = true;
                    self.record(&prerequisite.key, Some(&prerequisite_flag), None, flag);
                    false
                }
                Ok(Some(prerequisite_flag)) => {
                    let outcome = self.evaluate(&prerequisite_flag);
                    cycle |= outcome.cycle;
                    self.record(
                        &prerequisite.key,
                        Some(&prerequisite_flag),
                        outcome.variation_index,
                        flag,
                    );
                    prerequisite_flag.on
                        && !outcome.cycle
                        && outcome.variation_index == Some(prerequisite.variation)
                }
                Ok(None) => {
                    log::warn!(target: "flagship",
                               flag_key:display = flag.key,
                               prerequisite_key:display = prerequisite.key;
                               "prerequisite flag not found");
                    self.record(&prerequisite.key, None, None, flag);
                    false
                }
                Err(Error::Unauthorized) => {
                    self.unauthorized = true;
                    false
                }
                Err(err) => {
                    log::warn!(target: "flagship",
                               flag_key:display = flag.key,
                               prerequisite_key:display = prerequisite.key;
                               "failed to fetch prerequisite flag: {err}");
                    self.record(&prerequisite.key, None, None, flag);
                    false
                }
            };

            if !passed && first_failure.is_none() {
                first_failure = Some(prerequisite.key.clone());
            }
        }

        (first_failure, cycle)
    }

    fn record(
        &mut self,
        key: &str,
        prerequisite_flag: Option<&FeatureFlag>,
        variation_index: Option<usize>,
        dependent: &FeatureFlag,
    ) {
        let value = prerequisite_flag
            .and_then(|flag| flag.variation_value(variation_index))
            .unwrap_or(FlagValue::Null);

        self.events.push(Event::Feature(FeatureRequestEvent {
            creation_date: now_millis(),
            key: key.to_owned(),
            user: self.user.clone(),
            variation: variation_index,
            value,
            default: FlagValue::Null,
            version: prerequisite_flag.map(|flag| flag.version),
            prereq_of: Some(dependent.key.clone()),
        }));
    }
}

/// Return the variation of the first target listing the user's key.
fn match_target(targets: &[Target], user: &User) -> Option<usize> {
    targets
        .iter()
        .find(|target| target.values.contains(user.key()))
        .map(|target| target.variation)
}

impl VariationOrRollout {
    /// Resolve to a variation index and whether the outcome is an experiment exposure.
    ///
    /// A fixed variation is never an experiment exposure. For rollouts, if the user's bucket
    /// falls past the sum of all weights, the last weighted variation is used.
    pub fn variation_index_for_user(
        &self,
        user: &User,
        flag_key: &str,
        salt: &str,
    ) -> (Option<usize>, bool) {
        if let Some(variation) = self.variation {
            return (Some(variation), false);
        }
        let Some(rollout) = &self.rollout else {
            return (None, false);
        };
        let Some(last) = rollout.variations.last() else {
            return (None, false);
        };

        let bucket_by = rollout.bucket_by.as_deref().unwrap_or("key");
        let bucket = bucket_user(user, flag_key, bucket_by, salt, rollout.seed);

        let mut sum = 0.0;
        let chosen = rollout
            .variations
            .iter()
            .find(|weighted| {
                sum += f64::from(weighted.weight) / f64::from(Rollout::WEIGHT_SCALE);
                bucket < sum
            })
            .unwrap_or(last);

        (
            Some(chosen.variation),
            rollout.is_experiment() && !chosen.untracked,
        )
    }
}
