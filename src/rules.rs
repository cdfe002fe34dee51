use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{flag::VariationOrRollout, user::AttributeValue, User};

/// A targeting rule: if all clauses match, the user receives `variation_or_rollout`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
}

impl Rule {
    pub fn matches(&self, user: &User) -> bool {
        self.clauses.iter().all(|clause| clause.matches(user))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    pub attribute: String,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
    #[serde(default)]
    pub negate: bool,
}

impl Clause {
    /// A missing attribute never matches, regardless of `negate`.
    pub fn matches(&self, user: &User) -> bool {
        let matched = match user.value_for_evaluation(&self.attribute) {
            None | Some(AttributeValue::Null) => return false,
            Some(AttributeValue::Array(items)) => items.iter().any(|item| self.matches_any(item)),
            Some(value) => self.matches_any(&value),
        };
        matched != self.negate
    }

    fn matches_any(&self, user_value: &AttributeValue) -> bool {
        self.values
            .iter()
            .any(|clause_value| self.op.eval(user_value, clause_value))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    /// Operators this version does not know about. Never matches.
    #[serde(other)]
    Unknown,
}

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    pub fn eval(&self, user_value: &AttributeValue, clause_value: &serde_json::Value) -> bool {
        self.try_eval(user_value, clause_value).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(
        &self,
        user_value: &AttributeValue,
        clause_value: &serde_json::Value,
    ) -> Option<bool> {
        match self {
            Self::In => Some(match (user_value, clause_value) {
                (AttributeValue::String(u), serde_json::Value::String(c)) => u == c,
                (AttributeValue::Number(u), serde_json::Value::Number(c)) => Some(*u) == c.as_f64(),
                (AttributeValue::Boolean(u), serde_json::Value::Bool(c)) => u == c,
                _ => false,
            }),

            Self::StartsWith | Self::EndsWith | Self::Contains => {
                let u = user_value.as_str()?;
                let c = clause_value.as_str()?;
                Some(match self {
                    Self::StartsWith => u.starts_with(c),
                    Self::EndsWith => u.ends_with(c),
                    _ => u.contains(c),
                })
            }

            Self::Matches => {
                let u = user_value.as_str()?;
                let regex = Regex::new(clause_value.as_str()?).ok()?;
                Some(regex.is_match(u))
            }

            Self::LessThan | Self::LessThanOrEqual | Self::GreaterThan | Self::GreaterThanOrEqual => {
                let u = user_value.as_number()?;
                let c = clause_value.as_f64()?;
                Some(match self {
                    Self::LessThan => u < c,
                    Self::LessThanOrEqual => u <= c,
                    Self::GreaterThan => u > c,
                    _ => u >= c,
                })
            }

            Self::Before | Self::After => {
                let u = attribute_to_date(user_value)?;
                let c = json_to_date(clause_value)?;
                Some(if *self == Self::Before { u < c } else { u > c })
            }

            Self::SemVerEqual | Self::SemVerLessThan | Self::SemVerGreaterThan => {
                let u = parse_semver(user_value.as_str()?)?;
                let c = parse_semver(clause_value.as_str()?)?;
                Some(match self {
                    Self::SemVerEqual => u == c,
                    Self::SemVerLessThan => u < c,
                    _ => u > c,
                })
            }

            Self::Unknown => None,
        }
    }
}

fn millis_to_date(millis: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn string_to_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn attribute_to_date(value: &AttributeValue) -> Option<DateTime<Utc>> {
    match value {
        AttributeValue::Number(n) => millis_to_date(*n),
        AttributeValue::String(s) => string_to_date(s),
        _ => None,
    }
}

fn json_to_date(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => millis_to_date(n.as_f64()?),
        serde_json::Value::String(s) => string_to_date(s),
        _ => None,
    }
}

/// Parse a semantic version, accepting `"2"` and `"2.1"` as `"2.0.0"` and `"2.1.0"`.
fn parse_semver(s: &str) -> Option<Version> {
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }
    let is_short = !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.');
    if !is_short {
        return None;
    }
    let padding = 2usize.checked_sub(s.matches('.').count())?;
    Version::parse(&format!("{s}{}", ".0".repeat(padding))).ok()
}
