//! ABAC conditions.
//!
//! Each [`Condition`] variant has its own evaluator. Evaluation returns
//! `Err` when a condition cannot be decided (bad regex, no custom evaluator);
//! callers turn that into an `indeterminate` policy result, never an allow.
//! Conditions over absent attributes do not hold, except `exists: false`.

use crate::pattern::{MAX_PATTERN_LEN, MAX_VALUE_LEN};
use crate::request::AccessRequest;
use crate::types::attribute_path;
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use ipnet::IpNet;
use regex::RegexBuilder;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Why a condition could not be decided.
///
/// Any of these makes the enclosing policy `indeterminate`.
#[derive(Debug, Error)]
pub enum ConditionError {
    /// A `custom` condition with no injected evaluator.
    #[error("no evaluator registered for custom condition '{0}'")]
    UndecidableCustom(String),
    /// The injected evaluator could not decide a custom condition.
    #[error("custom condition '{name}' failed: {message}")]
    CustomFailed { name: String, message: String },
    #[error("regex operand must be a string")]
    RegexOperand,
    #[error("regex longer than {} bytes", MAX_PATTERN_LEN)]
    RegexTooLong,
    #[error("invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),
}

const REGEX_SIZE_LIMIT: usize = 1 << 16;

/// A predicate over the request and its environment.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "camelCase"))]
pub enum Condition {
    Time(TimeCondition),
    Ip(IpCondition),
    Location(LocationCondition),
    Attribute(AttributeCondition),
    Context(ContextCondition),
    Custom(CustomCondition),
}

/// Time window checks against the request timestamp.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "operator", rename_all = "camelCase"))]
pub enum TimeCondition {
    /// Inclusive on both ends.
    Between {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Before {
        at: DateTime<Utc>,
    },
    After {
        at: DateTime<Utc>,
    },
    DayOfWeek {
        days: Vec<Weekday>,
    },
    /// UTC wall-clock window; `start > end` wraps past midnight.
    TimeOfDay {
        start: NaiveTime,
        end: NaiveTime,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum IpOperator {
    Equals,
    /// Exact addresses or CIDR blocks.
    In,
    NotIn,
    StartsWith,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IpCondition {
    pub operator: IpOperator,
    pub values: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum LocationField {
    Country,
    Region,
    City,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum LocationOperator {
    Equals,
    In,
    NotIn,
}

/// Case-insensitive location check.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocationCondition {
    pub field: LocationField,
    pub operator: LocationOperator,
    pub values: Vec<String>,
}

/// Generic comparison operators shared by attribute and context conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum Comparator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    Exists,
    Regex,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub enum AttributeSource {
    #[default]
    Subject,
    Resource,
    Context,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttributeCondition {
    #[cfg_attr(feature = "serde", serde(default))]
    pub source: AttributeSource,
    /// Dotted path into the source's attributes. `id` and `type` resolve to
    /// the subject/resource identity when no attribute shadows them.
    pub key: String,
    pub operator: Comparator,
    #[cfg_attr(feature = "serde", serde(default))]
    pub value: Value,
}

impl AttributeCondition {
    pub fn new(
        source: AttributeSource,
        key: impl Into<String>,
        operator: Comparator,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            source,
            key: key.into(),
            operator,
            value: value.into(),
        }
    }
}

/// Comparison against the request context's attributes.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextCondition {
    pub key: String,
    pub operator: Comparator,
    #[cfg_attr(feature = "serde", serde(default))]
    pub value: Value,
}

/// Condition decided by an injected [`CustomConditionEvaluator`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CustomCondition {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub params: Value,
}

/// Host-supplied logic for `custom` conditions.
pub trait CustomConditionEvaluator: Send + Sync {
    /// Decides a custom condition for a request evaluated at `now`.
    fn evaluate(
        &self,
        condition: &CustomCondition,
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> std::result::Result<bool, ConditionError>;
}

impl<F> CustomConditionEvaluator for F
where
    F: Fn(&CustomCondition, &AccessRequest) -> bool + Send + Sync,
{
    fn evaluate(
        &self,
        condition: &CustomCondition,
        request: &AccessRequest,
        _now: DateTime<Utc>,
    ) -> std::result::Result<bool, ConditionError> {
        Ok(self(condition, request))
    }
}

/// Evaluates conditions, delegating `custom` ones to the injected evaluator.
///
/// Without an evaluator, custom conditions are undecidable.
#[derive(Clone, Default)]
pub struct ConditionEvaluator {
    custom: Option<Arc<dyn CustomConditionEvaluator>>,
}

impl std::fmt::Debug for ConditionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionEvaluator")
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_custom(custom: Arc<dyn CustomConditionEvaluator>) -> Self {
        Self {
            custom: Some(custom),
        }
    }

    /// Returns `Ok(true)` only when every condition holds.
    pub fn evaluate_all(
        &self,
        conditions: &[Condition],
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> std::result::Result<bool, ConditionError> {
        for condition in conditions {
            if !self.evaluate(condition, request, now)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn evaluate(
        &self,
        condition: &Condition,
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> std::result::Result<bool, ConditionError> {
        let at = request.timestamp_or(now);
        match condition {
            Condition::Time(time) => Ok(evaluate_time(time, at)),
            Condition::Ip(ip) => Ok(evaluate_ip(ip, request.context.ip_address)),
            Condition::Location(location) => Ok(evaluate_location(location, request)),
            Condition::Attribute(attribute) => {
                let actual = lookup_attribute(attribute.source, &attribute.key, request);
                compare(actual.as_ref(), attribute.operator, &attribute.value)
            }
            Condition::Context(context) => {
                let actual = attribute_path(&request.context.attributes, &context.key).cloned();
                compare(actual.as_ref(), context.operator, &context.value)
            }
            Condition::Custom(custom) => match &self.custom {
                Some(evaluator) => evaluator.evaluate(custom, request, at),
                None => {
                    tracing::warn!(
                        condition = %custom.name,
                        "custom condition without an evaluator; failing closed"
                    );
                    Err(ConditionError::UndecidableCustom(custom.name.clone()))
                }
            },
        }
    }
}

fn evaluate_time(condition: &TimeCondition, at: DateTime<Utc>) -> bool {
    match condition {
        TimeCondition::Between { start, end } => *start <= at && at <= *end,
        TimeCondition::Before { at: limit } => at < *limit,
        TimeCondition::After { at: limit } => at > *limit,
        TimeCondition::DayOfWeek { days } => days.contains(&at.weekday()),
        TimeCondition::TimeOfDay { start, end } => {
            let time = at.time();
            if start <= end {
                *start <= time && time <= *end
            } else {
                time >= *start || time <= *end
            }
        }
    }
}

fn evaluate_ip(condition: &IpCondition, ip: Option<IpAddr>) -> bool {
    let Some(ip) = ip else {
        return false;
    };
    let in_any = || condition.values.iter().any(|value| ip_in(ip, value));
    match condition.operator {
        IpOperator::Equals => condition
            .values
            .iter()
            .any(|value| value.trim().parse::<IpAddr>().is_ok_and(|candidate| candidate == ip)),
        IpOperator::In => in_any(),
        IpOperator::NotIn => !in_any(),
        IpOperator::StartsWith => {
            let rendered = ip.to_string();
            condition
                .values
                .iter()
                .any(|prefix| !prefix.is_empty() && rendered.starts_with(prefix.as_str()))
        }
    }
}

fn ip_in(ip: IpAddr, value: &str) -> bool {
    let value = value.trim();
    if value.contains('/') {
        return value.parse::<IpNet>().is_ok_and(|net| net.contains(&ip));
    }
    value.parse::<IpAddr>().is_ok_and(|candidate| candidate == ip)
}

fn evaluate_location(condition: &LocationCondition, request: &AccessRequest) -> bool {
    let Some(location) = &request.context.location else {
        return false;
    };
    let actual = match condition.field {
        LocationField::Country => location.country.as_deref(),
        LocationField::Region => location.region.as_deref(),
        LocationField::City => location.city.as_deref(),
    };
    let Some(actual) = actual else {
        return false;
    };
    let listed = condition
        .values
        .iter()
        .any(|value| value.eq_ignore_ascii_case(actual));
    match condition.operator {
        LocationOperator::Equals | LocationOperator::In => listed,
        LocationOperator::NotIn => !listed,
    }
}

fn lookup_attribute(source: AttributeSource, key: &str, request: &AccessRequest) -> Option<Value> {
    match source {
        AttributeSource::Subject => attribute_path(&request.subject.attributes, key)
            .cloned()
            .or_else(|| match key {
                "id" => Some(Value::from(request.subject.id.as_str())),
                "type" => Some(Value::from(request.subject.kind.as_str())),
                "roles" => Some(Value::from(
                    request
                        .subject
                        .roles
                        .iter()
                        .map(|role| role.as_str())
                        .collect::<Vec<_>>(),
                )),
                _ => None,
            }),
        AttributeSource::Resource => attribute_path(&request.resource.attributes, key)
            .cloned()
            .or_else(|| match key {
                "id" => request.resource.id.as_deref().map(Value::from),
                "type" => Some(Value::from(request.resource.resource_type.as_str())),
                _ => None,
            }),
        AttributeSource::Context => attribute_path(&request.context.attributes, key).cloned(),
    }
}

/// Applies `operator` to an attribute value and the configured operand.
pub fn compare(
    actual: Option<&Value>,
    operator: Comparator,
    expected: &Value,
) -> std::result::Result<bool, ConditionError> {
    let Some(actual) = actual.filter(|value| !value.is_null()) else {
        return Ok(operator == Comparator::Exists && !expected.as_bool().unwrap_or(true));
    };

    let result = match operator {
        Comparator::Equals => values_equal(actual, expected),
        Comparator::NotEquals => !values_equal(actual, expected),
        Comparator::In => contained_in(actual, expected),
        Comparator::NotIn => !contained_in(actual, expected),
        Comparator::Contains => match actual {
            Value::String(haystack) => expected
                .as_str()
                .is_some_and(|needle| haystack.contains(needle)),
            Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
            _ => false,
        },
        Comparator::StartsWith => str_pair(actual, expected).is_some_and(|(a, e)| a.starts_with(e)),
        Comparator::EndsWith => str_pair(actual, expected).is_some_and(|(a, e)| a.ends_with(e)),
        Comparator::GreaterThan => ordering(actual, expected).is_some_and(|o| o.is_gt()),
        Comparator::LessThan => ordering(actual, expected).is_some_and(|o| o.is_lt()),
        Comparator::Regex => regex_match(actual, expected)?,
        Comparator::Exists => expected.as_bool().unwrap_or(true),
    };
    Ok(result)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) if left.is_number() && right.is_number() => l == r,
        _ => left == right,
    }
}

fn contained_in(actual: &Value, expected: &Value) -> bool {
    let Value::Array(options) = expected else {
        return values_equal(actual, expected);
    };
    match actual {
        Value::Array(items) => items
            .iter()
            .any(|item| options.iter().any(|option| values_equal(item, option))),
        scalar => options.iter().any(|option| values_equal(scalar, option)),
    }
}

fn str_pair<'a>(actual: &'a Value, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((actual.as_str()?, expected.as_str()?))
}

fn ordering(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(e)) = (actual.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&e);
    }
    let (a, e) = str_pair(actual, expected)?;
    match (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(e),
    ) {
        (Ok(a), Ok(e)) => Some(a.cmp(&e)),
        _ => Some(a.cmp(e)),
    }
}

fn regex_match(actual: &Value, expected: &Value) -> std::result::Result<bool, ConditionError> {
    let Some(pattern) = expected.as_str() else {
        return Err(ConditionError::RegexOperand);
    };
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(ConditionError::RegexTooLong);
    }
    let Some(value) = actual.as_str() else {
        return Ok(false);
    };
    if value.len() > MAX_VALUE_LEN {
        return Ok(false);
    }
    let regex = RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()?;
    Ok(regex.is_match(value))
}
