//! ABAC policies and combining algorithms.
//!
//! A policy is not-applicable unless its subjects, resources, actions and
//! conditions all match; empty matcher lists match everything. A condition
//! that cannot be decided makes the policy indeterminate. Orderings required
//! by a combining algorithm are applied before the combiner runs.

use crate::condition::{Comparator, Condition, ConditionEvaluator, compare};
use crate::error::{Error, Result};
use crate::pattern::{safe_pattern_match, validate_pattern};
use crate::permission::Action;
use crate::request::{AccessRequest, Decision, EvaluationResult, Resource, Subject};
use crate::types::{Attributes, PolicyId, PrincipalId, RoleId, attribute_path};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    fn decision(self) -> Decision {
        match self {
            Effect::Allow => Decision::Allow,
            Effect::Deny => Decision::Deny,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum CombiningAlgorithm {
    /// Any deny wins, then any indeterminate, then any allow.
    #[default]
    DenyOverrides,
    /// Any allow wins, then any deny, then any indeterminate.
    PermitOverrides,
    /// First allow or deny in priority order; indeterminate only when
    /// nothing conclusive applies.
    FirstApplicable,
    OrderedDenyOverrides,
    OrderedPermitOverrides,
}

impl CombiningAlgorithm {
    /// Algorithms whose input must be sorted by descending priority.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            CombiningAlgorithm::FirstApplicable
                | CombiningAlgorithm::OrderedDenyOverrides
                | CombiningAlgorithm::OrderedPermitOverrides
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            CombiningAlgorithm::DenyOverrides => "deny-overrides",
            CombiningAlgorithm::PermitOverrides => "permit-overrides",
            CombiningAlgorithm::FirstApplicable => "first-applicable",
            CombiningAlgorithm::OrderedDenyOverrides => "ordered-deny-overrides",
            CombiningAlgorithm::OrderedPermitOverrides => "ordered-permit-overrides",
        }
    }
}

/// Who a policy targets.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "lowercase"))]
pub enum SubjectMatcher {
    Role { id: RoleId },
    User { id: PrincipalId },
    Group { id: String },
    Attribute { key: String, value: Value },
    /// `*`/`?` glob over the subject id.
    Pattern { pattern: String },
}

impl SubjectMatcher {
    pub fn role(id: RoleId) -> Self {
        SubjectMatcher::Role { id }
    }

    pub fn user(id: PrincipalId) -> Self {
        SubjectMatcher::User { id }
    }

    pub fn group(id: impl Into<String>) -> Self {
        SubjectMatcher::Group { id: id.into() }
    }

    pub fn attribute(key: impl Into<String>, value: impl Into<Value>) -> Self {
        SubjectMatcher::Attribute {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        SubjectMatcher::Pattern {
            pattern: pattern.into(),
        }
    }

    pub fn matches(&self, subject: &Subject) -> bool {
        match self {
            SubjectMatcher::Role { id } => subject.roles.contains(id),
            SubjectMatcher::User { id } => &subject.id == id,
            SubjectMatcher::Group { id } => subject.groups().contains(&id.as_str()),
            SubjectMatcher::Attribute { key, value } => attribute_equals(&subject.attributes, key, value),
            SubjectMatcher::Pattern { pattern } => safe_pattern_match(pattern, subject.id.as_str()),
        }
    }
}

fn attribute_equals(attributes: &Attributes, key: &str, expected: &Value) -> bool {
    compare(attribute_path(attributes, key), Comparator::Equals, expected).unwrap_or(false)
}

/// Which resources a policy (or policy set target) covers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ResourceMatcher {
    /// Glob over the resource type; `*` matches any.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub resource_type: String,
    /// Glob over the resource id; requires the request to carry an id.
    #[cfg_attr(feature = "serde", serde(default))]
    pub id: Option<String>,
    /// Attributes that must all be equal on the resource.
    #[cfg_attr(feature = "serde", serde(default))]
    pub attributes: Attributes,
}

impl ResourceMatcher {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: None,
            attributes: Attributes::new(),
        }
    }

    pub fn with_id(mut self, pattern: impl Into<String>) -> Self {
        self.id = Some(pattern.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if !safe_pattern_match(&self.resource_type, resource.resource_type.as_str()) {
            return false;
        }
        if let Some(pattern) = &self.id {
            match &resource.id {
                Some(id) if safe_pattern_match(pattern, id) => {}
                _ => return false,
            }
        }
        self.attributes
            .iter()
            .all(|(key, value)| attribute_equals(&resource.attributes, key, value))
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Policy {
    pub id: PolicyId,
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: Option<String>,
    pub effect: Effect,
    #[cfg_attr(feature = "serde", serde(default))]
    pub priority: i32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub subjects: Vec<SubjectMatcher>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub resources: Vec<ResourceMatcher>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub actions: Vec<Action>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub conditions: Vec<Condition>,
    /// Instructions handed back with the decision when this policy decides it.
    #[cfg_attr(feature = "serde", serde(default))]
    pub obligations: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default = "enabled_by_default"))]
    pub enabled: bool,
}

#[cfg(feature = "serde")]
fn enabled_by_default() -> bool {
    true
}

impl Policy {
    pub fn new(id: PolicyId, effect: Effect) -> Self {
        Self {
            id,
            description: None,
            effect,
            priority: 0,
            subjects: Vec::new(),
            resources: Vec::new(),
            actions: Vec::new(),
            conditions: Vec::new(),
            obligations: Vec::new(),
            enabled: true,
        }
    }

    pub fn allow(id: PolicyId) -> Self {
        Self::new(id, Effect::Allow)
    }

    pub fn deny(id: PolicyId) -> Self {
        Self::new(id, Effect::Deny)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_subject(mut self, subject: SubjectMatcher) -> Self {
        self.subjects.push(subject);
        self
    }

    pub fn on_resource(mut self, resource: ResourceMatcher) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn for_actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions.extend(actions);
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_obligation(mut self, obligation: impl Into<String>) -> Self {
        self.obligations.push(obligation.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn targets(&self, request: &AccessRequest) -> bool {
        (self.subjects.is_empty() || self.subjects.iter().any(|s| s.matches(&request.subject)))
            && (self.resources.is_empty()
                || self.resources.iter().any(|r| r.matches(&request.resource)))
            && (self.actions.is_empty() || self.actions.iter().any(|a| a.covers(request.action)))
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct PolicySet {
    pub id: PolicyId,
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub combining_algorithm: CombiningAlgorithm,
    /// The set only applies to resources matching the target.
    #[cfg_attr(feature = "serde", serde(default))]
    pub target: Option<ResourceMatcher>,
    pub policies: Vec<Policy>,
}

impl PolicySet {
    pub fn new(id: PolicyId, combining_algorithm: CombiningAlgorithm) -> Self {
        Self {
            id,
            description: None,
            combining_algorithm,
            target: None,
            policies: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: ResourceMatcher) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }
}

/// Evaluates standalone policies and policy sets.
#[derive(Debug, Clone, Default)]
pub struct PolicyEvaluator {
    policies: Vec<Policy>,
    policy_sets: Vec<PolicySet>,
    combining_algorithm: CombiningAlgorithm,
    conditions: ConditionEvaluator,
}

impl PolicyEvaluator {
    /// Creates an evaluator combining standalone policies deny-overrides.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_combining_algorithm(mut self, algorithm: CombiningAlgorithm) -> Self {
        self.combining_algorithm = algorithm;
        self
    }

    pub fn with_conditions(mut self, conditions: ConditionEvaluator) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn conditions(&self) -> &ConditionEvaluator {
        &self.conditions
    }

    pub fn add_policy(&mut self, policy: Policy) {
        self.policies.push(policy);
    }

    /// Adds a set, replacing any set with the same id.
    pub fn add_policy_set(&mut self, set: PolicySet) {
        self.policy_sets.retain(|existing| existing.id != set.id);
        self.policy_sets.push(set);
    }

    /// Removes a policy from the standalone list and from every set.
    pub fn remove_policy(&mut self, id: &PolicyId) -> bool {
        let mut removed = false;
        let before = self.policies.len();
        self.policies.retain(|policy| &policy.id != id);
        removed |= self.policies.len() != before;
        for set in &mut self.policy_sets {
            let before = set.policies.len();
            set.policies.retain(|policy| &policy.id != id);
            removed |= set.policies.len() != before;
        }
        removed
    }

    pub fn remove_policy_set(&mut self, id: &PolicyId) -> bool {
        let before = self.policy_sets.len();
        self.policy_sets.retain(|set| &set.id != id);
        self.policy_sets.len() != before
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn policy_sets(&self) -> &[PolicySet] {
        &self.policy_sets
    }

    pub fn has_policy_sets(&self) -> bool {
        !self.policy_sets.is_empty()
    }

    /// Evaluates the standalone policies at the current time.
    pub fn evaluate(&self, request: &AccessRequest) -> EvaluationResult {
        self.evaluate_at(request, Utc::now())
    }

    /// Evaluates the standalone policies with `now` as the fallback clock.
    pub fn evaluate_at(&self, request: &AccessRequest, now: DateTime<Utc>) -> EvaluationResult {
        let started = Instant::now();
        let mut result = self.combine(self.combining_algorithm, &self.policies, request, now);
        result.evaluation_time = Some(started.elapsed());
        result
    }

    pub fn evaluate_policy_set(
        &self,
        id: &PolicyId,
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> Result<EvaluationResult> {
        let set = self
            .policy_sets
            .iter()
            .find(|set| &set.id == id)
            .ok_or_else(|| Error::UnknownPolicySet(id.to_string()))?;
        let started = Instant::now();
        let mut result = self.evaluate_set(set, request, now);
        result.evaluation_time = Some(started.elapsed());
        Ok(result)
    }

    /// Evaluates every set; applicable sets are combined deny-overrides.
    pub fn evaluate_policy_sets(&self, request: &AccessRequest, now: DateTime<Utc>) -> EvaluationResult {
        let started = Instant::now();
        let evaluated_at = request.timestamp_or(now);
        let results: Vec<EvaluationResult> = self
            .policy_sets
            .iter()
            .map(|set| self.evaluate_set(set, request, now))
            .collect();

        let pick = |decision: Decision| results.iter().filter(move |r| r.decision == decision);
        let decision = [Decision::Deny, Decision::Indeterminate, Decision::Allow]
            .into_iter()
            .find(|decision| pick(*decision).next().is_some())
            .unwrap_or(Decision::NotApplicable);

        let mut result = if decision == Decision::NotApplicable {
            EvaluationResult::not_applicable("no policy set applies", evaluated_at)
        } else {
            let decisive: Vec<&EvaluationResult> = pick(decision).collect();
            let reason = decisive
                .iter()
                .map(|r| r.reason.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            EvaluationResult::new(decision, reason, evaluated_at)
                .with_policies(decisive.iter().flat_map(|r| r.matching_policies.clone()).collect())
                .with_obligations(decisive.iter().flat_map(|r| r.obligations.clone()).collect())
        };
        result.evaluation_time = Some(started.elapsed());
        result
    }

    fn evaluate_set(&self, set: &PolicySet, request: &AccessRequest, now: DateTime<Utc>) -> EvaluationResult {
        if let Some(target) = &set.target
            && !target.matches(&request.resource)
        {
            return EvaluationResult::not_applicable(
                format!("policy set {} target does not match", set.id),
                request.timestamp_or(now),
            );
        }
        let result = self.combine(set.combining_algorithm, &set.policies, request, now);
        tracing::debug!(
            policy_set = %set.id,
            algorithm = set.combining_algorithm.as_str(),
            decision = result.decision.as_str(),
            "evaluated policy set"
        );
        result
    }

    fn evaluate_policy(&self, policy: &Policy, request: &AccessRequest, now: DateTime<Utc>) -> Decision {
        if !policy.enabled || !policy.targets(request) {
            return Decision::NotApplicable;
        }
        match self.conditions.evaluate_all(&policy.conditions, request, now) {
            Ok(true) => policy.effect.decision(),
            Ok(false) => Decision::NotApplicable,
            Err(error) => {
                tracing::warn!(policy = %policy.id, %error, "policy condition is undecidable");
                Decision::Indeterminate
            }
        }
    }

    fn combine(
        &self,
        algorithm: CombiningAlgorithm,
        policies: &[Policy],
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> EvaluationResult {
        let evaluated_at = request.timestamp_or(now);
        let mut ordered: Vec<&Policy> = policies.iter().collect();
        if algorithm.is_ordered() {
            ordered.sort_by_key(|policy| std::cmp::Reverse(policy.priority));
        }
        let outcomes: Vec<(&Policy, Decision)> = ordered
            .into_iter()
            .map(|policy| (policy, self.evaluate_policy(policy, request, now)))
            .filter(|(_, decision)| *decision != Decision::NotApplicable)
            .collect();

        let decision = combine_decisions(algorithm, outcomes.iter().map(|(_, decision)| *decision));
        if decision == Decision::NotApplicable {
            return EvaluationResult::not_applicable("no applicable policy", evaluated_at);
        }

        let decisive: Vec<&Policy> = match algorithm {
            CombiningAlgorithm::FirstApplicable => outcomes
                .iter()
                .filter(|(_, outcome)| *outcome == decision)
                .take(1)
                .map(|(policy, _)| *policy)
                .collect(),
            _ => outcomes
                .iter()
                .filter(|(_, outcome)| *outcome == decision)
                .map(|(policy, _)| *policy)
                .collect(),
        };
        let reason = match decisive.first() {
            Some(first) => format!(
                "{} by policy {} ({})",
                decision.as_str(),
                first.id,
                algorithm.as_str()
            ),
            None => format!("{} ({})", decision.as_str(), algorithm.as_str()),
        };
        let obligations = if decision.is_conclusive() {
            decisive
                .iter()
                .flat_map(|policy| policy.obligations.iter().cloned())
                .collect()
        } else {
            Vec::new()
        };

        EvaluationResult::new(decision, reason, evaluated_at)
            .with_policies(decisive.iter().map(|policy| policy.id.clone()).collect())
            .with_obligations(obligations)
    }

    /// Duplicate ids, invalid patterns and empty sets.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        let all = self
            .policies
            .iter()
            .chain(self.policy_sets.iter().flat_map(|set| set.policies.iter()));
        for policy in all {
            if !seen.insert(&policy.id) {
                errors.push(format!("duplicate policy id: {}", policy.id));
            }
            let subject_patterns = policy.subjects.iter().filter_map(|subject| match subject {
                SubjectMatcher::Pattern { pattern } => Some(pattern.as_str()),
                _ => None,
            });
            let resource_patterns = policy.resources.iter().flat_map(|resource| {
                std::iter::once(resource.resource_type.as_str()).chain(resource.id.as_deref())
            });
            for pattern in subject_patterns.chain(resource_patterns) {
                if let Err(error) = validate_pattern(pattern) {
                    errors.push(format!("policy {}: {error}", policy.id));
                }
            }
        }
        for set in &self.policy_sets {
            if set.policies.is_empty() {
                errors.push(format!("policy set {} has no policies", set.id));
            }
        }
        errors
    }
}

/// Reduces applicable per-policy decisions, already in the order the
/// algorithm expects.
pub fn combine_decisions(
    algorithm: CombiningAlgorithm,
    decisions: impl IntoIterator<Item = Decision>,
) -> Decision {
    let decisions: Vec<Decision> = decisions
        .into_iter()
        .filter(|decision| *decision != Decision::NotApplicable)
        .collect();
    let any = |wanted: Decision| decisions.contains(&wanted);

    match algorithm {
        CombiningAlgorithm::DenyOverrides | CombiningAlgorithm::OrderedDenyOverrides => {
            if any(Decision::Deny) {
                Decision::Deny
            } else if any(Decision::Indeterminate) {
                Decision::Indeterminate
            } else if any(Decision::Allow) {
                Decision::Allow
            } else {
                Decision::NotApplicable
            }
        }
        CombiningAlgorithm::PermitOverrides | CombiningAlgorithm::OrderedPermitOverrides => {
            if any(Decision::Allow) {
                Decision::Allow
            } else if any(Decision::Deny) {
                Decision::Deny
            } else if any(Decision::Indeterminate) {
                Decision::Indeterminate
            } else {
                Decision::NotApplicable
            }
        }
        CombiningAlgorithm::FirstApplicable => decisions
            .iter()
            .copied()
            .find(Decision::is_conclusive)
            .unwrap_or(if any(Decision::Indeterminate) {
                Decision::Indeterminate
            } else {
                Decision::NotApplicable
            }),
    }
}
