//! Declarative role x resource permission table.

use crate::condition::{Condition, ConditionEvaluator};
use crate::error::Result;
use crate::hierarchy::RoleHierarchy;
use crate::permission::{Action, Scope};
use crate::request::{AccessRequest, Decision};
use crate::types::{ResourceType, RoleId};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Decision used when matching entries say nothing about the action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DefaultBehavior {
    Allow,
    #[default]
    Deny,
}

/// How to settle an action that is both allowed and denied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ConflictResolution {
    #[default]
    DenyWins,
    AllowWins,
    /// The entry of the highest-priority role decides; ties keep entry order.
    Priority,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct PermissionMatrixEntry {
    pub role_id: RoleId,
    /// Resource type or `*`.
    pub resource: ResourceType,
    #[cfg_attr(feature = "serde", serde(default))]
    pub allowed_actions: BTreeSet<Action>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub denied_actions: BTreeSet<Action>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scope: Option<Scope>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub conditions: Vec<Condition>,
}

impl PermissionMatrixEntry {
    pub fn new(role_id: RoleId, resource: ResourceType) -> Self {
        Self {
            role_id,
            resource,
            allowed_actions: BTreeSet::new(),
            denied_actions: BTreeSet::new(),
            scope: None,
            conditions: Vec::new(),
        }
    }

    /// Builds an entry from raw strings, rejecting unknown action names.
    pub fn parse(role: &str, resource: &str, allowed: &[&str], denied: &[&str]) -> Result<Self> {
        let mut entry = Self::new(RoleId::new(role)?, ResourceType::new(resource)?);
        for action in allowed {
            entry.allowed_actions.insert(action.parse()?);
        }
        for action in denied {
            entry.denied_actions.insert(action.parse()?);
        }
        Ok(entry)
    }

    pub fn allow(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.allowed_actions.extend(actions);
        self
    }

    pub fn deny(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.denied_actions.extend(actions);
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_conditions(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions.extend(conditions);
        self
    }

    pub fn allows(&self, action: Action) -> bool {
        self.allowed_actions.iter().any(|granted| granted.covers(action))
    }

    pub fn denies(&self, action: Action) -> bool {
        self.denied_actions.iter().any(|denied| denied.covers(action))
    }

    fn conflicting_actions(&self) -> Vec<Action> {
        self.allowed_actions
            .iter()
            .filter(|allowed| {
                self.denied_actions
                    .iter()
                    .any(|denied| denied.covers(**allowed) || allowed.covers(*denied))
            })
            .copied()
            .collect()
    }
}

/// Matrix outcome with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixDecision {
    pub decision: Decision,
    pub reason: String,
}

impl MatrixDecision {
    fn new(decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: reason.into(),
        }
    }
}

/// Immutable permission table built by [`PermissionMatrixBuilder`].
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct PermissionMatrix {
    entries: Vec<PermissionMatrixEntry>,
    #[cfg_attr(feature = "serde", serde(default))]
    default_behavior: DefaultBehavior,
    #[cfg_attr(feature = "serde", serde(default))]
    conflict_resolution: ConflictResolution,
}

impl PermissionMatrix {
    pub fn builder() -> PermissionMatrixBuilder {
        PermissionMatrixBuilder::new()
    }

    pub fn entries(&self) -> &[PermissionMatrixEntry] {
        &self.entries
    }

    pub fn default_behavior(&self) -> DefaultBehavior {
        self.default_behavior
    }

    pub fn conflict_resolution(&self) -> ConflictResolution {
        self.conflict_resolution
    }

    /// Evaluates `request` for the given roles.
    ///
    /// Returns [`Decision::NotApplicable`] when no entry matches any role for
    /// the resource. Matching entries that are silent on the action fall back
    /// to the default behavior.
    pub fn evaluate<P>(
        &self,
        request: &AccessRequest,
        roles: &[RoleId],
        priority: P,
        conditions: &ConditionEvaluator,
        now: DateTime<Utc>,
    ) -> MatrixDecision
    where
        P: Fn(&RoleId) -> i32,
    {
        let action = request.action;
        let mut matching: Vec<&PermissionMatrixEntry> = Vec::new();
        let mut has_allow = false;
        let mut has_deny = false;

        for entry in &self.entries {
            if !roles.contains(&entry.role_id)
                || !entry.resource.covers(&request.resource.resource_type)
            {
                continue;
            }
            if entry.scope.is_some_and(|scope| !request.satisfies_scope(scope)) {
                continue;
            }
            match conditions.evaluate_all(&entry.conditions, request, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    tracing::warn!(role = %entry.role_id, %error, "matrix entry condition failed");
                    // An undecidable entry can still deny, never allow.
                    if entry.denies(action) {
                        has_deny = true;
                        matching.push(entry);
                    }
                    continue;
                }
            }
            has_allow |= entry.allows(action);
            has_deny |= entry.denies(action);
            matching.push(entry);
        }

        if matching.is_empty() {
            return MatrixDecision::new(
                Decision::NotApplicable,
                format!("no matrix entry for {}", request.resource.resource_type),
            );
        }

        match (has_allow, has_deny) {
            (true, false) => MatrixDecision::new(Decision::Allow, format!("matrix allows {action}")),
            (false, true) => MatrixDecision::new(Decision::Deny, format!("matrix denies {action}")),
            (false, false) => match self.default_behavior {
                DefaultBehavior::Allow => {
                    MatrixDecision::new(Decision::Allow, "matrix default behavior: allow")
                }
                DefaultBehavior::Deny => {
                    MatrixDecision::new(Decision::Deny, "matrix default behavior: deny")
                }
            },
            (true, true) => self.resolve_conflict(matching, action, priority),
        }
    }

    fn resolve_conflict<P>(
        &self,
        mut matching: Vec<&PermissionMatrixEntry>,
        action: Action,
        priority: P,
    ) -> MatrixDecision
    where
        P: Fn(&RoleId) -> i32,
    {
        match self.conflict_resolution {
            ConflictResolution::DenyWins => {
                MatrixDecision::new(Decision::Deny, format!("conflict on {action}: deny wins"))
            }
            ConflictResolution::AllowWins => {
                MatrixDecision::new(Decision::Allow, format!("conflict on {action}: allow wins"))
            }
            ConflictResolution::Priority => {
                matching.sort_by_key(|entry| std::cmp::Reverse(priority(&entry.role_id)));
                for entry in matching {
                    if entry.denies(action) {
                        return MatrixDecision::new(
                            Decision::Deny,
                            format!("conflict on {action}: role {} denies", entry.role_id),
                        );
                    }
                    if entry.allows(action) {
                        return MatrixDecision::new(
                            Decision::Allow,
                            format!("conflict on {action}: role {} allows", entry.role_id),
                        );
                    }
                }
                MatrixDecision::new(Decision::Deny, format!("conflict on {action}: unresolved"))
            }
        }
    }

    /// Boolean view of [`PermissionMatrix::evaluate`] using the request's own
    /// roles at equal priority; not-applicable falls back to the default behavior.
    pub fn is_allowed(&self, request: &AccessRequest, conditions: &ConditionEvaluator) -> bool {
        let outcome = self.evaluate(
            request,
            &request.subject.roles,
            |_| 0,
            conditions,
            Utc::now(),
        );
        match outcome.decision {
            Decision::Allow => true,
            Decision::NotApplicable => self.default_behavior == DefaultBehavior::Allow,
            Decision::Deny | Decision::Indeterminate => false,
        }
    }
}

/// Builder for [`PermissionMatrix`].
#[derive(Debug, Clone, Default)]
pub struct PermissionMatrixBuilder {
    entries: Vec<PermissionMatrixEntry>,
    default_behavior: DefaultBehavior,
    conflict_resolution: ConflictResolution,
}

impl PermissionMatrixBuilder {
    /// Creates a builder that denies by default and lets deny win conflicts.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_behavior(mut self, behavior: DefaultBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    pub fn conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    pub fn add_entry(mut self, entry: PermissionMatrixEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn grant_full_access(self, role: RoleId, resource: ResourceType) -> Self {
        self.add_entry(PermissionMatrixEntry::new(role, resource).allow([Action::All]))
    }

    pub fn grant_read_only(self, role: RoleId, resource: ResourceType) -> Self {
        self.add_entry(PermissionMatrixEntry::new(role, resource).allow(Action::READ_ONLY))
    }

    pub fn grant_crud(self, role: RoleId, resource: ResourceType) -> Self {
        self.add_entry(PermissionMatrixEntry::new(role, resource).allow(Action::CRUD))
    }

    pub fn deny_actions(
        self,
        role: RoleId,
        resource: ResourceType,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        self.add_entry(PermissionMatrixEntry::new(role, resource).deny(actions))
    }

    pub fn add_conditional_entry(
        self,
        role: RoleId,
        resource: ResourceType,
        actions: impl IntoIterator<Item = Action>,
        conditions: impl IntoIterator<Item = Condition>,
    ) -> Self {
        self.add_entry(
            PermissionMatrixEntry::new(role, resource)
                .allow(actions)
                .with_conditions(conditions),
        )
    }

    pub fn build(self) -> PermissionMatrix {
        PermissionMatrix {
            entries: self.entries,
            default_behavior: self.default_behavior,
            conflict_resolution: self.conflict_resolution,
        }
    }
}

pub fn filter_entries_by_role<'a>(
    matrix: &'a PermissionMatrix,
    role: &RoleId,
) -> Vec<&'a PermissionMatrixEntry> {
    matrix
        .entries
        .iter()
        .filter(|entry| &entry.role_id == role)
        .collect()
}

/// Entries for `resource`, including `*` entries.
pub fn filter_entries_by_resource<'a>(
    matrix: &'a PermissionMatrix,
    resource: &ResourceType,
) -> Vec<&'a PermissionMatrixEntry> {
    matrix
        .entries
        .iter()
        .filter(|entry| entry.resource.covers(resource))
        .collect()
}

/// Reports conflicting, empty and dangling entries.
///
/// Role references are only checked when `roles` is supplied.
pub fn validate_permission_matrix(
    matrix: &PermissionMatrix,
    roles: Option<&RoleHierarchy>,
) -> Vec<String> {
    let mut errors = Vec::new();
    for (index, entry) in matrix.entries.iter().enumerate() {
        let label = format!("entry {index} ({} on {})", entry.role_id, entry.resource);
        if entry.allowed_actions.is_empty() && entry.denied_actions.is_empty() {
            errors.push(format!("{label} declares no actions"));
        }
        let conflicts = entry.conflicting_actions();
        if !conflicts.is_empty() {
            let names: Vec<&str> = conflicts.iter().map(Action::as_str).collect();
            errors.push(format!(
                "{label} both allows and denies: {}",
                names.join(", ")
            ));
        }
        if let Some(roles) = roles
            && !roles.contains(&entry.role_id)
        {
            errors.push(format!("{label} references unknown role"));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{AttributeCondition, AttributeSource, Comparator};
    use crate::request::{Resource, Subject};
    use crate::types::PrincipalId;
    use serde_json::json;

    fn role(value: &str) -> RoleId {
        RoleId::try_from(value).unwrap()
    }

    fn resource(value: &str) -> ResourceType {
        ResourceType::try_from(value).unwrap()
    }

    fn request(action: Action) -> AccessRequest {
        AccessRequest::new(
            Subject::new(PrincipalId::try_from("u1").unwrap())
                .with_roles([role("editor")])
                .with_attribute("department", "finance"),
            Resource::new(resource("documents")),
            action,
        )
    }

    fn decide(matrix: &PermissionMatrix, roles: &[RoleId], action: Action) -> Decision {
        matrix
            .evaluate(
                &request(action),
                roles,
                |role| if role.as_str() == "admin" { 10 } else { 1 },
                &ConditionEvaluator::new(),
                Utc::now(),
            )
            .decision
    }

    fn conflicting(resolution: ConflictResolution) -> PermissionMatrix {
        PermissionMatrix::builder()
            .conflict_resolution(resolution)
            .grant_crud(role("editor"), resource("documents"))
            .deny_actions(role("admin"), resource("documents"), [Action::Delete])
            .build()
    }

    #[test]
    fn conflict_resolution_strategies() {
        let roles = [role("editor"), role("admin")];
        assert_eq!(
            decide(&conflicting(ConflictResolution::DenyWins), &roles, Action::Delete),
            Decision::Deny
        );
        assert_eq!(
            decide(&conflicting(ConflictResolution::AllowWins), &roles, Action::Delete),
            Decision::Allow
        );
        // admin has the higher priority and denies
        assert_eq!(
            decide(&conflicting(ConflictResolution::Priority), &roles, Action::Delete),
            Decision::Deny
        );
        assert_eq!(
            decide(&conflicting(ConflictResolution::DenyWins), &roles, Action::Read),
            Decision::Allow
        );
    }

    #[test]
    fn unmatched_roles_are_not_applicable_and_silent_entries_use_default() {
        let matrix = PermissionMatrix::builder()
            .default_behavior(DefaultBehavior::Allow)
            .grant_read_only(role("viewer"), resource("*"))
            .build();
        assert_eq!(
            decide(&matrix, &[role("editor")], Action::Read),
            Decision::NotApplicable
        );
        assert_eq!(decide(&matrix, &[role("viewer")], Action::List), Decision::Allow);
        // entry matches, says nothing about export
        assert_eq!(decide(&matrix, &[role("viewer")], Action::Export), Decision::Allow);
        assert!(matrix.is_allowed(&request(Action::Delete), &ConditionEvaluator::new()));
    }

    #[test]
    fn conditional_entries_apply_only_when_conditions_hold() {
        let condition = |department: &str| {
            Condition::Attribute(AttributeCondition::new(
                AttributeSource::Subject,
                "department",
                Comparator::Equals,
                json!(department),
            ))
        };
        let matrix = PermissionMatrix::builder()
            .add_conditional_entry(role("editor"), resource("documents"), [Action::Approve], [condition("finance")])
            .build();
        assert_eq!(decide(&matrix, &[role("editor")], Action::Approve), Decision::Allow);

        let matrix = PermissionMatrix::builder()
            .add_conditional_entry(role("editor"), resource("documents"), [Action::Approve], [condition("hr")])
            .build();
        assert_eq!(
            decide(&matrix, &[role("editor")], Action::Approve),
            Decision::NotApplicable
        );
    }

    #[test]
    fn validation_reports_conflicts_and_unknown_roles() {
        let matrix = PermissionMatrix::builder()
            .add_entry(
                PermissionMatrixEntry::new(role("editor"), resource("documents"))
                    .allow([Action::Read, Action::Update])
                    .deny([Action::Update]),
            )
            .add_entry(PermissionMatrixEntry::new(role("ghost"), resource("documents")))
            .build();
        let roles = RoleHierarchy::new([crate::hierarchy::RoleDefinition::new(role("editor"))]);

        let errors = validate_permission_matrix(&matrix, Some(&roles));
        assert!(errors.iter().any(|e| e.contains("both allows and denies: update")));
        assert!(errors.iter().any(|e| e.contains("declares no actions")));
        assert!(errors.iter().any(|e| e.contains("ghost") && e.contains("unknown role")));
        assert_eq!(validate_permission_matrix(&matrix, None).len(), 2);
    }

    #[test]
    fn parse_rejects_unknown_actions() {
        let entry = PermissionMatrixEntry::parse("editor", "documents", &["read", "*"], &[]).unwrap();
        assert!(entry.allows(Action::Delete));
        assert!(matches!(
            PermissionMatrixEntry::parse("editor", "documents", &["teleport"], &[]),
            Err(crate::Error::InvalidAction(_))
        ));
    }

    #[test]
    fn filters_by_role_and_resource() {
        let matrix = PermissionMatrix::builder()
            .grant_read_only(role("viewer"), resource("*"))
            .grant_crud(role("editor"), resource("documents"))
            .grant_crud(role("editor"), resource("orders"))
            .build();
        assert_eq!(filter_entries_by_role(&matrix, &role("editor")).len(), 2);
        assert_eq!(filter_entries_by_resource(&matrix, &resource("documents")).len(), 2);
    }
}
