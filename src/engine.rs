use crate::audit::{AuditEvent, AuditHandler, AuditHub, AuditSubscription};
use crate::cache::DecisionCache;
use crate::condition::ConditionEvaluator;
use crate::config::AccessConfig;
use crate::hierarchy::RoleHierarchy;
use crate::matrix::{PermissionMatrix, validate_permission_matrix};
use crate::permission::{Action, Permission, Scope};
use crate::policy::PolicyEvaluator;
use crate::request::{AccessRequest, Decision, EvaluationResult, Resource, Subject};
use crate::types::{Attributes, PrincipalId, RoleId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Subject id for sessions whose attributes carry no usable `id`.
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

const SCOPES: [Scope; 4] = [Scope::Own, Scope::Team, Scope::Org, Scope::Global];

/// Immutable configuration snapshot shared by an engine and its sessions.
#[derive(Debug)]
struct EngineState {
    hierarchy: RoleHierarchy,
    matrix: Option<PermissionMatrix>,
    policies: PolicyEvaluator,
    conditions: ConditionEvaluator,
    super_admin_roles: HashSet<RoleId>,
    cache_ttl: Duration,
    cache_capacity: usize,
    enable_audit: bool,
    default_decision: Decision,
}

impl EngineState {
    fn from_config(config: AccessConfig) -> Self {
        let conditions = match config.custom_evaluator {
            Some(custom) => ConditionEvaluator::with_custom(custom),
            None => ConditionEvaluator::new(),
        };
        let mut policies = PolicyEvaluator::new().with_conditions(conditions.clone());
        for set in config.policy_sets {
            policies.add_policy_set(set);
        }

        Self {
            hierarchy: RoleHierarchy::new(config.roles),
            matrix: config.permission_matrix,
            policies,
            conditions,
            super_admin_roles: config.super_admin_roles.into_iter().collect(),
            cache_ttl: config.cache_ttl,
            cache_capacity: config.cache_capacity,
            enable_audit: config.enable_audit,
            default_decision: config.default_decision,
        }
    }
}

/// Access control engine combining roles, the permission matrix and ABAC
/// policy sets.
///
/// The engine holds configuration only. Per-user state lives in the
/// [`AccessSession`] returned by [`AccessEngine::set_user_context`], so one
/// engine can serve many concurrent users.
#[derive(Debug)]
pub struct AccessEngine {
    state: Arc<EngineState>,
    audit: Arc<AuditHub>,
}

impl AccessEngine {
    pub fn new(config: AccessConfig) -> Self {
        Self {
            state: Arc::new(EngineState::from_config(config)),
            audit: Arc::new(AuditHub::new()),
        }
    }

    /// Replaces the configuration for sessions created afterwards.
    ///
    /// Existing sessions keep the snapshot they were created with. Audit
    /// handlers stay registered.
    pub fn update_config(&mut self, config: AccessConfig) {
        self.state = Arc::new(EngineState::from_config(config));
        tracing::debug!(roles = self.state.hierarchy.len(), "access configuration replaced");
    }

    pub fn hierarchy(&self) -> &RoleHierarchy {
        &self.state.hierarchy
    }

    pub fn permission_matrix(&self) -> Option<&PermissionMatrix> {
        self.state.matrix.as_ref()
    }

    pub fn policy_evaluator(&self) -> &PolicyEvaluator {
        &self.state.policies
    }

    /// Registers an audit handler; events are delivered only when auditing
    /// is enabled in the configuration.
    pub fn on_audit(&self, handler: Arc<dyn AuditHandler>) -> AuditSubscription {
        self.audit.subscribe(handler)
    }

    pub fn remove_audit_handler(&self, subscription: AuditSubscription) -> bool {
        self.audit.unsubscribe(subscription)
    }

    /// Resolves the effective permissions of `roles` and returns a session
    /// evaluating requests on their behalf.
    ///
    /// The subject id is read from the `id` attribute.
    pub fn set_user_context(
        &self,
        roles: impl IntoIterator<Item = RoleId>,
        attributes: Attributes,
    ) -> AccessSession {
        let state = Arc::clone(&self.state);
        let roles: Vec<RoleId> = roles.into_iter().collect();
        let expanded_roles = state.hierarchy.active_closure(&roles);

        let mut permissions: Vec<Permission> =
            state.hierarchy.resolve_permissions(&roles).into_iter().collect();
        permissions.sort_by_cached_key(Permission::to_string);

        let subject_id = attributes
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| PrincipalId::new(id).ok())
            .unwrap_or_else(|| PrincipalId::from_string(ANONYMOUS_SUBJECT.to_string()));

        tracing::debug!(
            subject = %subject_id,
            roles = roles.len(),
            permissions = permissions.len(),
            "user context resolved"
        );

        AccessSession {
            permission_cache: DecisionCache::new(state.cache_capacity, state.cache_ttl),
            evaluation_cache: DecisionCache::new(state.cache_capacity, state.cache_ttl),
            audit: Arc::clone(&self.audit),
            subject_id,
            roles,
            expanded_roles,
            attributes,
            permissions,
            state,
        }
    }

    /// Every configuration problem across roles, the matrix and policies.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.state.hierarchy.validate();
        if let Some(matrix) = &self.state.matrix {
            errors.extend(validate_permission_matrix(matrix, Some(&self.state.hierarchy)));
        }
        errors.extend(self.state.policies.validate());
        for role in &self.state.super_admin_roles {
            if !self.state.hierarchy.contains(role) {
                errors.push(format!("super admin role '{role}' is not defined"));
            }
        }
        errors
    }
}

/// Evaluation state for one user: roles, attributes, resolved permissions
/// and decision caches.
#[derive(Debug)]
pub struct AccessSession {
    state: Arc<EngineState>,
    audit: Arc<AuditHub>,
    subject_id: PrincipalId,
    roles: Vec<RoleId>,
    expanded_roles: Vec<RoleId>,
    attributes: Attributes,
    permissions: Vec<Permission>,
    permission_cache: DecisionCache<Permission, bool>,
    evaluation_cache: DecisionCache<String, EvaluationResult>,
}

impl AccessSession {
    pub fn subject_id(&self) -> &PrincipalId {
        &self.subject_id
    }

    /// Roles assigned to the user, without inherited ones.
    pub fn roles(&self) -> &[RoleId] {
        &self.roles
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Resolved permissions, sorted by their string form.
    pub fn effective_permissions(&self) -> &[Permission] {
        &self.permissions
    }

    /// The session's user as a request subject.
    pub fn subject(&self) -> Subject {
        let mut subject = Subject::new(self.subject_id.clone()).with_roles(self.roles.clone());
        subject.attributes = self.attributes.clone();
        subject
    }

    /// Parses and checks a permission string such as `documents:delete`.
    /// Malformed strings are never granted.
    pub fn has_permission(&self, permission: &str) -> bool {
        match Permission::new(permission) {
            Ok(permission) => self.grants(&permission),
            Err(error) => {
                tracing::debug!(%error, "rejected malformed permission check");
                false
            }
        }
    }

    /// Whether any resolved permission implies `permission`.
    pub fn grants(&self, permission: &Permission) -> bool {
        if let Some(granted) = self.permission_cache.get(permission) {
            return granted;
        }
        let granted = self
            .permissions
            .iter()
            .any(|candidate| candidate.implies(permission));
        self.permission_cache.insert(permission.clone(), granted);
        granted
    }

    /// Whether the user holds `role` directly or through inheritance.
    pub fn has_role(&self, role: &RoleId) -> bool {
        self.roles.contains(role) || self.expanded_roles.contains(role)
    }

    pub fn has_any_role<'a>(&self, roles: impl IntoIterator<Item = &'a RoleId>) -> bool {
        roles.into_iter().any(|role| self.has_role(role))
    }

    pub fn has_all_roles<'a>(&self, roles: impl IntoIterator<Item = &'a RoleId>) -> bool {
        roles.into_iter().all(|role| self.has_role(role))
    }

    /// Flattened-permission check for `action` on `resource`.
    ///
    /// With `scope`, the granting permission must be at least that broad.
    /// Narrow grants also need the resource attributes to place it inside
    /// the grant's scope.
    pub fn can_access(&self, resource: &Resource, action: Action, scope: Option<Scope>) -> bool {
        let request = AccessRequest::new(self.subject(), resource.clone(), action);
        self.matching_grant(&request, scope).is_some()
    }

    /// Evaluates a request at the current time.
    #[instrument(
        skip(self, request),
        fields(
            subject = %request.subject.id,
            resource = %request.resource.resource_type,
            action = %request.action
        )
    )]
    pub fn evaluate(&self, request: &AccessRequest) -> EvaluationResult {
        self.evaluate_at(request, Utc::now())
    }

    /// Evaluates a request, using `now` when the request carries no timestamp.
    ///
    /// The subject's roles are replaced by the session roles plus the roles
    /// they inherit, and session attributes fill in subject attributes the
    /// request leaves out. Audit events are stamped with `now`.
    pub fn evaluate_at(&self, request: &AccessRequest, now: DateTime<Utc>) -> EvaluationResult {
        let started = Instant::now();
        let request = self.bind(request);
        let key = request.cache_key();

        let result = match self.evaluation_cache.get(&key) {
            Some(cached) => {
                tracing::debug!(decision = cached.decision.as_str(), "evaluation cache hit");
                cached
            }
            None => {
                let mut result = self
                    .decide(&request, now)
                    .with_default_decision(self.state.default_decision);
                result.evaluation_time = Some(started.elapsed());
                tracing::debug!(
                    decision = result.decision.as_str(),
                    allowed = result.allowed,
                    reason = %result.reason,
                    "access evaluated"
                );
                self.evaluation_cache.insert(key, result.clone());
                result
            }
        };

        if self.state.enable_audit && !self.audit.is_empty() {
            self.audit.emit(&AuditEvent::for_decision(&request, &result, now));
        }
        result
    }

    /// Drops every cached decision.
    pub fn clear_cache(&self) {
        self.permission_cache.clear();
        self.evaluation_cache.clear();
    }

    fn bind(&self, request: &AccessRequest) -> AccessRequest {
        let mut bound = request.clone();
        // inherited roles count for role matchers, as they do for has_role
        bound.subject.roles = self.roles.clone();
        bound.subject.roles.extend(
            self.expanded_roles
                .iter()
                .filter(|role| !self.roles.contains(role))
                .cloned(),
        );
        for (key, value) in &self.attributes {
            bound
                .subject
                .attributes
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        bound
    }

    fn decide(&self, request: &AccessRequest, now: DateTime<Utc>) -> EvaluationResult {
        let state = &self.state;
        let at = request.timestamp_or(now);

        if let Some(role) = self
            .expanded_roles
            .iter()
            .find(|role| state.super_admin_roles.contains(*role))
        {
            return EvaluationResult::allow(format!("super admin role {role}"), at);
        }

        if state.policies.has_policy_sets() {
            let result = state.policies.evaluate_policy_sets(request, now);
            if result.decision != Decision::NotApplicable {
                return result;
            }
        }

        if let Some(matrix) = &state.matrix {
            let outcome = matrix.evaluate(
                request,
                &self.expanded_roles,
                |role| state.hierarchy.priority(role),
                &state.conditions,
                now,
            );
            if outcome.decision != Decision::NotApplicable {
                return EvaluationResult::new(outcome.decision, outcome.reason, at);
            }
        }

        let target = format!("{}:{}", request.resource.resource_type, request.action);
        match self.matching_grant(request, None) {
            Some(granted) => EvaluationResult::allow(format!("permission {granted} grants {target}"), at),
            None => EvaluationResult::deny(format!("no permission grants {target}"), at),
        }
    }

    fn matching_grant(&self, request: &AccessRequest, required: Option<Scope>) -> Option<&Permission> {
        self.permissions
            .iter()
            .filter(|granted| granted.covers(&request.resource.resource_type, request.action))
            .filter(|granted| required.is_none_or(|scope| granted.effective_scope().covers(scope)))
            .find(|granted| scope_holds(granted.effective_scope(), request))
    }
}

/// A grant at `scope` applies when the request falls inside it or inside
/// any narrower scope.
fn scope_holds(scope: Scope, request: &AccessRequest) -> bool {
    SCOPES
        .into_iter()
        .filter(|narrower| scope.covers(*narrower))
        .any(|narrower| request.satisfies_scope(narrower))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditOutcome;
    use crate::condition::{Condition, CustomCondition};
    use crate::hierarchy::RoleDefinition;
    use crate::matrix::PermissionMatrixEntry;
    use crate::policy::{CombiningAlgorithm, Policy, PolicySet, ResourceMatcher, SubjectMatcher};
    use crate::types::{PolicyId, ResourceType};
    use parking_lot::Mutex;
    use serde_json::json;

    fn id(value: &str) -> RoleId {
        RoleId::try_from(value).unwrap()
    }

    fn role(name: &str, permissions: &[&str], inherits: &[&str]) -> RoleDefinition {
        RoleDefinition::new(id(name))
            .with_permissions(permissions.iter().copied())
            .unwrap()
            .inherits(inherits.iter().map(|p| id(p)))
    }

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    fn resource(kind: &str) -> Resource {
        Resource::new(ResourceType::try_from(kind).unwrap())
    }

    fn request(session: &AccessSession, kind: &str, action: Action) -> AccessRequest {
        AccessRequest::new(session.subject(), resource(kind), action)
    }

    fn base_config() -> AccessConfig {
        AccessConfig::builder()
            .role(role("admin", &["*"], &[]))
            .role(role("editor", &["documents:update:own"], &["viewer"]))
            .role(role("viewer", &["documents:read"], &[]))
            .build()
    }

    #[test]
    fn has_permission_should_allow_full_wildcard() {
        let engine = AccessEngine::new(base_config());
        let session = engine.set_user_context([id("admin")], Attributes::new());
        assert!(session.has_permission("documents:delete"));
        assert!(!session.has_permission("not a permission"));
    }

    #[test]
    fn session_should_resolve_inherited_permissions_and_roles() {
        let engine = AccessEngine::new(base_config());
        let session = engine.set_user_context([id("editor")], attrs(json!({"id": "u1"})));
        assert!(session.has_permission("documents:read"));
        assert!(session.has_permission("documents:update:own"));
        assert!(!session.has_permission("documents:update"));
        assert!(session.has_role(&id("viewer")));
        assert!(!session.has_role(&id("admin")));
        assert!(session.has_any_role(&[id("admin"), id("viewer")]));
        assert!(!session.has_all_roles(&[id("admin"), id("viewer")]));
        assert_eq!(session.subject_id().as_str(), "u1");
    }

    #[test]
    fn fallback_should_check_scope_against_attributes() {
        let engine = AccessEngine::new(base_config());
        let session = engine.set_user_context([id("editor")], attrs(json!({"id": "u1"})));

        let own = resource("documents").with_attribute("ownerId", "u1");
        let other = resource("documents").with_attribute("ownerId", "u2");
        assert!(session.can_access(&own, Action::Update, None));
        assert!(!session.can_access(&other, Action::Update, None));
        assert!(!session.can_access(&own, Action::Update, Some(Scope::Team)));
        assert!(session.can_access(&other, Action::Read, Some(Scope::Global)));

        let result = session.evaluate(&AccessRequest::new(session.subject(), own, Action::Update));
        assert!(result.allowed);
        assert!(result.reason.contains("documents:update:own"));
    }

    #[test]
    fn mixed_case_resource_types_should_match_grants() {
        let engine = AccessEngine::new(
            AccessConfig::builder()
                .role(role("clerk", &["Invoices:read"], &[]))
                .build(),
        );
        let session = engine.set_user_context([id("clerk")], Attributes::new());
        assert!(session.can_access(&resource("Invoices"), Action::Read, None));
        assert!(session.evaluate(&request(&session, "INVOICES", Action::Read)).allowed);
    }

    #[test]
    fn evaluate_should_deny_without_grant() {
        let engine = AccessEngine::new(base_config());
        let session = engine.set_user_context([id("viewer")], Attributes::new());
        let result = session.evaluate(&request(&session, "documents", Action::Delete));
        assert_eq!(result.decision, Decision::Deny);
        assert!(!result.allowed);
        assert!(result.evaluation_time.is_some());
    }

    #[test]
    fn super_admin_should_bypass_policies() {
        let config = AccessConfig::builder()
            .roles(base_config().roles)
            .role(role("root", &[], &[]))
            .super_admin_role(id("root"))
            .policy_set(
                PolicySet::new(PolicyId::try_from("lockdown").unwrap(), CombiningAlgorithm::DenyOverrides)
                    .with_policy(Policy::deny(PolicyId::try_from("deny-all").unwrap())),
            )
            .build();
        let engine = AccessEngine::new(config);

        let root = engine.set_user_context([id("root")], Attributes::new());
        assert!(root.evaluate(&request(&root, "billing", Action::Delete)).allowed);

        let admin = engine.set_user_context([id("admin")], Attributes::new());
        let result = admin.evaluate(&request(&admin, "billing", Action::Read));
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.matching_policies, vec![PolicyId::try_from("deny-all").unwrap()]);
    }

    #[test]
    fn policy_sets_should_run_before_matrix_and_fall_through() {
        let matrix = PermissionMatrix::builder()
            .add_entry(
                PermissionMatrixEntry::new(id("viewer"), ResourceType::try_from("reports").unwrap())
                    .deny([Action::Export]),
            )
            .build();
        let config = AccessConfig::builder()
            .roles(base_config().roles)
            .permission_matrix(matrix)
            .policy_set(
                PolicySet::new(PolicyId::try_from("exports").unwrap(), CombiningAlgorithm::FirstApplicable)
                    .with_target(ResourceMatcher::new("reports"))
                    .with_policy(
                        Policy::allow(PolicyId::try_from("finance-export").unwrap())
                            .for_actions([Action::Export])
                            .when(Condition::Attribute(crate::condition::AttributeCondition::new(
                                crate::condition::AttributeSource::Subject,
                                "department",
                                crate::condition::Comparator::Equals,
                                "finance",
                            )))
                            .with_obligation("watermark"),
                    ),
            )
            .build();
        let engine = AccessEngine::new(config);

        let finance = engine.set_user_context([id("viewer")], attrs(json!({"department": "finance"})));
        let result = finance.evaluate(&request(&finance, "reports", Action::Export));
        assert!(result.allowed);
        assert_eq!(result.obligations, vec!["watermark".to_string()]);

        let sales = engine.set_user_context([id("viewer")], attrs(json!({"department": "sales"})));
        let result = sales.evaluate(&request(&sales, "reports", Action::Export));
        assert_eq!(result.decision, Decision::Deny);
        assert!(result.reason.contains("matrix denies"));

        // no set or matrix entry for documents, so the flattened permissions decide
        let result = sales.evaluate(&request(&sales, "documents", Action::Read));
        assert!(result.allowed);
    }

    #[test]
    fn unhandled_custom_condition_should_fail_closed() {
        let set = PolicySet::new(PolicyId::try_from("mfa").unwrap(), CombiningAlgorithm::DenyOverrides)
            .with_policy(
                Policy::allow(PolicyId::try_from("mfa-read").unwrap()).when(Condition::Custom(
                    CustomCondition {
                        name: "mfa".to_string(),
                        params: Value::Null,
                    },
                )),
            );
        let engine = AccessEngine::new(
            AccessConfig::builder()
                .roles(base_config().roles)
                .policy_set(set.clone())
                .build(),
        );
        let session = engine.set_user_context([id("admin")], Attributes::new());
        let result = session.evaluate(&request(&session, "documents", Action::Read));
        assert_eq!(result.decision, Decision::Indeterminate);
        assert!(!result.allowed);

        let custom = |_: &CustomCondition, _: &AccessRequest| true;
        let engine = AccessEngine::new(
            AccessConfig::builder()
                .policy_set(set)
                .custom_evaluator(Arc::new(custom))
                .build(),
        );
        let session = engine.set_user_context(Vec::new(), Attributes::new());
        assert!(session.evaluate(&request(&session, "documents", Action::Read)).allowed);
    }

    #[test]
    fn default_decision_should_apply_to_inconclusive_results() {
        let set = PolicySet::new(PolicyId::try_from("broken").unwrap(), CombiningAlgorithm::DenyOverrides)
            .with_policy(
                Policy::deny(PolicyId::try_from("needs-check").unwrap()).when(Condition::Custom(
                    CustomCondition {
                        name: "check".to_string(),
                        params: Value::Null,
                    },
                )),
            );
        let engine = AccessEngine::new(
            AccessConfig::builder()
                .policy_set(set)
                .default_decision(Decision::Allow)
                .build(),
        );
        let session = engine.set_user_context(Vec::new(), Attributes::new());
        let result = session.evaluate(&request(&session, "documents", Action::Read));
        assert_eq!(result.decision, Decision::Indeterminate);
        assert!(result.allowed);
    }

    #[test]
    fn evaluate_should_be_idempotent() {
        let engine = AccessEngine::new(
            AccessConfig::builder()
                .roles(base_config().roles)
                .cache_ttl(Duration::ZERO)
                .build(),
        );
        let session = engine.set_user_context([id("viewer")], Attributes::new());
        let request = request(&session, "documents", Action::Read)
            .with_context(crate::request::RequestContext::at(Utc::now()));

        let mut first = session.evaluate(&request);
        let mut second = session.evaluate(&request);
        first.evaluation_time = None;
        second.evaluation_time = None;
        assert_eq!(first, second);
    }

    #[test]
    fn cached_results_should_survive_until_cleared() {
        let engine = AccessEngine::new(base_config());
        let session = engine.set_user_context([id("viewer")], Attributes::new());
        let request = request(&session, "documents", Action::Read);

        let first = session.evaluate(&request);
        let second = session.evaluate(&request);
        assert_eq!(first, second);

        session.clear_cache();
        assert_eq!(session.evaluate(&request).decision, first.decision);
    }

    #[test]
    fn audit_should_only_fire_from_evaluate_when_enabled() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let engine = AccessEngine::new(
            AccessConfig::builder()
                .roles(base_config().roles)
                .enable_audit(true)
                .build(),
        );
        let subscription = engine.on_audit(Arc::new(move |event: &AuditEvent| {
            sink.lock().push(event.result);
        }));

        let session = engine.set_user_context([id("viewer")], Attributes::new());
        assert!(session.has_permission("documents:read"));
        session.evaluate(&request(&session, "documents", Action::Read));
        session.evaluate(&request(&session, "documents", Action::Delete));
        assert_eq!(*events.lock(), vec![AuditOutcome::Allowed, AuditOutcome::Denied]);

        assert!(engine.remove_audit_handler(subscription));
        session.evaluate(&request(&session, "documents", Action::Read));
        assert_eq!(events.lock().len(), 2);

        let quiet = AccessEngine::new(base_config());
        let sink = Arc::clone(&events);
        quiet.on_audit(Arc::new(move |event: &AuditEvent| sink.lock().push(event.result)));
        let session = quiet.set_user_context([id("viewer")], Attributes::new());
        session.evaluate(&request(&session, "documents", Action::Read));
        assert_eq!(events.lock().len(), 2);
    }

    #[test]
    fn audit_events_should_carry_emission_time_on_cache_hits() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stamps);
        let engine = AccessEngine::new(
            AccessConfig::builder()
                .roles(base_config().roles)
                .enable_audit(true)
                .build(),
        );
        engine.on_audit(Arc::new(move |event: &AuditEvent| {
            sink.lock().push(event.timestamp);
        }));

        let session = engine.set_user_context([id("viewer")], Attributes::new());
        let request = request(&session, "documents", Action::Read);
        let first_at = Utc::now();
        let later_at = first_at + chrono::Duration::seconds(90);

        let first = session.evaluate_at(&request, first_at);
        let cached = session.evaluate_at(&request, later_at);
        assert_eq!(cached.evaluated_at, first.evaluated_at);
        assert_eq!(*stamps.lock(), vec![first_at, later_at]);
    }

    #[test]
    fn role_policies_should_match_inherited_roles() {
        let set = PolicySet::new(PolicyId::try_from("exports").unwrap(), CombiningAlgorithm::DenyOverrides)
            .with_policy(
                Policy::deny(PolicyId::try_from("viewers-no-export").unwrap())
                    .for_subject(SubjectMatcher::role(id("viewer")))
                    .for_actions([Action::Export]),
            );
        let engine = AccessEngine::new(
            AccessConfig::builder()
                .role(role("viewer", &["reports:read"], &[]))
                .role(role("editor", &["reports:*"], &["viewer"]))
                .policy_set(set)
                .build(),
        );
        let session = engine.set_user_context([id("editor")], Attributes::new());
        assert!(session.has_role(&id("viewer")));

        let result = session.evaluate(&request(&session, "reports", Action::Export));
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(
            result.matching_policies,
            vec![PolicyId::try_from("viewers-no-export").unwrap()]
        );
        assert!(session.evaluate(&request(&session, "reports", Action::Read)).allowed);
    }

    #[test]
    fn update_config_should_not_change_existing_sessions() {
        let mut engine = AccessEngine::new(base_config());
        let before = engine.set_user_context([id("viewer")], Attributes::new());

        engine.update_config(AccessConfig::builder().role(role("viewer", &[], &[])).build());
        let after = engine.set_user_context([id("viewer")], Attributes::new());

        assert!(before.has_permission("documents:read"));
        assert!(!after.has_permission("documents:read"));
    }

    #[test]
    fn validate_should_collect_problems() {
        let matrix = PermissionMatrix::builder()
            .add_entry(PermissionMatrixEntry::new(id("ghost"), ResourceType::try_from("documents").unwrap()))
            .build();
        let engine = AccessEngine::new(
            AccessConfig::builder()
                .role(role("a", &[], &["b"]))
                .role(role("b", &[], &["a"]))
                .permission_matrix(matrix)
                .super_admin_role(id("root"))
                .build(),
        );
        let errors = engine.validate();
        assert!(errors.iter().any(|e| e.contains("cycle")));
        assert!(errors.iter().any(|e| e.contains("ghost")));
        assert!(errors.iter().any(|e| e.contains("super admin role 'root'")));
    }
}
