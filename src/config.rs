use crate::condition::CustomConditionEvaluator;
use crate::hierarchy::RoleDefinition;
use crate::matrix::PermissionMatrix;
use crate::policy::PolicySet;
use crate::request::Decision;
use crate::types::RoleId;
use std::sync::Arc;
use std::time::Duration;

/// Default lifetime of cached session decisions.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
/// Default bound on cached decisions per session.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Static configuration consumed by [`AccessEngine`](crate::AccessEngine).
#[derive(Clone)]
pub struct AccessConfig {
    pub roles: Vec<RoleDefinition>,
    pub permission_matrix: Option<PermissionMatrix>,
    pub policy_sets: Vec<PolicySet>,
    /// Roles that bypass every other check.
    pub super_admin_roles: Vec<RoleId>,
    /// Zero disables caching.
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub enable_audit: bool,
    /// Decision `not-applicable` and `indeterminate` results resolve to.
    pub default_decision: Decision,
    pub custom_evaluator: Option<Arc<dyn CustomConditionEvaluator>>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            roles: Vec::new(),
            permission_matrix: None,
            policy_sets: Vec::new(),
            super_admin_roles: Vec::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            enable_audit: false,
            default_decision: Decision::Deny,
            custom_evaluator: None,
        }
    }
}

impl std::fmt::Debug for AccessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessConfig")
            .field("roles", &self.roles.len())
            .field("permission_matrix", &self.permission_matrix.is_some())
            .field("policy_sets", &self.policy_sets.len())
            .field("super_admin_roles", &self.super_admin_roles)
            .field("cache_ttl", &self.cache_ttl)
            .field("cache_capacity", &self.cache_capacity)
            .field("enable_audit", &self.enable_audit)
            .field("default_decision", &self.default_decision)
            .field("custom_evaluator", &self.custom_evaluator.is_some())
            .finish()
    }
}

impl AccessConfig {
    pub fn builder() -> AccessConfigBuilder {
        AccessConfigBuilder::new()
    }
}

/// Builder for [`AccessConfig`].
#[derive(Debug, Default)]
pub struct AccessConfigBuilder {
    config: AccessConfig,
}

impl AccessConfigBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(mut self, role: RoleDefinition) -> Self {
        self.config.roles.push(role);
        self
    }

    pub fn roles(mut self, roles: impl IntoIterator<Item = RoleDefinition>) -> Self {
        self.config.roles.extend(roles);
        self
    }

    pub fn permission_matrix(mut self, matrix: PermissionMatrix) -> Self {
        self.config.permission_matrix = Some(matrix);
        self
    }

    pub fn policy_set(mut self, set: PolicySet) -> Self {
        self.config.policy_sets.push(set);
        self
    }

    pub fn super_admin_role(mut self, role: RoleId) -> Self {
        self.config.super_admin_roles.push(role);
        self
    }

    /// Sets how long session decisions stay cached; zero disables caching.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    pub fn enable_audit(mut self, on: bool) -> Self {
        self.config.enable_audit = on;
        self
    }

    /// Sets what inconclusive decisions resolve to. Only `Allow` opens access.
    pub fn default_decision(mut self, decision: Decision) -> Self {
        self.config.default_decision = decision;
        self
    }

    pub fn custom_evaluator(mut self, evaluator: Arc<dyn CustomConditionEvaluator>) -> Self {
        self.config.custom_evaluator = Some(evaluator);
        self
    }

    pub fn build(self) -> AccessConfig {
        self.config
    }
}
