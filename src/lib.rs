//! Role and attribute based access control engine.
//!
//! This crate provides strong-typed identifiers, eager permission parsing with
//! wildcard and scope matching, a cycle-safe role hierarchy, a permission
//! matrix, ABAC policies with combining algorithms and per-resource ACLs.
//! Evaluation is deny-by-default: `not-applicable` and `indeterminate`
//! decisions are never allowed unless configured otherwise.
//! Use [`AccessEngine`] for evaluation and [`ResourcePermissionManager`] for
//! resource-level grants.
//!
//! # Examples
//!
//! Role based check through a user session:
//! ```
//! use rs_access::{AccessConfig, AccessEngine, Attributes, RoleDefinition, RoleId};
//!
//! let admin = RoleDefinition::new(RoleId::try_from("admin").unwrap())
//!     .with_permissions(["*"])
//!     .unwrap();
//! let engine = AccessEngine::new(AccessConfig::builder().role(admin).build());
//! let session = engine.set_user_context([RoleId::try_from("admin").unwrap()], Attributes::new());
//! assert!(session.has_permission("documents:delete"));
//! ```
//!
//! Evaluating a request against ABAC policies:
//! ```
//! use rs_access::{
//!     AccessConfig, AccessEngine, AccessRequest, Action, Attributes, CombiningAlgorithm,
//!     Policy, PolicyId, PolicySet, PrincipalId, Resource, ResourceType, Subject,
//! };
//!
//! let set = PolicySet::new(PolicyId::try_from("reports").unwrap(), CombiningAlgorithm::DenyOverrides)
//!     .with_policy(Policy::allow(PolicyId::try_from("read-reports").unwrap()).for_actions([Action::Read]));
//! let engine = AccessEngine::new(AccessConfig::builder().policy_set(set).build());
//! let session = engine.set_user_context(Vec::new(), Attributes::new());
//! let request = AccessRequest::new(
//!     Subject::new(PrincipalId::try_from("u1").unwrap()),
//!     Resource::new(ResourceType::try_from("reports").unwrap()),
//!     Action::Read,
//! );
//! assert!(session.evaluate(&request).allowed);
//! ```
#![forbid(unsafe_code)]

mod acl;
mod audit;
mod cache;
mod condition;
mod config;
mod engine;
mod error;
mod hierarchy;
mod matrix;
mod pattern;
mod permission;
mod policy;
mod request;
mod types;

pub use crate::acl::{
    AclContext, Grantee, PermissionLevel, ResourceAcl, ResourcePermission, ResourcePermissionManager,
    ResourceRef, compare_permission_levels,
};
pub use crate::audit::{
    AuditError, AuditEvent, AuditEventType, AuditHandler, AuditHub, AuditOutcome, AuditResource,
    AuditSubject, AuditSubscription,
};
pub use crate::cache::DecisionCache;
pub use crate::condition::{
    AttributeCondition, AttributeSource, Comparator, Condition, ConditionError, ConditionEvaluator,
    ContextCondition, CustomCondition, CustomConditionEvaluator, IpCondition, IpOperator,
    LocationCondition, LocationField, LocationOperator, TimeCondition, compare,
};
pub use crate::config::{AccessConfig, AccessConfigBuilder, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
pub use crate::engine::{ANONYMOUS_SUBJECT, AccessEngine, AccessSession};
pub use crate::error::{Error, Result};
pub use crate::hierarchy::{RoleDefinition, RoleHierarchy, StructuredPermission};
pub use crate::matrix::{
    ConflictResolution, DefaultBehavior, MatrixDecision, PermissionMatrix, PermissionMatrixBuilder,
    PermissionMatrixEntry, filter_entries_by_resource, filter_entries_by_role,
    validate_permission_matrix,
};
pub use crate::pattern::{MAX_PATTERN_LEN, MAX_VALUE_LEN, safe_pattern_match, validate_pattern};
pub use crate::permission::{Action, Permission, Scope};
pub use crate::policy::{
    CombiningAlgorithm, Effect, Policy, PolicyEvaluator, PolicySet, ResourceMatcher, SubjectMatcher,
    combine_decisions,
};
pub use crate::request::{
    AccessRequest, Decision, EvaluationResult, GROUPS_ATTRIBUTE, Location, ORG_ID_ATTRIBUTE,
    OWNER_ID_ATTRIBUTE, RequestContext, Resource, Subject, SubjectKind, TEAM_ID_ATTRIBUTE,
};
pub use crate::types::{
    Attributes, GroupId, PolicyId, PrincipalId, ResourceType, RoleId, attribute_path,
};
