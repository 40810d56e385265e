use crate::permission::{Action, Scope};
use crate::types::{Attributes, PolicyId, PrincipalId, ResourceType, RoleId, attribute_path};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;

/// Resource attribute naming the owning principal, used by [`Scope::Own`].
pub const OWNER_ID_ATTRIBUTE: &str = "ownerId";
/// Attribute shared by subject and resource for [`Scope::Team`].
pub const TEAM_ID_ATTRIBUTE: &str = "teamId";
/// Attribute shared by subject and resource for [`Scope::Org`].
pub const ORG_ID_ATTRIBUTE: &str = "orgId";
/// Subject attribute listing group memberships.
pub const GROUPS_ATTRIBUTE: &str = "groups";

/// Kind of principal making a request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SubjectKind {
    #[default]
    User,
    Service,
    System,
}

impl SubjectKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::User => "user",
            SubjectKind::Service => "service",
            SubjectKind::System => "system",
        }
    }
}

/// Who is asking.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Subject {
    pub id: PrincipalId,
    #[cfg_attr(feature = "serde", serde(rename = "type", default))]
    pub kind: SubjectKind,
    #[cfg_attr(feature = "serde", serde(default))]
    pub roles: Vec<RoleId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub attributes: Attributes,
}

impl Subject {
    pub fn new(id: PrincipalId) -> Self {
        Self {
            id,
            kind: SubjectKind::User,
            roles: Vec::new(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_kind(mut self, kind: SubjectKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = RoleId>) -> Self {
        self.roles.extend(roles);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Group memberships read from the `groups` attribute.
    pub fn groups(&self) -> Vec<&str> {
        match self.attributes.get(GROUPS_ATTRIBUTE) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(single)) => vec![single.as_str()],
            _ => Vec::new(),
        }
    }
}

/// What is being accessed.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resource {
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub resource_type: ResourceType,
    #[cfg_attr(feature = "serde", serde(default))]
    pub id: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub attributes: Attributes,
}

impl Resource {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            id: None,
            attributes: Attributes::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Coarse geographic location of the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Location {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// Environment of a request.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct RequestContext {
    pub timestamp: Option<DateTime<Utc>>,
    pub ip_address: Option<IpAddr>,
    pub location: Option<Location>,
    pub attributes: Attributes,
}

impl RequestContext {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::default()
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A subject-resource-action triple plus its environment.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AccessRequest {
    pub subject: Subject,
    pub resource: Resource,
    pub action: Action,
    #[cfg_attr(feature = "serde", serde(default))]
    pub context: RequestContext,
}

impl AccessRequest {
    pub fn new(subject: Subject, resource: Resource, action: Action) -> Self {
        Self {
            subject,
            resource,
            action,
            context: RequestContext::default(),
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// Request time, falling back to `now` when the caller did not pin one.
    pub fn timestamp_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.context.timestamp.unwrap_or(now)
    }

    /// Checks a scoped grant against subject and resource attributes.
    pub fn satisfies_scope(&self, scope: Scope) -> bool {
        match scope {
            Scope::Global => true,
            Scope::Own => self
                .resource
                .attributes
                .get(OWNER_ID_ATTRIBUTE)
                .and_then(Value::as_str)
                .is_some_and(|owner| owner == self.subject.id.as_str()),
            Scope::Team => self.shared_attribute(TEAM_ID_ATTRIBUTE),
            Scope::Org => self.shared_attribute(ORG_ID_ATTRIBUTE),
        }
    }

    fn shared_attribute(&self, key: &str) -> bool {
        match (
            attribute_path(&self.subject.attributes, key),
            attribute_path(&self.resource.attributes, key),
        ) {
            (Some(left), Some(right)) => !left.is_null() && left == right,
            _ => false,
        }
    }

    /// Deterministic key covering every input that can influence a decision.
    ///
    /// Segments are rendered as one JSON array, so free-form ids and
    /// attribute values cannot run into each other.
    pub fn cache_key(&self) -> String {
        let mut roles: Vec<&str> = self.subject.roles.iter().map(RoleId::as_str).collect();
        roles.sort_unstable();

        let location = self.context.location.as_ref().map(|location| {
            serde_json::json!([location.country, location.region, location.city])
        });
        serde_json::json!([
            self.subject.id.as_str(),
            self.subject.kind.as_str(),
            roles,
            self.resource.resource_type.as_str(),
            self.resource.id,
            self.action.as_str(),
            self.subject.attributes,
            self.resource.attributes,
            self.context.attributes,
            self.context.timestamp.map(|timestamp| timestamp.to_rfc3339()),
            self.context.ip_address.map(|ip| ip.to_string()),
            location,
        ])
        .to_string()
    }
}

/// Outcome of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Decision {
    /// Permission is granted.
    Allow,
    /// Permission is denied.
    Deny,
    /// Nothing applied to the request.
    NotApplicable,
    /// Something applied but could not be decided.
    Indeterminate,
}

impl Decision {
    /// Returns true for `allow` and `deny`.
    pub fn is_conclusive(&self) -> bool {
        matches!(self, Decision::Allow | Decision::Deny)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::NotApplicable => "not-applicable",
            Decision::Indeterminate => "indeterminate",
        }
    }
}

/// Result of evaluating an [`AccessRequest`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct EvaluationResult {
    pub allowed: bool,
    pub decision: Decision,
    pub matching_policies: Vec<PolicyId>,
    pub obligations: Vec<String>,
    pub reason: String,
    pub evaluated_at: DateTime<Utc>,
    pub evaluation_time: Option<Duration>,
}

impl EvaluationResult {
    /// Builds a result whose `allowed` flag is true only for [`Decision::Allow`].
    pub fn new(decision: Decision, reason: impl Into<String>, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            allowed: decision == Decision::Allow,
            decision,
            matching_policies: Vec::new(),
            obligations: Vec::new(),
            reason: reason.into(),
            evaluated_at,
            evaluation_time: None,
        }
    }

    pub fn allow(reason: impl Into<String>, evaluated_at: DateTime<Utc>) -> Self {
        Self::new(Decision::Allow, reason, evaluated_at)
    }

    pub fn deny(reason: impl Into<String>, evaluated_at: DateTime<Utc>) -> Self {
        Self::new(Decision::Deny, reason, evaluated_at)
    }

    pub fn not_applicable(reason: impl Into<String>, evaluated_at: DateTime<Utc>) -> Self {
        Self::new(Decision::NotApplicable, reason, evaluated_at)
    }

    pub fn with_policies(mut self, policies: Vec<PolicyId>) -> Self {
        self.matching_policies = policies;
        self
    }

    pub fn with_obligations(mut self, obligations: Vec<String>) -> Self {
        self.obligations = obligations;
        self
    }

    /// Maps inconclusive decisions onto `allowed` using the configured default.
    pub fn with_default_decision(mut self, default_decision: Decision) -> Self {
        if !self.decision.is_conclusive() {
            self.allowed = default_decision == Decision::Allow;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(owner: &str) -> AccessRequest {
        AccessRequest::new(
            Subject::new(PrincipalId::try_from("u1").unwrap()).with_attribute("teamId", "red"),
            Resource::new(ResourceType::try_from("documents").unwrap())
                .with_id("d1")
                .with_attribute(OWNER_ID_ATTRIBUTE, owner)
                .with_attribute("teamId", "red"),
            Action::Update,
        )
    }

    #[test]
    fn own_scope_compares_owner_attribute() {
        assert!(request("u1").satisfies_scope(Scope::Own));
        assert!(!request("u2").satisfies_scope(Scope::Own));
    }

    #[test]
    fn team_scope_requires_both_sides() {
        assert!(request("u2").satisfies_scope(Scope::Team));
        assert!(!request("u2").satisfies_scope(Scope::Org));
        assert!(request("u2").satisfies_scope(Scope::Global));
    }

    #[test]
    fn cache_key_ignores_role_order() {
        let a = request("u1");
        let mut b = a.clone();
        let mut c = a.clone();
        b.subject.roles = vec![RoleId::from_string("x".into()), RoleId::from_string("y".into())];
        c.subject.roles = vec![RoleId::from_string("y".into()), RoleId::from_string("x".into())];
        assert_eq!(b.cache_key(), c.cache_key());
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn cache_key_keeps_free_form_segments_apart() {
        let located = |country: &str, region: &str| {
            request("u1").with_context(RequestContext::default().with_location(Location {
                country: Some(country.to_string()),
                region: Some(region.to_string()),
                city: None,
            }))
        };
        assert_ne!(located("a/b", "").cache_key(), located("a", "b/").cache_key());

        let mut piped = request("u1");
        piped.resource.id = Some("d1|update".to_string());
        let mut plain = request("u1");
        plain.resource.id = Some("d1".to_string());
        assert_ne!(piped.cache_key(), plain.cache_key());
        assert_eq!(plain.cache_key(), request("u1").cache_key());
    }

    #[test]
    fn default_decision_only_touches_inconclusive_results() {
        let now = Utc::now();
        let na = EvaluationResult::not_applicable("none", now).with_default_decision(Decision::Allow);
        assert!(na.allowed);
        let deny = EvaluationResult::deny("no", now).with_default_decision(Decision::Allow);
        assert!(!deny.allowed);
    }
}
