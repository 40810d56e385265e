use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rs_access::{
    AccessConfig, AccessEngine, AccessRequest, Action, AclContext, Attributes, CombiningAlgorithm,
    ConflictResolution, Decision, Grantee, GroupId, PermissionLevel, PermissionMatrix,
    PermissionMatrixEntry, Policy, PolicyEvaluator, PolicyId, PrincipalId, RequestContext, Resource,
    ResourcePermission, ResourcePermissionManager, ResourceType, RoleDefinition, RoleId, Subject,
    compare_permission_levels,
};
use serde_json::json;
use std::cmp::Ordering;
use std::time::Duration;

fn role(value: &str) -> RoleId {
    RoleId::try_from(value).unwrap()
}

fn user(value: &str) -> PrincipalId {
    PrincipalId::try_from(value).unwrap()
}

fn kind(value: &str) -> ResourceType {
    ResourceType::try_from(value).unwrap()
}

fn policy_id(value: &str) -> PolicyId {
    PolicyId::try_from(value).unwrap()
}

fn attributes(value: serde_json::Value) -> Attributes {
    value.as_object().cloned().unwrap_or_default()
}

#[test]
fn admin_wildcard_grants_any_permission() {
    let engine = AccessEngine::new(
        AccessConfig::builder()
            .role(RoleDefinition::new(role("admin")).with_permissions(["*"]).unwrap())
            .build(),
    );
    let session = engine.set_user_context([role("admin")], Attributes::new());
    assert!(session.has_permission("documents:delete"));
    assert!(session.has_permission("billing:export:org"));
}

#[test]
fn matrix_conflicts_follow_configured_resolution() {
    let entries = [
        PermissionMatrixEntry::new(role("editor"), kind("documents")).allow([Action::Delete]),
        PermissionMatrixEntry::new(role("auditor"), kind("documents")).deny([Action::Delete]),
    ];
    let decide = |resolution: ConflictResolution| {
        let mut builder = PermissionMatrix::builder().conflict_resolution(resolution);
        for entry in entries.iter().cloned() {
            builder = builder.add_entry(entry);
        }
        let engine = AccessEngine::new(
            AccessConfig::builder()
                .role(RoleDefinition::new(role("editor")).with_priority(1))
                .role(RoleDefinition::new(role("auditor")).with_priority(5))
                .permission_matrix(builder.build())
                .build(),
        );
        let session = engine.set_user_context([role("editor"), role("auditor")], Attributes::new());
        let request = AccessRequest::new(
            session.subject(),
            Resource::new(kind("documents")),
            Action::Delete,
        );
        session.evaluate(&request).allowed
    };

    assert!(!decide(ConflictResolution::DenyWins));
    assert!(decide(ConflictResolution::AllowWins));
    assert!(!decide(ConflictResolution::Priority));
}

#[test]
fn combining_algorithms_over_prioritised_policies() {
    let request = AccessRequest::new(
        Subject::new(user("u1")),
        Resource::new(kind("documents")),
        Action::Read,
    );
    let decide = |algorithm: CombiningAlgorithm| {
        let mut evaluator = PolicyEvaluator::new().with_combining_algorithm(algorithm);
        evaluator.add_policy(Policy::allow(policy_id("allow")).with_priority(5));
        evaluator.add_policy(Policy::deny(policy_id("deny")).with_priority(10));
        evaluator.evaluate(&request).decision
    };

    assert_eq!(decide(CombiningAlgorithm::DenyOverrides), Decision::Deny);
    assert_eq!(decide(CombiningAlgorithm::FirstApplicable), Decision::Deny);
    assert_eq!(decide(CombiningAlgorithm::PermitOverrides), Decision::Allow);
}

#[test]
fn acl_ownership_transfer_demotes_previous_owner() {
    let mut acls = ResourcePermissionManager::new();
    let documents = kind("documents");
    acls.create_acl(documents.clone(), "doc-1", user("u1")).unwrap();
    acls.transfer_ownership(&documents, "doc-1", user("u2"), &user("u1"))
        .unwrap();

    let context = AclContext::new();
    assert_eq!(
        acls.get_effective_permission_level(&documents, "doc-1", &user("u2"), &context),
        PermissionLevel::Owner
    );
    assert_eq!(
        acls.get_effective_permission_level(&documents, "doc-1", &user("u1"), &context),
        PermissionLevel::Manage
    );
}

#[test]
fn acl_expired_grant_is_ignored() {
    let mut acls = ResourcePermissionManager::new();
    let documents = kind("documents");
    acls.create_acl(documents.clone(), "doc-1", user("u1")).unwrap();
    acls.grant_permission(
        &documents,
        "doc-1",
        ResourcePermission::new(Grantee::User(user("u3")), PermissionLevel::Edit)
            .expires_at(Utc::now() - ChronoDuration::hours(1)),
    )
    .unwrap();

    assert!(!acls.check_access(&documents, "doc-1", &user("u3"), Action::Update, &AclContext::new()));
    assert_eq!(acls.prune_expired(Utc::now()), 1);
}

#[test]
fn acl_effective_level_is_maximum_across_entries() {
    assert_eq!(
        compare_permission_levels(PermissionLevel::Owner, PermissionLevel::View),
        Ordering::Greater
    );

    let mut acls = ResourcePermissionManager::new();
    let projects = kind("projects");
    acls.create_acl(projects.clone(), "p1", user("owner")).unwrap();
    acls.grant_permission(
        &projects,
        "p1",
        ResourcePermission::new(Grantee::User(user("u4")), PermissionLevel::View),
    )
    .unwrap();
    acls.grant_permission(
        &projects,
        "p1",
        ResourcePermission::new(Grantee::Role(role("lead")), PermissionLevel::Manage),
    )
    .unwrap();
    acls.grant_permission(
        &projects,
        "p1",
        ResourcePermission::new(Grantee::Group(GroupId::try_from("qa").unwrap()), PermissionLevel::Edit),
    )
    .unwrap();

    let context = AclContext::new()
        .with_roles([role("lead")])
        .with_groups([GroupId::try_from("qa").unwrap()]);
    assert_eq!(
        acls.get_effective_permission_level(&projects, "p1", &user("u4"), &context),
        PermissionLevel::Manage
    );
    // the user tier decides access before the role tier is consulted
    assert!(!acls.check_access(&projects, "p1", &user("u4"), Action::Update, &context));
    assert!(acls.check_access(&projects, "p1", &user("u5"), Action::Delete, &context));
}

#[test]
fn layered_evaluation_with_scoped_fallback() {
    let matrix = PermissionMatrix::builder()
        .add_entry(PermissionMatrixEntry::new(role("contractor"), kind("payroll")).deny([Action::All]))
        .build();
    let engine = AccessEngine::new(
        AccessConfig::builder()
            .role(
                RoleDefinition::new(role("member"))
                    .with_permissions(["tickets:read:team", "tickets:update:own"])
                    .unwrap(),
            )
            .role(RoleDefinition::new(role("contractor")).inherits([role("member")]))
            .permission_matrix(matrix)
            .cache_ttl(Duration::ZERO)
            .build(),
    );
    let session = engine.set_user_context(
        [role("contractor")],
        attributes(json!({"id": "c1", "teamId": "blue"})),
    );

    let ticket = |owner: &str, team: &str| {
        Resource::new(kind("tickets"))
            .with_id("t1")
            .with_attribute("ownerId", owner)
            .with_attribute("teamId", team)
    };
    let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    let evaluate = |resource: Resource, action: Action| {
        let request = AccessRequest::new(session.subject(), resource, action)
            .with_context(RequestContext::at(at));
        session.evaluate(&request)
    };

    assert!(evaluate(ticket("c1", "blue"), Action::Update).allowed);
    assert!(!evaluate(ticket("someone", "blue"), Action::Update).allowed);
    assert!(evaluate(ticket("someone", "blue"), Action::Read).allowed);
    assert!(!evaluate(ticket("someone", "red"), Action::Read).allowed);

    let payroll = evaluate(Resource::new(kind("payroll")), Action::Read);
    assert_eq!(payroll.decision, Decision::Deny);
    assert_eq!(payroll.evaluated_at, at);
}

#[test]
fn repeated_evaluation_is_identical() {
    let engine = AccessEngine::new(
        AccessConfig::builder()
            .role(RoleDefinition::new(role("viewer")).with_permissions(["documents:read"]).unwrap())
            .build(),
    );
    let session = engine.set_user_context([role("viewer")], Attributes::new());
    let request = AccessRequest::new(session.subject(), Resource::new(kind("documents")), Action::Read);

    let mut first = session.evaluate(&request);
    let mut second = session.evaluate(&request);
    first.evaluation_time = None;
    second.evaluation_time = None;
    assert_eq!(first, second);
}
