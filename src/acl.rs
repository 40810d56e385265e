//! Per-instance access control lists.
//!
//! Every ACL has exactly one owner, who always holds an [`PermissionLevel::Owner`]
//! user entry. Expired entries are ignored by every check.

use crate::error::{Error, Result};
use crate::permission::Action;
use crate::types::{GroupId, PrincipalId, ResourceType, RoleId};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Totally ordered access level: `none < view < edit < manage < owner`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PermissionLevel {
    #[default]
    None,
    View,
    Edit,
    Manage,
    Owner,
}

impl PermissionLevel {
    /// Actions implied by the level when an entry lists none explicitly.
    pub const fn default_actions(&self) -> &'static [Action] {
        match self {
            PermissionLevel::None => &[],
            PermissionLevel::View => &[Action::Read, Action::List],
            PermissionLevel::Edit => &[Action::Read, Action::List, Action::Update],
            PermissionLevel::Manage => &[
                Action::Read,
                Action::List,
                Action::Update,
                Action::Delete,
                Action::Create,
            ],
            PermissionLevel::Owner => &[Action::All],
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::None => "none",
            PermissionLevel::View => "view",
            PermissionLevel::Edit => "edit",
            PermissionLevel::Manage => "manage",
            PermissionLevel::Owner => "owner",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn compare_permission_levels(left: PermissionLevel, right: PermissionLevel) -> Ordering {
    left.cmp(&right)
}

/// Who an ACL entry applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", content = "id", rename_all = "lowercase"))]
pub enum Grantee {
    User(PrincipalId),
    Role(RoleId),
    Group(GroupId),
    Everyone,
}

/// One grant inside an ACL.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ResourcePermission {
    pub grantee: Grantee,
    pub level: PermissionLevel,
    /// Overrides the level's default action set when present.
    pub actions: Option<Vec<Action>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_by: Option<PrincipalId>,
    pub granted_at: DateTime<Utc>,
}

impl ResourcePermission {
    pub fn new(grantee: Grantee, level: PermissionLevel) -> Self {
        Self {
            grantee,
            level,
            actions: None,
            expires_at: None,
            granted_by: None,
            granted_at: Utc::now(),
        }
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions = Some(actions.into_iter().collect());
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn granted_by(mut self, principal: PrincipalId) -> Self {
        self.granted_by = Some(principal);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn allows(&self, action: Action) -> bool {
        let actions = match &self.actions {
            Some(actions) => actions.as_slice(),
            None => self.level.default_actions(),
        };
        actions.iter().any(|granted| granted.covers(action))
    }
}

/// `(resource type, resource id)` key of an ACL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ResourceRef {
    pub resource_type: ResourceType,
    pub resource_id: String,
}

impl ResourceRef {
    pub fn new(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ResourceAcl {
    pub resource: ResourceRef,
    pub owner: PrincipalId,
    pub entries: Vec<ResourcePermission>,
    pub parent: Option<ResourceRef>,
    pub inherit_parent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceAcl {
    fn new(resource: ResourceRef, owner: PrincipalId) -> Self {
        let now = Utc::now();
        Self {
            resource,
            entries: vec![ResourcePermission::new(
                Grantee::User(owner.clone()),
                PermissionLevel::Owner,
            )],
            owner,
            parent: None,
            inherit_parent: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn upsert(&mut self, grant: ResourcePermission) {
        self.entries.retain(|entry| entry.grantee != grant.grantee);
        self.entries.push(grant);
        self.updated_at = Utc::now();
    }
}

/// Caller memberships and clock used by ACL checks.
#[derive(Debug, Clone, Default)]
pub struct AclContext {
    pub roles: Vec<RoleId>,
    pub groups: Vec<GroupId>,
    /// Evaluation time; `None` means now.
    pub now: Option<DateTime<Utc>>,
}

impl AclContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = RoleId>) -> Self {
        self.roles.extend(roles);
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = GroupId>) -> Self {
        self.groups.extend(groups);
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    fn clock(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }
}

/// Owns all ACLs and answers per-instance access questions.
#[derive(Debug, Clone, Default)]
pub struct ResourcePermissionManager {
    acls: HashMap<ResourceRef, ResourceAcl>,
}

impl ResourcePermissionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_acl(
        &mut self,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        owner: PrincipalId,
    ) -> Result<&ResourceAcl> {
        let key = ResourceRef::new(resource_type, resource_id);
        if self.acls.contains_key(&key) {
            return Err(Error::AclExists {
                resource_type: key.resource_type,
                resource_id: key.resource_id,
            });
        }
        tracing::debug!(resource = %key, owner = %owner, "created acl");
        Ok(self
            .acls
            .entry(key.clone())
            .or_insert_with(|| ResourceAcl::new(key, owner)))
    }

    pub fn get_acl(&self, resource_type: &ResourceType, resource_id: &str) -> Option<&ResourceAcl> {
        self.acls.get(&ResourceRef::new(resource_type.clone(), resource_id))
    }

    pub fn delete_acl(&mut self, resource_type: &ResourceType, resource_id: &str) -> Option<ResourceAcl> {
        self.acls.remove(&ResourceRef::new(resource_type.clone(), resource_id))
    }

    fn acl_mut(&mut self, resource_type: &ResourceType, resource_id: &str) -> Result<&mut ResourceAcl> {
        self.acls
            .get_mut(&ResourceRef::new(resource_type.clone(), resource_id))
            .ok_or_else(|| Error::AclNotFound {
                resource_type: resource_type.clone(),
                resource_id: resource_id.to_string(),
            })
    }

    /// Links a resource to its parent. With `inherit`, checks that find no
    /// matching entry fall through to the parent.
    pub fn set_parent(
        &mut self,
        resource_type: &ResourceType,
        resource_id: &str,
        parent: ResourceRef,
        inherit: bool,
    ) -> Result<()> {
        let acl = self.acl_mut(resource_type, resource_id)?;
        acl.parent = Some(parent);
        acl.inherit_parent = inherit;
        acl.updated_at = Utc::now();
        Ok(())
    }

    /// Adds a grant, replacing any existing grant for the same grantee.
    ///
    /// The owner's own entry cannot be replaced; use
    /// [`ResourcePermissionManager::transfer_ownership`].
    pub fn grant_permission(
        &mut self,
        resource_type: &ResourceType,
        resource_id: &str,
        grant: ResourcePermission,
    ) -> Result<()> {
        let acl = self.acl_mut(resource_type, resource_id)?;
        if grant.grantee == Grantee::User(acl.owner.clone()) {
            return Err(Error::OwnerEntryImmutable {
                resource_type: resource_type.clone(),
                resource_id: resource_id.to_string(),
            });
        }
        tracing::debug!(resource = %acl.resource, grantee = ?grant.grantee, level = %grant.level, "granted acl entry");
        acl.upsert(grant);
        Ok(())
    }

    /// Removes the grant for `grantee`. Returns false when none existed.
    pub fn revoke_permission(
        &mut self,
        resource_type: &ResourceType,
        resource_id: &str,
        grantee: &Grantee,
    ) -> Result<bool> {
        let acl = self.acl_mut(resource_type, resource_id)?;
        if *grantee == Grantee::User(acl.owner.clone()) {
            return Ok(false);
        }
        let before = acl.entries.len();
        acl.entries.retain(|entry| &entry.grantee != grantee);
        let removed = acl.entries.len() != before;
        if removed {
            acl.updated_at = Utc::now();
        }
        Ok(removed)
    }

    pub fn grant_public_access(
        &mut self,
        resource_type: &ResourceType,
        resource_id: &str,
        level: PermissionLevel,
    ) -> Result<()> {
        self.grant_permission(
            resource_type,
            resource_id,
            ResourcePermission::new(Grantee::Everyone, level),
        )
    }

    pub fn revoke_public_access(&mut self, resource_type: &ResourceType, resource_id: &str) -> Result<bool> {
        self.revoke_permission(resource_type, resource_id, &Grantee::Everyone)
    }

    /// Makes `new_owner` the owner and demotes the previous owner to manage.
    pub fn transfer_ownership(
        &mut self,
        resource_type: &ResourceType,
        resource_id: &str,
        new_owner: PrincipalId,
        current_owner: &PrincipalId,
    ) -> Result<()> {
        let acl = self.acl_mut(resource_type, resource_id)?;
        if &acl.owner != current_owner {
            return Err(Error::NotOwner {
                resource_type: resource_type.clone(),
                resource_id: resource_id.to_string(),
                principal: current_owner.to_string(),
            });
        }
        let previous = std::mem::replace(&mut acl.owner, new_owner.clone());
        acl.upsert(
            ResourcePermission::new(Grantee::User(previous.clone()), PermissionLevel::Manage)
                .granted_by(previous.clone()),
        );
        acl.upsert(
            ResourcePermission::new(Grantee::User(new_owner.clone()), PermissionLevel::Owner)
                .granted_by(previous.clone()),
        );
        tracing::debug!(resource = %acl.resource, from = %previous, to = %new_owner, "transferred ownership");
        Ok(())
    }

    pub fn list_grants(&self, resource_type: &ResourceType, resource_id: &str) -> &[ResourcePermission] {
        self.get_acl(resource_type, resource_id)
            .map_or(&[], |acl| acl.entries.as_slice())
    }

    /// Drops expired grants everywhere. Returns how many were removed.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for acl in self.acls.values_mut() {
            let before = acl.entries.len();
            acl.entries.retain(|entry| !entry.is_expired(now));
            removed += before - acl.entries.len();
        }
        removed
    }

    /// First matching tier decides: user, roles, groups, everyone, then the
    /// parent when inheritance is enabled.
    pub fn check_access(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
        user: &PrincipalId,
        action: Action,
        context: &AclContext,
    ) -> bool {
        let key = ResourceRef::new(resource_type.clone(), resource_id);
        let mut visited = HashSet::new();
        self.check_access_at(&key, user, action, context, context.clock(), &mut visited)
    }

    fn check_access_at(
        &self,
        key: &ResourceRef,
        user: &PrincipalId,
        action: Action,
        context: &AclContext,
        now: DateTime<Utc>,
        visited: &mut HashSet<ResourceRef>,
    ) -> bool {
        let Some(acl) = self.acls.get(key) else {
            return false;
        };
        if !visited.insert(key.clone()) {
            return false;
        }

        for tier in Tier::ORDER {
            let mut matched = acl
                .entries
                .iter()
                .filter(|entry| !entry.is_expired(now) && tier.matches(&entry.grantee, user, context))
                .peekable();
            if matched.peek().is_some() {
                return matched.any(|entry| entry.allows(action));
            }
        }

        match &acl.parent {
            Some(parent) if acl.inherit_parent => {
                self.check_access_at(parent, user, action, context, now, visited)
            }
            _ => false,
        }
    }

    /// Highest level across every applicable tier and inherited parents.
    pub fn get_effective_permission_level(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
        user: &PrincipalId,
        context: &AclContext,
    ) -> PermissionLevel {
        let key = ResourceRef::new(resource_type.clone(), resource_id);
        let mut visited = HashSet::new();
        self.level_at(&key, user, context, context.clock(), &mut visited)
    }

    fn level_at(
        &self,
        key: &ResourceRef,
        user: &PrincipalId,
        context: &AclContext,
        now: DateTime<Utc>,
        visited: &mut HashSet<ResourceRef>,
    ) -> PermissionLevel {
        let Some(acl) = self.acls.get(key) else {
            return PermissionLevel::None;
        };
        if !visited.insert(key.clone()) {
            return PermissionLevel::None;
        }

        let mut level = acl
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .filter(|entry| Tier::ORDER.iter().any(|tier| tier.matches(&entry.grantee, user, context)))
            .map(|entry| entry.level)
            .max()
            .unwrap_or_default();
        if &acl.owner == user {
            level = PermissionLevel::Owner;
        }
        if let Some(parent) = &acl.parent
            && acl.inherit_parent
        {
            level = level.max(self.level_at(parent, user, context, now, visited));
        }
        level
    }

    /// Resources where `user` holds at least view-level access, sorted.
    pub fn get_accessible_resources(
        &self,
        user: &PrincipalId,
        resource_type: Option<&ResourceType>,
        context: &AclContext,
    ) -> Vec<ResourceRef> {
        let now = context.clock();
        let mut accessible: Vec<ResourceRef> = self
            .acls
            .keys()
            .filter(|key| resource_type.is_none_or(|wanted| wanted.covers(&key.resource_type)))
            .filter(|key| {
                let mut visited = HashSet::new();
                self.level_at(key, user, context, now, &mut visited) > PermissionLevel::None
            })
            .cloned()
            .collect();
        accessible.sort();
        accessible
    }
}

#[derive(Clone, Copy)]
enum Tier {
    User,
    Role,
    Group,
    Everyone,
}

impl Tier {
    const ORDER: [Tier; 4] = [Tier::User, Tier::Role, Tier::Group, Tier::Everyone];

    fn matches(self, grantee: &Grantee, user: &PrincipalId, context: &AclContext) -> bool {
        match (self, grantee) {
            (Tier::User, Grantee::User(id)) => id == user,
            (Tier::Role, Grantee::Role(role)) => context.roles.contains(role),
            (Tier::Group, Grantee::Group(group)) => context.groups.contains(group),
            (Tier::Everyone, Grantee::Everyone) => true,
            _ => false,
        }
    }
}
