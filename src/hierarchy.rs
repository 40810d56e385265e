//! Role inheritance resolution.
//!
//! Roles form a directed graph over their `inherits` edges. Every traversal
//! goes through [`RoleHierarchy::traverse`], which never re-expands a node and
//! records back edges as cycles, so resolution terminates on any input.

use crate::error::{Error, Result};
use crate::permission::{Action, Permission, Scope};
use crate::types::{ResourceType, RoleId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Permission declared as a resource plus a list of actions.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StructuredPermission {
    pub resource: ResourceType,
    pub actions: Vec<Action>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scope: Option<Scope>,
}

impl StructuredPermission {
    pub fn new(resource: ResourceType, actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            resource,
            actions: actions.into_iter().collect(),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Flattens into one [`Permission`] per action.
    pub fn expand(&self) -> impl Iterator<Item = Permission> + '_ {
        self.actions
            .iter()
            .map(|action| Permission::from_parts(self.resource.clone(), *action, self.scope))
    }
}

/// A named bundle of permissions that may inherit from other roles.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RoleDefinition {
    pub id: RoleId,
    #[cfg_attr(feature = "serde", serde(default))]
    pub permissions: HashSet<Permission>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub structured_permissions: Vec<StructuredPermission>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub inherits: Vec<RoleId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub priority: i32,
    #[cfg_attr(feature = "serde", serde(default = "default_active"))]
    pub is_active: bool,
}

#[cfg(feature = "serde")]
fn default_active() -> bool {
    true
}

impl RoleDefinition {
    pub fn new(id: RoleId) -> Self {
        Self {
            id,
            permissions: HashSet::new(),
            structured_permissions: Vec::new(),
            inherits: Vec::new(),
            priority: 0,
            is_active: true,
        }
    }

    /// Parses and adds flat permission strings.
    pub fn with_permissions<I, P>(mut self, permissions: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        for permission in permissions {
            self.permissions.insert(Permission::new(permission)?);
        }
        Ok(self)
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    pub fn with_structured(mut self, permission: StructuredPermission) -> Self {
        self.structured_permissions.push(permission);
        self
    }

    pub fn inherits(mut self, parents: impl IntoIterator<Item = RoleId>) -> Self {
        self.inherits.extend(parents);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    /// Flat and structured permissions declared directly on this role.
    pub fn direct_permissions(&self) -> impl Iterator<Item = Permission> + '_ {
        self.permissions
            .iter()
            .cloned()
            .chain(self.structured_permissions.iter().flat_map(|p| p.expand()))
    }
}

#[derive(Debug, Default)]
struct HierarchyCache {
    ancestors: HashMap<RoleId, Vec<RoleId>>,
    permissions: HashMap<RoleId, HashSet<Permission>>,
    levels: HashMap<RoleId, usize>,
}

struct Traversal {
    /// Visited roles in pre-order, starting with the root.
    order: Vec<RoleId>,
    /// Each back edge as the path that closes it, e.g. `[a, b, a]`.
    cycles: Vec<Vec<RoleId>>,
}

/// Index of roles with cached inheritance lookups.
#[derive(Debug, Default)]
pub struct RoleHierarchy {
    roles: HashMap<RoleId, RoleDefinition>,
    order: Vec<RoleId>,
    duplicates: Vec<RoleId>,
    cache: Mutex<HierarchyCache>,
}

impl Clone for RoleHierarchy {
    fn clone(&self) -> Self {
        Self {
            roles: self.roles.clone(),
            order: self.order.clone(),
            duplicates: self.duplicates.clone(),
            cache: Mutex::new(HierarchyCache::default()),
        }
    }
}

impl RoleHierarchy {
    pub fn new(roles: impl IntoIterator<Item = RoleDefinition>) -> Self {
        let mut hierarchy = Self::default();
        for role in roles {
            hierarchy.add_role(role);
        }
        hierarchy
    }

    /// Adds a role. A repeated id replaces the earlier definition and is
    /// reported by [`RoleHierarchy::validate`].
    pub fn add_role(&mut self, role: RoleDefinition) {
        if self.roles.contains_key(&role.id) {
            self.duplicates.push(role.id.clone());
        } else {
            self.order.push(role.id.clone());
        }
        self.roles.insert(role.id.clone(), role);
        self.invalidate();
    }

    pub fn remove_role(&mut self, id: &RoleId) -> Option<RoleDefinition> {
        let removed = self.roles.remove(id)?;
        self.order.retain(|existing| existing != id);
        self.duplicates.retain(|existing| existing != id);
        self.invalidate();
        Some(removed)
    }

    pub fn update_role(&mut self, id: &RoleId, update: impl FnOnce(&mut RoleDefinition)) -> Result<()> {
        let role = self
            .roles
            .get_mut(id)
            .ok_or_else(|| Error::UnknownRole(id.to_string()))?;
        update(role);
        role.id = id.clone();
        self.invalidate();
        Ok(())
    }

    fn invalidate(&mut self) {
        let cache = self.cache.get_mut();
        cache.ancestors.clear();
        cache.permissions.clear();
        cache.levels.clear();
    }

    pub fn role(&self, id: &RoleId) -> Option<&RoleDefinition> {
        self.roles.get(id)
    }

    /// Roles in insertion order.
    pub fn roles(&self) -> impl Iterator<Item = &RoleDefinition> {
        self.order.iter().filter_map(|id| self.roles.get(id))
    }

    pub fn contains(&self, id: &RoleId) -> bool {
        self.roles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn priority(&self, id: &RoleId) -> i32 {
        self.roles.get(id).map_or(0, |role| role.priority)
    }

    fn traverse<F>(&self, start: &RoleId, edges: F) -> Traversal
    where
        F: Fn(&RoleId) -> Vec<RoleId>,
    {
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();
        let mut order = vec![start.clone()];
        let mut cycles = Vec::new();

        visiting.insert(start.clone());
        let mut stack: Vec<(RoleId, std::vec::IntoIter<RoleId>)> =
            vec![(start.clone(), edges(start).into_iter())];

        while let Some((current, mut iter)) = stack.pop() {
            if let Some(next) = iter.next() {
                stack.push((current, iter));

                if visiting.contains(&next) {
                    let mut path: Vec<RoleId> = stack
                        .iter()
                        .map(|(node, _)| node.clone())
                        .skip_while(|node| node != &next)
                        .collect();
                    path.push(next);
                    cycles.push(path);
                    continue;
                }
                if visited.contains(&next) {
                    continue;
                }

                visiting.insert(next.clone());
                order.push(next.clone());
                let children = edges(&next);
                stack.push((next, children.into_iter()));
                continue;
            }

            visiting.remove(&current);
            visited.insert(current);
        }

        Traversal { order, cycles }
    }

    fn parents_of(&self, id: &RoleId) -> Vec<RoleId> {
        self.roles
            .get(id)
            .map(|role| {
                role.inherits
                    .iter()
                    .filter(|parent| self.roles.contains_key(*parent))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn active_parents_of(&self, id: &RoleId) -> Vec<RoleId> {
        self.parents_of(id)
            .into_iter()
            .filter(|parent| self.roles.get(parent).is_some_and(|role| role.is_active))
            .collect()
    }

    fn children_of(&self, id: &RoleId) -> Vec<RoleId> {
        self.roles()
            .filter(|role| role.inherits.contains(id))
            .map(|role| role.id.clone())
            .collect()
    }

    /// Every role `id` inherits from, transitively. Excludes `id` itself.
    pub fn get_ancestors(&self, id: &RoleId) -> Vec<RoleId> {
        if !self.roles.contains_key(id) {
            return Vec::new();
        }
        if let Some(cached) = self.cache.lock().ancestors.get(id) {
            return cached.clone();
        }
        let mut ancestors = self.traverse(id, |role| self.parents_of(role)).order;
        ancestors.remove(0);
        self.cache
            .lock()
            .ancestors
            .insert(id.clone(), ancestors.clone());
        ancestors
    }

    /// Every role that inherits from `id`, transitively. Excludes `id` itself.
    pub fn get_descendants(&self, id: &RoleId) -> Vec<RoleId> {
        if !self.roles.contains_key(id) {
            return Vec::new();
        }
        let mut descendants = self.traverse(id, |role| self.children_of(role)).order;
        descendants.remove(0);
        descendants
    }

    /// Active roles among `roles` plus every active role they inherit from,
    /// in discovery order without duplicates.
    pub fn active_closure<'a>(&self, roles: impl IntoIterator<Item = &'a RoleId>) -> Vec<RoleId> {
        let mut seen = HashSet::new();
        let mut closure = Vec::new();
        for id in roles {
            if !self.roles.get(id).is_some_and(|role| role.is_active) {
                continue;
            }
            for role in self.traverse(id, |role| self.active_parents_of(role)).order {
                if seen.insert(role.clone()) {
                    closure.push(role);
                }
            }
        }
        closure
    }

    /// Own and inherited permissions of an active role.
    ///
    /// Inactive roles contribute nothing and are not traversed.
    pub fn get_effective_permissions(&self, id: &RoleId) -> HashSet<Permission> {
        if !self.roles.get(id).is_some_and(|role| role.is_active) {
            return HashSet::new();
        }
        if let Some(cached) = self.cache.lock().permissions.get(id) {
            return cached.clone();
        }

        let traversal = self.traverse(id, |role| self.active_parents_of(role));
        if !traversal.cycles.is_empty() {
            tracing::warn!(role = %id, "inheritance cycle encountered while resolving permissions");
        }
        let permissions: HashSet<Permission> = traversal
            .order
            .iter()
            .filter_map(|role| self.roles.get(role))
            .flat_map(RoleDefinition::direct_permissions)
            .collect();

        self.cache
            .lock()
            .permissions
            .insert(id.clone(), permissions.clone());
        permissions
    }

    /// Union of effective permissions across `roles`; unknown roles are ignored.
    pub fn resolve_permissions<'a>(
        &self,
        roles: impl IntoIterator<Item = &'a RoleId>,
    ) -> HashSet<Permission> {
        let mut resolved = HashSet::new();
        for role in roles {
            resolved.extend(self.get_effective_permissions(role));
        }
        resolved
    }

    pub fn has_permission(&self, id: &RoleId, required: &Permission) -> bool {
        self.get_effective_permissions(id)
            .iter()
            .any(|granted| granted.implies(required))
    }

    /// Distance from the root: 0 for roles without parents.
    pub fn role_level(&self, id: &RoleId) -> Option<usize> {
        if !self.roles.contains_key(id) {
            return None;
        }
        let mut cache = self.cache.lock();
        let mut visiting = HashSet::new();
        Some(self.level_of(id, &mut cache.levels, &mut visiting))
    }

    fn level_of(
        &self,
        id: &RoleId,
        levels: &mut HashMap<RoleId, usize>,
        visiting: &mut HashSet<RoleId>,
    ) -> usize {
        if let Some(level) = levels.get(id) {
            return *level;
        }
        visiting.insert(id.clone());
        let mut level = 0;
        for parent in self.parents_of(id) {
            if visiting.contains(&parent) {
                continue;
            }
            level = level.max(1 + self.level_of(&parent, levels, visiting));
        }
        visiting.remove(id);
        levels.insert(id.clone(), level);
        level
    }

    pub fn roles_at_level(&self, level: usize) -> Vec<RoleId> {
        self.order
            .iter()
            .filter(|id| self.role_level(id) == Some(level))
            .cloned()
            .collect()
    }

    /// Highest-priority active role among `roles`; ties keep the first.
    pub fn highest_priority_role<'a>(
        &self,
        roles: impl IntoIterator<Item = &'a RoleId>,
    ) -> Option<&RoleDefinition> {
        let mut best: Option<&RoleDefinition> = None;
        for role in roles.into_iter().filter_map(|id| self.roles.get(id)) {
            if !role.is_active {
                continue;
            }
            if best.is_none_or(|current| role.priority > current.priority) {
                best = Some(role);
            }
        }
        best
    }

    /// Reports every distinct inheritance cycle as `a -> b -> a`.
    pub fn detect_cycles(&self) -> Vec<String> {
        let mut seen: HashSet<Vec<RoleId>> = HashSet::new();
        let mut reports = Vec::new();
        for id in &self.order {
            for cycle in self.traverse(id, |role| self.parents_of(role)).cycles {
                if seen.insert(canonical_cycle(&cycle)) {
                    let path: Vec<&str> = cycle.iter().map(RoleId::as_str).collect();
                    reports.push(path.join(" -> "));
                }
            }
        }
        reports
    }

    /// Configuration problems: duplicate ids, missing parents and cycles.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for id in &self.duplicates {
            errors.push(format!("duplicate role id: {id}"));
        }
        for role in self.roles() {
            for parent in &role.inherits {
                if !self.roles.contains_key(parent) {
                    errors.push(format!(
                        "role '{}' inherits from unknown role '{parent}'",
                        role.id
                    ));
                }
            }
        }
        for cycle in self.detect_cycles() {
            errors.push(format!("inheritance cycle detected: {cycle}"));
        }
        errors
    }
}

/// Rotates a closed path so the smallest id comes first, dropping the repeat.
fn canonical_cycle(cycle: &[RoleId]) -> Vec<RoleId> {
    let open = &cycle[..cycle.len().saturating_sub(1)];
    let Some(start) = open
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(index, _)| index)
    else {
        return Vec::new();
    };
    open[start..].iter().chain(&open[..start]).cloned().collect()
}
