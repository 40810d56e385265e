use crate::error::{Error, Result};
use crate::types::ResourceType;
use std::fmt;
use std::str::FromStr;

/// Closed set of actions a permission can name.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    List,
    Manage,
    Execute,
    Approve,
    Share,
    Export,
    Import,
    /// The `*` wildcard.
    #[cfg_attr(feature = "serde", serde(rename = "*"))]
    All,
}

impl Action {
    /// Create, read, update and delete.
    pub const CRUD: [Action; 4] = [Action::Create, Action::Read, Action::Update, Action::Delete];

    /// Read and list.
    pub const READ_ONLY: [Action; 2] = [Action::Read, Action::List];

    /// Every concrete (non-wildcard) action.
    pub const CONCRETE: [Action; 11] = [
        Action::Create,
        Action::Read,
        Action::Update,
        Action::Delete,
        Action::List,
        Action::Manage,
        Action::Execute,
        Action::Approve,
        Action::Share,
        Action::Export,
        Action::Import,
    ];

    /// Returns the canonical lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::List => "list",
            Action::Manage => "manage",
            Action::Execute => "execute",
            Action::Approve => "approve",
            Action::Share => "share",
            Action::Export => "export",
            Action::Import => "import",
            Action::All => "*",
        }
    }

    /// Returns true when this (possibly wildcard) action covers `requested`.
    pub fn covers(&self, requested: Action) -> bool {
        *self == Action::All || *self == requested
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized == "*" {
            return Ok(Action::All);
        }
        Action::CONCRETE
            .into_iter()
            .find(|action| action.as_str() == normalized)
            .ok_or_else(|| Error::InvalidAction(value.to_string()))
    }
}

impl TryFrom<&str> for Action {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        value.parse()
    }
}

/// Breadth of a permission, ordered from narrowest to widest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Scope {
    Own,
    Team,
    Org,
    Global,
}

impl Scope {
    /// Returns the canonical lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Scope::Own => "own",
            Scope::Team => "team",
            Scope::Org => "org",
            Scope::Global => "global",
        }
    }

    /// Returns true when a grant at this scope satisfies a request at `requested`.
    pub fn covers(&self, requested: Scope) -> bool {
        *self >= requested
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "own" => Ok(Scope::Own),
            "team" => Ok(Scope::Team),
            "org" => Ok(Scope::Org),
            "global" => Ok(Scope::Global),
            _ => Err(Error::InvalidScope(value.to_string())),
        }
    }
}

/// Structured permission parsed from `resource:action[:scope]` or `*`.
///
/// An unscoped permission behaves as [`Scope::Global`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct Permission {
    resource: ResourceType,
    action: Action,
    scope: Option<Scope>,
}

impl Permission {
    /// Parses and validates a permission string.
    ///
    /// This trims whitespace and normalizes to lowercase.
    pub fn new(value: impl AsRef<str>) -> Result<Self> {
        let normalized = value.as_ref().trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(Error::InvalidPermission(
                "permission must not be empty".to_string(),
            ));
        }
        if normalized == "*" {
            return Ok(Self::any());
        }

        let segments: Vec<&str> = normalized.split(':').collect();
        let (resource, action, scope) = match segments.as_slice() {
            [resource, action] => (*resource, *action, None),
            [resource, action, scope] => (*resource, *action, Some(*scope)),
            _ => {
                return Err(Error::InvalidPermission(format!(
                    "{normalized}: permission must be in resource:action[:scope] format"
                )));
            }
        };
        if resource.is_empty() || action.is_empty() {
            return Err(Error::InvalidPermission(
                "permission must not have empty segments".to_string(),
            ));
        }
        if !is_valid_segment(resource) {
            return Err(Error::InvalidPermission(format!(
                "{normalized}: resource segment contains invalid characters"
            )));
        }

        Ok(Self {
            resource: ResourceType::from_string(resource.to_string()),
            action: action.parse()?,
            scope: scope.map(str::parse).transpose()?,
        })
    }

    /// Builds a permission from already-typed parts.
    pub fn from_parts(resource: ResourceType, action: Action, scope: Option<Scope>) -> Self {
        Self {
            resource,
            action,
            scope,
        }
    }

    /// The `*` permission, covering every resource and action.
    pub fn any() -> Self {
        Self::from_parts(ResourceType::any(), Action::All, None)
    }

    pub fn resource(&self) -> &ResourceType {
        &self.resource
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn scope(&self) -> Option<Scope> {
        self.scope
    }

    /// Scope this grant reaches, with unscoped grants treated as global.
    pub fn effective_scope(&self) -> Scope {
        self.scope.unwrap_or(Scope::Global)
    }

    /// Returns true when this is `*` or `*:*`.
    pub fn is_full_wildcard(&self) -> bool {
        self.resource.is_wildcard() && self.action == Action::All
    }

    /// Positional wildcard match on resource and action, ignoring scope.
    pub fn covers(&self, resource: &ResourceType, action: Action) -> bool {
        self.resource.covers(resource) && self.action.covers(action)
    }

    /// Returns true when holding `self` grants `required`, scope included.
    pub fn implies(&self, required: &Permission) -> bool {
        self.resource.covers(&required.resource)
            && (self.action == Action::All || self.action == required.action)
            && self.effective_scope().covers(required.effective_scope())
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full_wildcard() && self.scope.is_none() {
            return f.write_str("*");
        }
        write!(f, "{}:{}", self.resource, self.action)?;
        if let Some(scope) = self.scope {
            write!(f, ":{scope}")?;
        }
        Ok(())
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Permission {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for Permission {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.to_string()
    }
}

fn is_valid_segment(segment: &str) -> bool {
    if segment == "*" {
        return true;
    }
    segment
        .chars()
        .all(|ch| matches!(ch, 'a'..='z' | '0'..='9' | '_' | '-' | '.'))
}
