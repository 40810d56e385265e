use crate::types::ResourceType;
use thiserror::Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
///
/// Evaluation never fails with an error. These variants cover eager parsing of
/// configuration strings and misuse of the mutating APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Invalid permission input.
    #[error("invalid permission: {0}")]
    InvalidPermission(String),
    /// Unknown action name.
    #[error("invalid action: {0}")]
    InvalidAction(String),
    /// Unknown scope name.
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    /// Pattern rejected by the matcher limits.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    /// Role is not registered in the hierarchy.
    #[error("unknown role: {0}")]
    UnknownRole(String),
    /// Policy set is not registered in the evaluator.
    #[error("unknown policy set: {0}")]
    UnknownPolicySet(String),
    /// No ACL exists for the resource.
    #[error("no acl for resource {resource_type}/{resource_id}")]
    AclNotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    /// An ACL already exists for the resource.
    #[error("acl already exists for resource {resource_type}/{resource_id}")]
    AclExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    /// Caller is not the current owner of the resource.
    #[error("{principal} is not the owner of {resource_type}/{resource_id}")]
    NotOwner {
        resource_type: ResourceType,
        resource_id: String,
        principal: String,
    },
    /// The owner's entry can only change through an ownership transfer.
    #[error("owner entry of {resource_type}/{resource_id} changes only by ownership transfer")]
    OwnerEntryImmutable {
        resource_type: ResourceType,
        resource_id: String,
    },
}
