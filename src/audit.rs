//! Audit events for access decisions.
//!
//! Handlers run synchronously on the evaluating thread. A failing or panicking
//! handler is logged and skipped; it never changes the decision.

use crate::permission::Action;
use crate::request::{AccessRequest, EvaluationResult, SubjectKind};
use crate::types::{PrincipalId, ResourceType};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

pub type AuditError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AuditEventType {
    /// Access to a resource was granted.
    AccessGranted,
    /// Access to a resource was denied.
    AccessDenied,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditEventType::AccessGranted => "access_granted",
            AuditEventType::AccessDenied => "access_denied",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum AuditOutcome {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AuditSubject {
    pub id: PrincipalId,
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub kind: SubjectKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AuditResource {
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub resource_type: ResourceType,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub id: Option<String>,
}

/// A recorded access decision.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub event_type: AuditEventType,
    pub subject: AuditSubject,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub resource: Option<AuditResource>,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub action: Option<Action>,
    pub result: AuditOutcome,
    pub reason: String,
}

impl AuditEvent {
    /// Builds the event for a finished evaluation, stamped with `emitted_at`
    /// rather than the time the decision was first computed.
    pub fn for_decision(
        request: &AccessRequest,
        result: &EvaluationResult,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        let (event_type, outcome) = if result.allowed {
            (AuditEventType::AccessGranted, AuditOutcome::Allowed)
        } else {
            (AuditEventType::AccessDenied, AuditOutcome::Denied)
        };
        Self {
            id: Uuid::new_v4(),
            timestamp: emitted_at,
            event_type,
            subject: AuditSubject {
                id: request.subject.id.clone(),
                kind: request.subject.kind,
            },
            resource: Some(AuditResource {
                resource_type: request.resource.resource_type.clone(),
                id: request.resource.id.clone(),
            }),
            action: Some(request.action),
            result: outcome,
            reason: result.reason.clone(),
        }
    }
}

/// Sink for audit events.
pub trait AuditHandler: Send + Sync {
    fn handle(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

impl<F> AuditHandler for F
where
    F: Fn(&AuditEvent) + Send + Sync,
{
    fn handle(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self(event);
        Ok(())
    }
}

/// Handle returned by [`AuditHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuditSubscription(u64);

/// Registry of audit handlers.
#[derive(Default)]
pub struct AuditHub {
    handlers: RwLock<Vec<(AuditSubscription, Arc<dyn AuditHandler>)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for AuditHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditHub")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl AuditHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn AuditHandler>) -> AuditSubscription {
        let subscription = AuditSubscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((subscription, handler));
        subscription
    }

    pub fn unsubscribe(&self, subscription: AuditSubscription) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != subscription);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers an event to every handler.
    pub fn emit(&self, event: &AuditEvent) {
        // Snapshot so handlers may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<Arc<dyn AuditHandler>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(event_id = %event.id, %error, "audit handler failed");
                }
                Err(_) => {
                    tracing::warn!(event_id = %event.id, "audit handler panicked");
                }
            }
        }
    }
}
