//! Interfaces to the systems around the engine
//!
//! - [`IdentityLookup`] confirms a beneficiary exists before create/join
//! - [`Notifier`] and [`AuditSink`] receive committed events, best effort
//!
//! Notifier and audit failures never roll back or fail an engine operation;
//! [`Dispatcher`] logs and swallows them.

use crate::events::{EngineEvent, Role};
use crate::types::BeneficiaryRef;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Collaborator failure
#[derive(Error, Debug)]
pub enum CollaboratorError {
    /// Remote side unavailable
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// Remote side rejected the call
    #[error("Collaborator rejected call: {0}")]
    Rejected(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Resolves beneficiary references
pub trait IdentityLookup: Send + Sync {
    /// Whether the beneficiary exists
    fn exists(&self, beneficiary: &BeneficiaryRef) -> Result<bool, CollaboratorError>;
}

/// Fan-out to role holders
pub trait Notifier: Send + Sync {
    /// Deliver `event` to everyone holding one of `roles`
    fn notify_role_set(&self, roles: &[Role], event: &EngineEvent) -> Result<(), CollaboratorError>;
}

/// Append-only audit trail
pub trait AuditSink: Send + Sync {
    /// Append one entry
    fn append(&self, entry: &AuditEntry) -> Result<(), CollaboratorError>;
}

/// Audit record for a committed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Service that produced the entry
    pub service: String,
    /// Event name
    pub action: String,
    /// Commit time
    pub recorded_at: DateTime<Utc>,
    /// Full event
    pub event: EngineEvent,
}

/// In-memory beneficiary directory
#[derive(Debug, Default)]
pub struct Directory {
    known: DashSet<BeneficiaryRef>,
}

impl Directory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a beneficiary
    pub fn register(&self, beneficiary: BeneficiaryRef) {
        self.known.insert(beneficiary);
    }

    /// Forget a beneficiary
    pub fn remove(&self, beneficiary: &BeneficiaryRef) {
        self.known.remove(beneficiary);
    }
}

impl IdentityLookup for Directory {
    fn exists(&self, beneficiary: &BeneficiaryRef) -> Result<bool, CollaboratorError> {
        Ok(self.known.contains(beneficiary))
    }
}

/// Notifier that writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_role_set(
        &self,
        roles: &[Role],
        event: &EngineEvent,
    ) -> Result<(), CollaboratorError> {
        let payload = serde_json::to_string(event)?;
        tracing::info!(event = event.name(), roles = ?roles, %payload, "Notification");
        Ok(())
    }
}

/// Audit sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudit;

impl AuditSink for NullAudit {
    fn append(&self, _entry: &AuditEntry) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Post-commit delivery to notifier and audit sink
#[derive(Clone)]
pub struct Dispatcher {
    service: String,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("service", &self.service).finish()
    }
}

impl Dispatcher {
    /// Create dispatcher
    pub fn new(
        service: impl Into<String>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            service: service.into(),
            notifier,
            audit,
        }
    }

    /// Deliver committed events; failures are logged, never returned
    pub fn dispatch(&self, events: &[EngineEvent], committed_at: DateTime<Utc>) {
        for event in events {
            if let Err(e) = self.notifier.notify_role_set(event.audience(), event) {
                tracing::warn!(event = event.name(), error = %e, "Notification failed");
            }

            let entry = AuditEntry {
                service: self.service.clone(),
                action: event.name().to_string(),
                recorded_at: committed_at,
                event: event.clone(),
            };
            if let Err(e) = self.audit.append(&entry) {
                tracing::warn!(event = event.name(), error = %e, "Audit append failed");
            }
        }
    }
}
