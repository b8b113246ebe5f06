//! Audit sink boundary.
//!
//! The core only emits records; retention and querying belong to the
//! external audit collaborator.

use crate::types::{ActorId, ActorRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// One financial-permission decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub viewer_id: ActorId,
    pub viewer_role: ActorRole,
    pub permission: String,
    pub resource_id: String,
    pub resource_type: String,
    pub granted: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        viewer_id: ActorId,
        viewer_role: ActorRole,
        permission: impl Into<String>,
        resource_id: impl Into<String>,
        resource_type: impl Into<String>,
        granted: bool,
    ) -> Self {
        Self {
            viewer_id,
            viewer_role,
            permission: permission.into(),
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            granted,
            timestamp: Utc::now(),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Collects records in memory; the standard test double.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

/// Forwards records to the process log stream.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        tracing::info!(
            viewer = %record.viewer_id,
            role = record.viewer_role.label(),
            permission = %record.permission,
            resource = %record.resource_id,
            resource_type = %record.resource_type,
            granted = record.granted,
            "financial permission evaluated"
        );
    }
}
