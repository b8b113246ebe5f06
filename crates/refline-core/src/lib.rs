//! Refline brokerage core.
//!
//! Hierarchy-aware authorization and pricing for a five-role outsourced-work
//! brokerage: recruitment by single-purpose reference codes, a strict
//! role/level tree with bounded traversals, tiered deterministic pricing in
//! minor units, lossless fee distribution, and audited financial-field
//! redaction. Storage and delivery sit behind traits; this crate stays pure
//! domain logic plus an in-memory backend.

#![deny(unsafe_code)]

pub mod access;
pub mod audit;
pub mod engine;
pub mod error;
pub mod fees;
pub mod hierarchy;
pub mod memory;
pub mod notify;
pub mod pricing;
pub mod redaction;
pub mod referral;
pub mod store;
pub mod types;

pub use access::{can_access, can_access_job, JobAccessFilter};
pub use audit::{AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use engine::{BrokerEngine, BrokerEngineConfig, JobRequest};
pub use error::{BrokerError, StoreError};
pub use fees::{distribute, earned_share, rollup, FeePolicy};
pub use hierarchy::{
    derive_assignment, integrity_scan, recruiting_role, EdgeIndex, IntegrityIssue,
    IntegrityReport, MAX_ANCESTOR_HOPS,
};
pub use memory::MemoryBrokerStore;
pub use notify::{intents_for, recipients, JobEvent};
pub use pricing::{quote, urgency_for, word_units, PriceBucket, PriceTable, MAX_TABLE_WORDS};
pub use redaction::{allowed_fields, filter_view, FinancialField, JobView};
pub use referral::{can_issue, generate_token, normalize_code, standard_purposes, CODE_LEN};
pub use store::{BrokerStore, RootUpdate};
pub use types::{
    Actor, ActorId, ActorRole, CodeId, EarningsSummary, FeeBreakdown, HierarchyEdge, Identity,
    Job, JobEarnings, JobId, JobSlot, JobStatus, NotificationIntent, Period, PricingBreakdown,
    RateConfig, RateConfigSnapshot, RateSource, ReferenceCode, ReferralPurpose, UrgencyLevel,
};
