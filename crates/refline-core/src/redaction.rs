//! Financial field redaction.
//!
//! Records never leave the core unfiltered: every viewer role carries an
//! allow-list, and every filter call lands in the audit sink.

use crate::audit::{AuditRecord, AuditSink};
use crate::types::{ActorId, ActorRole, FeeBreakdown, Identity, Job, JobId, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancialField {
    BaseCost,
    UrgencySurcharge,
    Total,
    FulfillerFee,
    IssuerFee,
    RootNet,
}

const ALL_FIELDS: [FinancialField; 6] = [
    FinancialField::BaseCost,
    FinancialField::UrgencySurcharge,
    FinancialField::Total,
    FinancialField::FulfillerFee,
    FinancialField::IssuerFee,
    FinancialField::RootNet,
];

/// Outbound job record with redactable money fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub client_id: ActorId,
    pub fulfiller_id: Option<ActorId>,
    pub issuer_id: Option<ActorId>,
    pub sub_fulfiller_id: Option<ActorId>,
    pub sub_issuer_id: Option<ActorId>,
    pub word_count: u32,
    pub deadline: DateTime<Utc>,
    pub status: JobStatus,
    pub base_cost_minor: Option<i64>,
    pub urgency_surcharge_minor: Option<i64>,
    pub total_minor: Option<i64>,
    pub fulfiller_fee_minor: Option<i64>,
    pub issuer_fee_minor: Option<i64>,
    pub root_net_minor: Option<i64>,
}

impl JobView {
    /// Unredacted view of a job, optionally with its fee split.
    pub fn unredacted(job: &Job, fees: Option<&FeeBreakdown>) -> Self {
        Self {
            job_id: job.id,
            client_id: job.client_id,
            fulfiller_id: job.fulfiller_id,
            issuer_id: job.issuer_id,
            sub_fulfiller_id: job.sub_fulfiller_id,
            sub_issuer_id: job.sub_issuer_id,
            word_count: job.word_count,
            deadline: job.deadline,
            status: job.status,
            base_cost_minor: Some(job.pricing.base_cost_minor),
            urgency_surcharge_minor: Some(job.pricing.urgency_surcharge_minor),
            total_minor: Some(job.pricing.total_minor),
            fulfiller_fee_minor: fees.map(|f| f.fulfiller_fee_minor),
            issuer_fee_minor: fees.map(|f| f.issuer_fee_minor),
            root_net_minor: fees.map(|f| f.root_net_minor),
        }
    }
}

/// Per-role allow-list for one record.
///
/// Root sees everything. Issuers keep pricing and fee fields only on records
/// where they occupy an issuer-side slot, and never the root's net.
/// Sub-issuers see fulfiller payment only. Fulfillers see nothing. Clients
/// see pricing totals on their own records only.
pub fn allowed_fields(viewer: Identity, view: &JobView) -> BTreeSet<FinancialField> {
    match viewer.role {
        ActorRole::Root => ALL_FIELDS.into_iter().collect(),
        ActorRole::Issuer => {
            let on_record = view.issuer_id == Some(viewer.actor_id)
                || view.sub_issuer_id == Some(viewer.actor_id);
            if on_record {
                BTreeSet::from([
                    FinancialField::BaseCost,
                    FinancialField::UrgencySurcharge,
                    FinancialField::Total,
                    FinancialField::FulfillerFee,
                    FinancialField::IssuerFee,
                ])
            } else {
                BTreeSet::new()
            }
        }
        ActorRole::SubIssuer => BTreeSet::from([FinancialField::FulfillerFee]),
        ActorRole::Fulfiller => BTreeSet::new(),
        ActorRole::Client => {
            if view.client_id == viewer.actor_id {
                BTreeSet::from([
                    FinancialField::BaseCost,
                    FinancialField::UrgencySurcharge,
                    FinancialField::Total,
                ])
            } else {
                BTreeSet::new()
            }
        }
    }
}

/// Strip every financial field the viewer's allow-list does not name, and
/// record the decision.
pub fn filter_view(mut view: JobView, viewer: Identity, sink: &dyn AuditSink) -> JobView {
    let allowed = allowed_fields(viewer, &view);

    if !allowed.contains(&FinancialField::BaseCost) {
        view.base_cost_minor = None;
    }
    if !allowed.contains(&FinancialField::UrgencySurcharge) {
        view.urgency_surcharge_minor = None;
    }
    if !allowed.contains(&FinancialField::Total) {
        view.total_minor = None;
    }
    if !allowed.contains(&FinancialField::FulfillerFee) {
        view.fulfiller_fee_minor = None;
    }
    if !allowed.contains(&FinancialField::IssuerFee) {
        view.issuer_fee_minor = None;
    }
    if !allowed.contains(&FinancialField::RootNet) {
        view.root_net_minor = None;
    }

    sink.record(AuditRecord::new(
        viewer.actor_id,
        viewer.role,
        "financial_fields",
        view.job_id.to_string(),
        "job",
        !allowed.is_empty(),
    ));

    view
}
