//! Notification eligibility.
//!
//! The core decides who should hear about a job event and whether their
//! payload may carry financial fields. Delivery, retry, and transport belong
//! to the external notification collaborator.

use crate::redaction::{allowed_fields, JobView};
use crate::types::{ActorId, ActorRole, Identity, Job, NotificationIntent, RateSource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEvent {
    Created,
    Assigned,
    Requoted,
    Completed,
}

impl JobEvent {
    fn title(self) -> &'static str {
        match self {
            Self::Created => "New job created",
            Self::Assigned => "Job assigned",
            Self::Requoted => "Job re-quoted",
            Self::Completed => "Job completed",
        }
    }

    fn body(self, job: &Job) -> String {
        match self {
            Self::Created => format!("Job {} created ({} words)", job.id, job.word_count),
            Self::Assigned => format!("Job {} has been assigned", job.id),
            Self::Requoted => format!("Job {} was re-quoted", job.id),
            Self::Completed => format!("Job {} is complete", job.id),
        }
    }
}

/// Slot occupants plus the ancestor whose tier priced the job, deduplicated
/// in slot order.
pub fn recipients(job: &Job) -> Vec<ActorId> {
    let mut out: Vec<ActorId> = job.slots().into_iter().map(|(_, id)| id).collect();
    if let RateSource::Custom { issuer_id, .. } = &job.pricing.rate_source {
        if !out.contains(issuer_id) {
            out.push(*issuer_id);
        }
    }
    out
}

/// Build delivery intents for a job event, one per financial-visibility
/// class.
///
/// Recipients whose role allow-list keeps at least one field on this record
/// may receive financial content; everyone else gets a stripped payload.
/// `roles` must cover every recipient (the engine prefetches them).
pub fn intents_for(
    event: JobEvent,
    job: &Job,
    roles: &HashMap<ActorId, ActorRole>,
) -> Vec<NotificationIntent> {
    let view = JobView::unredacted(job, None);
    let mut with_financials = Vec::new();
    let mut without_financials = Vec::new();

    for actor_id in recipients(job) {
        let Some(role) = roles.get(&actor_id) else {
            continue;
        };
        let viewer = Identity::new(actor_id, *role);
        if allowed_fields(viewer, &view).is_empty() {
            without_financials.push(actor_id);
        } else {
            with_financials.push(actor_id);
        }
    }

    let mut intents = Vec::new();
    if !with_financials.is_empty() {
        intents.push(NotificationIntent {
            targets: with_financials,
            title: event.title().to_string(),
            body: event.body(job),
            financial_fields_allowed: true,
        });
    }
    if !without_financials.is_empty() {
        intents.push(NotificationIntent {
            targets: without_financials,
            title: event.title().to_string(),
            body: event.body(job),
            financial_fields_allowed: false,
        });
    }
    intents
}
