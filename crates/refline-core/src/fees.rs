//! Fee distribution for completed jobs.
//!
//! The split mirrors quoting: the ancestor whose tier priced the job earns
//! the issuer fee, the fulfiller earns a fixed per-500-words rate, and the
//! remainder settles on the root. `total == fulfiller + issuer + root_net`
//! holds by construction.

use crate::pricing::word_units;
use crate::types::{
    ActorId, ActorRole, EarningsSummary, FeeBreakdown, Job, JobEarnings, Period,
    PricingBreakdown, RateSource,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    /// System-wide fulfiller compensation per started 500-word unit, minor
    /// units.
    pub fulfiller_rate_per_500_minor: i64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            fulfiller_rate_per_500_minor: 500,
        }
    }
}

/// Round-half-up percentage of a non-negative minor amount.
fn percent_of(amount_minor: i64, percent: u8) -> i64 {
    (amount_minor * i64::from(percent) + 50) / 100
}

/// Split a priced job's total among fulfiller, pricing issuer, and root.
pub fn distribute(job: &Job, pricing: &PricingBreakdown, policy: &FeePolicy) -> FeeBreakdown {
    let total = pricing.total_minor;

    let issuer_fee = match &pricing.rate_source {
        RateSource::Custom {
            issuer_fee_percent, ..
        } => percent_of(pricing.base_cost_minor, *issuer_fee_percent),
        RateSource::DefaultTable => 0,
    };

    // Degenerate tiers could push the fixed fulfiller rate past what the job
    // grossed; the fulfiller share is capped so the root never settles
    // negative.
    let fulfiller_fee = (word_units(job.word_count) * policy.fulfiller_rate_per_500_minor)
        .min(total - issuer_fee)
        .max(0);

    FeeBreakdown {
        fulfiller_fee_minor: fulfiller_fee,
        issuer_fee_minor: issuer_fee,
        root_net_minor: total - fulfiller_fee - issuer_fee,
        total_minor: total,
    }
}

/// The share of one job's split that `actor_id` earned in `role`.
pub fn earned_share(actor_id: ActorId, role: ActorRole, job: &Job, fees: &FeeBreakdown) -> i64 {
    match role {
        ActorRole::Root => fees.root_net_minor,
        ActorRole::Issuer => match &job.pricing.rate_source {
            RateSource::Custom { issuer_id, .. } if *issuer_id == actor_id => {
                fees.issuer_fee_minor
            }
            _ => 0,
        },
        ActorRole::Fulfiller => {
            if job.fulfiller_id == Some(actor_id) || job.sub_fulfiller_id == Some(actor_id) {
                fees.fulfiller_fee_minor
            } else {
                0
            }
        }
        // Sub-issuers and clients occupy slots but take no share of the
        // split itself.
        ActorRole::SubIssuer | ActorRole::Client => 0,
    }
}

/// Aggregate completed jobs into a per-actor earnings summary.
///
/// `jobs` must already be scoped to the actor's relevant slots and the
/// period; this function only does the arithmetic.
pub fn rollup(
    actor_id: ActorId,
    role: ActorRole,
    period: Period,
    jobs: &[Job],
    policy: &FeePolicy,
) -> EarningsSummary {
    let mut entries = Vec::with_capacity(jobs.len());
    let mut total = 0_i64;
    let mut earned = 0_i64;

    for job in jobs {
        let Some(completed_at) = job.completed_at else {
            continue;
        };
        let fees = distribute(job, &job.pricing, policy);
        let share = earned_share(actor_id, role, job, &fees);
        total += fees.total_minor;
        earned += share;
        entries.push(JobEarnings {
            job_id: job.id,
            completed_at,
            total_minor: fees.total_minor,
            earned_minor: share,
            fees,
        });
    }

    let margin_bp = if total > 0 { earned * 10_000 / total } else { 0 };

    EarningsSummary {
        actor_id,
        role,
        period,
        jobs: entries,
        total_minor: total,
        earned_minor: earned,
        margin_bp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobId, JobStatus, UrgencyLevel};
    use chrono::{Duration, Utc};

    fn priced_job(word_count: u32, pricing: PricingBreakdown) -> Job {
        Job {
            id: JobId::generate(),
            client_id: ActorId::generate(),
            fulfiller_id: Some(ActorId::generate()),
            issuer_id: None,
            sub_fulfiller_id: None,
            sub_issuer_id: None,
            word_count,
            deadline: Utc::now() + Duration::days(7),
            pricing,
            status: JobStatus::Completed,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    fn custom_pricing(issuer: ActorId) -> PricingBreakdown {
        PricingBreakdown {
            base_cost_minor: 2_250,
            urgency_surcharge_minor: 3_000,
            total_minor: 5_250,
            urgency: UrgencyLevel::Rush,
            rate_source: RateSource::Custom {
                issuer_id: issuer,
                rate_per_500_minor: 750,
                issuer_fee_percent: 18,
            },
        }
    }

    #[test]
    fn split_is_exhaustive_and_lossless() {
        let issuer = ActorId::generate();
        let job = priced_job(1_500, custom_pricing(issuer));
        let fees = distribute(&job, &job.pricing, &FeePolicy::default());

        assert_eq!(fees.fulfiller_fee_minor, 1_500); // 3 units x 5.00
        assert_eq!(fees.issuer_fee_minor, 405); // 18% of 22.50
        assert_eq!(
            fees.total_minor,
            fees.fulfiller_fee_minor + fees.issuer_fee_minor + fees.root_net_minor
        );
        assert_eq!(fees.root_net_minor, 3_345);
    }

    #[test]
    fn default_priced_jobs_pay_no_issuer_fee() {
        let job = priced_job(
            1_000,
            PricingBreakdown {
                base_cost_minor: 5_500,
                urgency_surcharge_minor: 0,
                total_minor: 5_500,
                urgency: UrgencyLevel::Normal,
                rate_source: RateSource::DefaultTable,
            },
        );
        let fees = distribute(&job, &job.pricing, &FeePolicy::default());

        assert_eq!(fees.issuer_fee_minor, 0);
        assert_eq!(fees.fulfiller_fee_minor, 1_000);
        assert_eq!(fees.root_net_minor, 4_500);
    }

    #[test]
    fn fulfiller_fee_is_capped_by_gross() {
        let issuer = ActorId::generate();
        // 10k words at a rock-bottom tier: fixed fulfiller rate would exceed
        // the job total.
        let job = priced_job(
            10_000,
            PricingBreakdown {
                base_cost_minor: 2_000,
                urgency_surcharge_minor: 0,
                total_minor: 2_000,
                urgency: UrgencyLevel::Normal,
                rate_source: RateSource::Custom {
                    issuer_id: issuer,
                    rate_per_500_minor: 100,
                    issuer_fee_percent: 10,
                },
            },
        );
        let fees = distribute(&job, &job.pricing, &FeePolicy::default());

        assert_eq!(fees.issuer_fee_minor, 200);
        assert_eq!(fees.fulfiller_fee_minor, 1_800);
        assert_eq!(fees.root_net_minor, 0);
        assert_eq!(
            fees.total_minor,
            fees.fulfiller_fee_minor + fees.issuer_fee_minor + fees.root_net_minor
        );
    }

    #[test]
    fn issuer_share_requires_being_the_pricing_ancestor() {
        let issuer = ActorId::generate();
        let other = ActorId::generate();
        let job = priced_job(1_500, custom_pricing(issuer));
        let fees = distribute(&job, &job.pricing, &FeePolicy::default());

        assert_eq!(earned_share(issuer, ActorRole::Issuer, &job, &fees), 405);
        assert_eq!(earned_share(other, ActorRole::Issuer, &job, &fees), 0);
    }

    #[test]
    fn rollup_sums_jobs_and_derives_margin() {
        let issuer = ActorId::generate();
        let jobs = vec![
            priced_job(1_500, custom_pricing(issuer)),
            priced_job(1_500, custom_pricing(issuer)),
        ];
        let period = Period {
            start: Utc::now() - Duration::days(30),
            end: Utc::now() + Duration::days(1),
        };

        let summary = rollup(issuer, ActorRole::Issuer, period, &jobs, &FeePolicy::default());
        assert_eq!(summary.jobs.len(), 2);
        assert_eq!(summary.total_minor, 10_500);
        assert_eq!(summary.earned_minor, 810);
        // 810 / 10500 = 7.71%
        assert_eq!(summary.margin_bp, 771);
    }
}
