use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Actor identity, stable across the actor's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub Uuid);

impl ActorId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeId(pub Uuid);

impl CodeId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The five hierarchy roles. Immutable once an actor is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Root,
    Issuer,
    SubIssuer,
    Client,
    Fulfiller,
}

impl ActorRole {
    /// Fixed role→level table. Role and level must always agree.
    pub fn level(self) -> u8 {
        match self {
            Self::Root => 1,
            Self::Issuer | Self::SubIssuer => 2,
            Self::Client => 3,
            Self::Fulfiller => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Issuer => "issuer",
            Self::SubIssuer => "sub_issuer",
            Self::Client => "client",
            Self::Fulfiller => "fulfiller",
        }
    }
}

/// Registered actor. Placement in the tree lives in [`HierarchyEdge`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub display_name: String,
    pub role: ActorRole,
    pub created_at: DateTime<Utc>,
}

impl Actor {
    pub fn new(display_name: impl Into<String>, role: ActorRole) -> Self {
        Self {
            id: ActorId::generate(),
            display_name: display_name.into(),
            role,
            created_at: Utc::now(),
        }
    }
}

/// Already-authenticated caller identity, supplied by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub actor_id: ActorId,
    pub role: ActorRole,
}

impl Identity {
    pub fn new(actor_id: ActorId, role: ActorRole) -> Self {
        Self { actor_id, role }
    }
}

/// One actor's position in the tree.
///
/// `version` is the optimistic-concurrency guard: every committed write bumps
/// it, and composite writes fail with a conflict when the guard is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyEdge {
    pub actor_id: ActorId,
    pub parent_id: Option<ActorId>,
    pub root_id: ActorId,
    pub level: u8,
    pub version: u64,
}

/// What a reference code admits when redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralPurpose {
    IssuerRecruitment,
    SubIssuerRecruitment,
    ClientRecruitment,
    FulfillerRecruitment,
}

impl ReferralPurpose {
    /// Role the redeemed code places into the tree.
    pub fn target_role(self) -> ActorRole {
        match self {
            Self::IssuerRecruitment => ActorRole::Issuer,
            Self::SubIssuerRecruitment => ActorRole::SubIssuer,
            Self::ClientRecruitment => ActorRole::Client,
            Self::FulfillerRecruitment => ActorRole::Fulfiller,
        }
    }

    /// Role eligible to own codes with this purpose.
    pub fn owner_role(self) -> ActorRole {
        match self {
            Self::IssuerRecruitment | Self::SubIssuerRecruitment => ActorRole::Root,
            Self::ClientRecruitment => ActorRole::Issuer,
            Self::FulfillerRecruitment => ActorRole::SubIssuer,
        }
    }
}

/// Single-purpose recruitment token. Deactivated, never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceCode {
    pub id: CodeId,
    /// Stored normalized: trimmed, uppercase.
    pub code: String,
    pub owner_id: ActorId,
    pub purpose: ReferralPurpose,
    pub active: bool,
    pub issued_at: DateTime<Utc>,
}

/// Per-issuer price tier. Money is in minor units (cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    pub issuer_id: ActorId,
    pub min_words: u32,
    pub max_words: u32,
    pub rate_per_500_minor: i64,
    pub issuer_fee_percent: u8,
    pub updated_at: DateTime<Utc>,
}

/// Full snapshot of a superseded rate row, written to the history ledger
/// before every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfigSnapshot {
    pub prior: RateConfig,
    pub change_reason: String,
    pub superseded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    Rush,
    Urgent,
    Moderate,
    Normal,
}

/// Which price tier produced a quote. Fee distribution mirrors this: the
/// ancestor that set the price also earns the issuer fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RateSource {
    Custom {
        issuer_id: ActorId,
        rate_per_500_minor: i64,
        issuer_fee_percent: u8,
    },
    DefaultTable,
}

/// Computed price quote. Pure value embedded in a [`Job`], minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingBreakdown {
    pub base_cost_minor: i64,
    pub urgency_surcharge_minor: i64,
    pub total_minor: i64,
    pub urgency: UrgencyLevel,
    pub rate_source: RateSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

/// The five actor slots a job may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSlot {
    Client,
    Fulfiller,
    Issuer,
    SubFulfiller,
    SubIssuer,
}

/// A brokered unit of work. Pricing fields are set at creation and rewritten
/// only by explicit re-quote operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub client_id: ActorId,
    pub fulfiller_id: Option<ActorId>,
    pub issuer_id: Option<ActorId>,
    pub sub_fulfiller_id: Option<ActorId>,
    pub sub_issuer_id: Option<ActorId>,
    pub word_count: u32,
    pub deadline: DateTime<Utc>,
    pub pricing: PricingBreakdown,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Occupied slots in declaration order.
    pub fn slots(&self) -> Vec<(JobSlot, ActorId)> {
        let mut out = vec![(JobSlot::Client, self.client_id)];
        if let Some(id) = self.fulfiller_id {
            out.push((JobSlot::Fulfiller, id));
        }
        if let Some(id) = self.issuer_id {
            out.push((JobSlot::Issuer, id));
        }
        if let Some(id) = self.sub_fulfiller_id {
            out.push((JobSlot::SubFulfiller, id));
        }
        if let Some(id) = self.sub_issuer_id {
            out.push((JobSlot::SubIssuer, id));
        }
        out
    }

    pub fn occupies_slot(&self, actor_id: ActorId) -> bool {
        self.slots().iter().any(|(_, id)| *id == actor_id)
    }
}

/// Split of a completed job's total among the actors who touched it.
/// Invariant: `total == fulfiller_fee + issuer_fee + root_net`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub fulfiller_fee_minor: i64,
    pub issuer_fee_minor: i64,
    pub root_net_minor: i64,
    pub total_minor: i64,
}

/// Inclusive reporting window for earnings rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// One job's contribution to an earnings rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEarnings {
    pub job_id: JobId,
    pub completed_at: DateTime<Utc>,
    pub total_minor: i64,
    pub earned_minor: i64,
    pub fees: FeeBreakdown,
}

/// Aggregate earnings for one actor over a period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarningsSummary {
    pub actor_id: ActorId,
    pub role: ActorRole,
    pub period: Period,
    pub jobs: Vec<JobEarnings>,
    pub total_minor: i64,
    pub earned_minor: i64,
    /// Earned share of gross volume, percent with two implied decimals
    /// (e.g. 1850 = 18.50%). Zero when there is no volume.
    pub margin_bp: i64,
}

/// Payload-shaping decision handed to the external notification collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub targets: Vec<ActorId>,
    pub title: String,
    pub body: String,
    pub financial_fields_allowed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_level_table_is_fixed() {
        assert_eq!(ActorRole::Root.level(), 1);
        assert_eq!(ActorRole::Issuer.level(), 2);
        assert_eq!(ActorRole::SubIssuer.level(), 2);
        assert_eq!(ActorRole::Client.level(), 3);
        assert_eq!(ActorRole::Fulfiller.level(), 4);
    }

    #[test]
    fn purpose_tables_agree_with_roles() {
        for purpose in [
            ReferralPurpose::IssuerRecruitment,
            ReferralPurpose::SubIssuerRecruitment,
            ReferralPurpose::ClientRecruitment,
            ReferralPurpose::FulfillerRecruitment,
        ] {
            // The owner role must sit above the recruited role.
            assert!(purpose.owner_role().level() < purpose.target_role().level());
        }
    }

    #[test]
    fn job_slots_list_occupied_only() {
        let client = ActorId::generate();
        let fulfiller = ActorId::generate();
        let job = Job {
            id: JobId::generate(),
            client_id: client,
            fulfiller_id: Some(fulfiller),
            issuer_id: None,
            sub_fulfiller_id: None,
            sub_issuer_id: None,
            word_count: 1000,
            deadline: Utc::now(),
            pricing: PricingBreakdown {
                base_cost_minor: 0,
                urgency_surcharge_minor: 0,
                total_minor: 0,
                urgency: UrgencyLevel::Normal,
                rate_source: RateSource::DefaultTable,
            },
            status: JobStatus::Open,
            created_at: Utc::now(),
            completed_at: None,
        };

        assert_eq!(job.slots().len(), 2);
        assert!(job.occupies_slot(client));
        assert!(job.occupies_slot(fulfiller));
        assert!(!job.occupies_slot(ActorId::generate()));
    }
}
