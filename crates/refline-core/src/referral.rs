//! Reference code rules: normalization, token generation, issuance
//! eligibility.

use crate::types::{ActorRole, ReferralPurpose};
use uuid::Uuid;

/// Token length presented to users.
pub const CODE_LEN: usize = 10;

/// Matching is case- and whitespace-insensitive; storage keeps the
/// normalized form.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Fresh candidate token. Uniqueness is enforced by the store; the caller
/// retries a bounded number of times on collision.
pub fn generate_token() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .to_ascii_uppercase()
        .chars()
        .take(CODE_LEN)
        .collect()
}

/// Standard code set issued when an actor of an eligible role is created.
/// Root recruits issuers and sub-issuers; issuer recruits clients;
/// sub-issuer recruits fulfillers.
pub fn standard_purposes(role: ActorRole) -> &'static [ReferralPurpose] {
    match role {
        ActorRole::Root => &[
            ReferralPurpose::IssuerRecruitment,
            ReferralPurpose::SubIssuerRecruitment,
        ],
        ActorRole::Issuer => &[ReferralPurpose::ClientRecruitment],
        ActorRole::SubIssuer => &[ReferralPurpose::FulfillerRecruitment],
        ActorRole::Client | ActorRole::Fulfiller => &[],
    }
}

pub fn can_issue(role: ActorRole, purpose: ReferralPurpose) -> bool {
    purpose.owner_role() == role
}
