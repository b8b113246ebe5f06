//! Hierarchy-derived access decisions.
//!
//! All predicates here are pure over prefetched edge snapshots; the engine
//! is responsible for reading the edges it hands in.

use crate::hierarchy::EdgeIndex;
use crate::types::{ActorId, ActorRole, HierarchyEdge, Identity, Job};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// May `requester` read or act on the actor behind `target_edge`?
///
/// Self-access is always allowed. Root-role requesters reach everyone under
/// their own root. Everyone else reaches direct children only.
pub fn can_access(
    requester: Identity,
    target_id: ActorId,
    target_edge: Option<&HierarchyEdge>,
) -> bool {
    if requester.actor_id == target_id {
        return true;
    }

    let Some(edge) = target_edge else {
        return false;
    };

    match requester.role {
        ActorRole::Root => edge.root_id == requester.actor_id,
        _ => edge.parent_id == Some(requester.actor_id),
    }
}

/// May `requester` read a specific job record?
pub fn can_access_job(requester: Identity, job: &Job, index: &EdgeIndex) -> bool {
    if job.occupies_slot(requester.actor_id) {
        return true;
    }

    let is_direct_child = |candidate: Option<ActorId>| {
        candidate
            .and_then(|id| index.get(id))
            .map(|edge| edge.parent_id == Some(requester.actor_id))
            .unwrap_or(false)
    };

    match requester.role {
        ActorRole::Root => job
            .slots()
            .iter()
            .filter_map(|(_, id)| index.get(*id))
            .any(|edge| edge.root_id == requester.actor_id),
        ActorRole::Issuer => is_direct_child(Some(job.client_id)),
        ActorRole::SubIssuer => {
            is_direct_child(job.fulfiller_id) || is_direct_child(job.sub_fulfiller_id)
        }
        ActorRole::Client | ActorRole::Fulfiller => false,
    }
}

/// Per-role listing predicate. This value is the authorization boundary for
/// every job listing operation in the surrounding system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum JobAccessFilter {
    /// Root: every job whose slots resolve under this root.
    AllUnderRoot { root_id: ActorId },
    /// Issuer: own slots, or jobs whose client is a direct child.
    IssuerScope {
        issuer_id: ActorId,
        child_clients: BTreeSet<ActorId>,
    },
    /// Sub-issuer: own slots, or jobs whose fulfiller is a descendant.
    SubIssuerScope {
        sub_issuer_id: ActorId,
        descendant_fulfillers: BTreeSet<ActorId>,
    },
    /// Clients and fulfillers: direct slot occupancy only.
    SlotOnly { actor_id: ActorId },
}

impl JobAccessFilter {
    /// Build the filter for a requester from an edge snapshot.
    pub fn for_requester(requester: Identity, index: &EdgeIndex) -> Self {
        match requester.role {
            ActorRole::Root => Self::AllUnderRoot {
                root_id: requester.actor_id,
            },
            ActorRole::Issuer => Self::IssuerScope {
                issuer_id: requester.actor_id,
                child_clients: index
                    .iter()
                    .filter(|edge| edge.parent_id == Some(requester.actor_id))
                    .map(|edge| edge.actor_id)
                    .collect(),
            },
            ActorRole::SubIssuer => Self::SubIssuerScope {
                sub_issuer_id: requester.actor_id,
                descendant_fulfillers: index.descendants(requester.actor_id),
            },
            ActorRole::Client | ActorRole::Fulfiller => Self::SlotOnly {
                actor_id: requester.actor_id,
            },
        }
    }

    pub fn matches(&self, job: &Job, index: &EdgeIndex) -> bool {
        match self {
            Self::AllUnderRoot { root_id } => job
                .slots()
                .iter()
                .filter_map(|(_, id)| index.get(*id))
                .any(|edge| edge.root_id == *root_id),
            Self::IssuerScope {
                issuer_id,
                child_clients,
            } => job.occupies_slot(*issuer_id) || child_clients.contains(&job.client_id),
            Self::SubIssuerScope {
                sub_issuer_id,
                descendant_fulfillers,
            } => {
                job.occupies_slot(*sub_issuer_id)
                    || job
                        .fulfiller_id
                        .map(|id| descendant_fulfillers.contains(&id))
                        .unwrap_or(false)
                    || job
                        .sub_fulfiller_id
                        .map(|id| descendant_fulfillers.contains(&id))
                        .unwrap_or(false)
            }
            Self::SlotOnly { actor_id } => job.occupies_slot(*actor_id),
        }
    }
}
