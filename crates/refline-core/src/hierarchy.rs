//! Tree placement rules and bounded traversals.
//!
//! Recursive store queries are deliberately avoided: every walk here is an
//! explicit bounded iteration over parent links, so the logic is portable to
//! any backend and testable without a live database.

use crate::error::BrokerError;
use crate::types::{Actor, ActorId, ActorRole, HierarchyEdge, ReferenceCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Upper bound on upward hops. The deepest legal tree is four levels, so ten
/// hops only terminates on corrupted data.
pub const MAX_ANCESTOR_HOPS: usize = 10;

/// Role that is allowed to be the direct parent of `role`, per the
/// recruitment tables. Root has no parent.
pub fn recruiting_role(role: ActorRole) -> Option<ActorRole> {
    match role {
        ActorRole::Root => None,
        ActorRole::Issuer | ActorRole::SubIssuer => Some(ActorRole::Root),
        ActorRole::Client => Some(ActorRole::Issuer),
        ActorRole::Fulfiller => Some(ActorRole::SubIssuer),
    }
}

/// Immutable edge snapshot used by pure traversal and access logic.
#[derive(Debug, Clone, Default)]
pub struct EdgeIndex {
    edges: HashMap<ActorId, HierarchyEdge>,
}

impl EdgeIndex {
    pub fn from_edges(edges: impl IntoIterator<Item = HierarchyEdge>) -> Self {
        Self {
            edges: edges.into_iter().map(|e| (e.actor_id, e)).collect(),
        }
    }

    pub fn get(&self, actor_id: ActorId) -> Option<&HierarchyEdge> {
        self.edges.get(&actor_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HierarchyEdge> {
        self.edges.values()
    }

    /// Ordered ancestors of `actor_id`, nearest parent first, root last.
    pub fn path_to_root(&self, actor_id: ActorId) -> Result<Vec<ActorId>, BrokerError> {
        let mut path = Vec::new();
        let mut seen = BTreeSet::new();
        seen.insert(actor_id);

        let mut cursor = match self.get(actor_id) {
            Some(edge) => edge.parent_id,
            None => return Ok(path),
        };

        while let Some(current) = cursor {
            if !seen.insert(current) || path.len() >= MAX_ANCESTOR_HOPS {
                return Err(BrokerError::CircularHierarchy { actor_id: current });
            }
            path.push(current);
            cursor = self.get(current).and_then(|edge| edge.parent_id);
        }

        Ok(path)
    }

    /// Every actor reachable downward from `actor_id`, excluding itself.
    pub fn descendants(&self, actor_id: ActorId) -> BTreeSet<ActorId> {
        let mut children: HashMap<ActorId, Vec<ActorId>> = HashMap::new();
        for edge in self.edges.values() {
            if let Some(parent) = edge.parent_id {
                children.entry(parent).or_default().push(edge.actor_id);
            }
        }

        let mut out = BTreeSet::new();
        let mut queue = VecDeque::from([actor_id]);
        while let Some(next) = queue.pop_front() {
            for child in children.get(&next).into_iter().flatten() {
                // A revisit means the data is cyclic; stop expanding there.
                if out.insert(*child) {
                    queue.push_back(*child);
                }
            }
        }
        out
    }

    /// True when `candidate` appears on the upward path from `start`
    /// (inclusive of `start`), within the hop bound.
    pub fn on_upward_path(&self, start: ActorId, candidate: ActorId) -> bool {
        if start == candidate {
            return true;
        }
        let mut cursor = Some(start);
        for _ in 0..MAX_ANCESTOR_HOPS {
            cursor = match cursor.and_then(|id| self.get(id)).and_then(|e| e.parent_id) {
                Some(parent) if parent == candidate => return true,
                other => other,
            };
            if cursor.is_none() {
                return false;
            }
        }
        false
    }
}

/// Derive the edge a redeemed code produces for `new_actor`.
///
/// The owner's own root is propagated; an owner that is itself the root
/// becomes the new actor's `root_id`.
pub fn derive_assignment(
    code: &ReferenceCode,
    owner: &Actor,
    owner_edge: Option<&HierarchyEdge>,
    new_actor: &Actor,
) -> Result<HierarchyEdge, BrokerError> {
    if owner.role != code.purpose.owner_role() {
        return Err(BrokerError::Unauthorized);
    }

    let target_role = code.purpose.target_role();
    if new_actor.role != target_role {
        return Err(BrokerError::HierarchyLevelMismatch {
            role: new_actor.role.label(),
            level: target_role.level(),
        });
    }

    let root_id = match owner_edge {
        Some(edge) => edge.root_id,
        None if owner.role == ActorRole::Root => owner.id,
        None => return Err(BrokerError::NotPlaced(owner.id)),
    };

    Ok(HierarchyEdge {
        actor_id: new_actor.id,
        parent_id: Some(owner.id),
        root_id,
        level: target_role.level(),
        version: 0,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IntegrityIssue {
    /// Upward walk from this actor revisited a node or exceeded the bound.
    CycleDetected { actor_id: ActorId },
    /// Registered actor with no edge record at all.
    OrphanActor { actor_id: ActorId },
    /// Edge level disagrees with the fixed role→level table.
    LevelMismatch {
        actor_id: ActorId,
        expected: u8,
        found: u8,
    },
    /// Parent's role is not the role that recruits this actor's role.
    ParentRoleMismatch {
        actor_id: ActorId,
        parent_id: ActorId,
    },
    /// Edge whose parent has no edge record.
    DanglingParent {
        actor_id: ActorId,
        parent_id: ActorId,
    },
    /// Non-root edge with no parent link at all.
    MissingParent { actor_id: ActorId },
    /// Edge whose `root_id` disagrees with its parent's `root_id`.
    RootMismatch {
        actor_id: ActorId,
        expected: ActorId,
        found: ActorId,
    },
}

/// Advisory maintenance scan result. Not enforced on every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub issues: Vec<IntegrityIssue>,
}

/// Full-tree health check: cycles, orphans, and role/level disagreements.
pub fn integrity_scan(actors: &[Actor], index: &EdgeIndex) -> IntegrityReport {
    let mut issues = Vec::new();
    let roles: HashMap<ActorId, ActorRole> = actors.iter().map(|a| (a.id, a.role)).collect();

    for actor in actors {
        if index.get(actor.id).is_none() {
            issues.push(IntegrityIssue::OrphanActor { actor_id: actor.id });
        }
    }

    for edge in index.iter() {
        if index.path_to_root(edge.actor_id).is_err() {
            issues.push(IntegrityIssue::CycleDetected {
                actor_id: edge.actor_id,
            });
        }

        if let Some(role) = roles.get(&edge.actor_id) {
            if role.level() != edge.level {
                issues.push(IntegrityIssue::LevelMismatch {
                    actor_id: edge.actor_id,
                    expected: role.level(),
                    found: edge.level,
                });
            }

            match (edge.parent_id, recruiting_role(*role)) {
                (Some(parent_id), expected) => {
                    match index.get(parent_id) {
                        None => {
                            issues.push(IntegrityIssue::DanglingParent {
                                actor_id: edge.actor_id,
                                parent_id,
                            });
                        }
                        Some(parent_edge) => {
                            if roles.get(&parent_id).copied() != expected {
                                issues.push(IntegrityIssue::ParentRoleMismatch {
                                    actor_id: edge.actor_id,
                                    parent_id,
                                });
                            }
                            // Roots must agree down every parent link; drift
                            // here means a reparent committed against a stale
                            // snapshot.
                            if parent_edge.root_id != edge.root_id {
                                issues.push(IntegrityIssue::RootMismatch {
                                    actor_id: edge.actor_id,
                                    expected: parent_edge.root_id,
                                    found: edge.root_id,
                                });
                            }
                        }
                    }
                }
                (None, Some(_)) => {
                    issues.push(IntegrityIssue::MissingParent {
                        actor_id: edge.actor_id,
                    });
                }
                (None, None) => {}
            }
        }
    }

    IntegrityReport {
        valid: issues.is_empty(),
        issues,
    }
}
