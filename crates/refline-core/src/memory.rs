//! In-process store backend.
//!
//! This is the standard test double and the reference semantics for the
//! PostgreSQL backend: every composite write takes the state lock once, so
//! it is atomic by construction, and version guards behave identically.

use crate::access::JobAccessFilter;
use crate::error::StoreError;
use crate::hierarchy::EdgeIndex;
use crate::store::{BrokerStore, RootUpdate};
use crate::types::{
    Actor, ActorId, CodeId, HierarchyEdge, Job, JobId, JobStatus, Period, RateConfig,
    RateConfigSnapshot, ReferenceCode,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    actors: HashMap<ActorId, Actor>,
    edges: HashMap<ActorId, HierarchyEdge>,
    codes: Vec<ReferenceCode>,
    rates: HashMap<ActorId, RateConfig>,
    rate_history: HashMap<ActorId, Vec<RateConfigSnapshot>>,
    jobs: HashMap<JobId, Job>,
}

#[derive(Debug, Default)]
pub struct MemoryBrokerStore {
    state: Mutex<State>,
}

impl MemoryBrokerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Lock poisoning only happens if a writer panicked; recover the data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn check_guard(current: Option<&HierarchyEdge>, guard: Option<u64>) -> Result<u64, StoreError> {
    match (current, guard) {
        (None, None) => Ok(1),
        (Some(existing), Some(expected)) if existing.version == expected => Ok(expected + 1),
        _ => Err(StoreError::Conflict),
    }
}

#[async_trait]
impl BrokerStore for MemoryBrokerStore {
    async fn insert_actor(&self, actor: &Actor) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.actors.contains_key(&actor.id) {
            return Err(StoreError::Duplicate(actor.id.to_string()));
        }
        state.actors.insert(actor.id, actor.clone());
        Ok(())
    }

    async fn actor(&self, id: ActorId) -> Result<Option<Actor>, StoreError> {
        Ok(self.lock().actors.get(&id).cloned())
    }

    async fn all_actors(&self) -> Result<Vec<Actor>, StoreError> {
        Ok(self.lock().actors.values().cloned().collect())
    }

    async fn edge_of(&self, id: ActorId) -> Result<Option<HierarchyEdge>, StoreError> {
        Ok(self.lock().edges.get(&id).cloned())
    }

    async fn children_of(&self, id: ActorId) -> Result<Vec<HierarchyEdge>, StoreError> {
        Ok(self
            .lock()
            .edges
            .values()
            .filter(|edge| edge.parent_id == Some(id))
            .cloned()
            .collect())
    }

    async fn all_edges(&self) -> Result<Vec<HierarchyEdge>, StoreError> {
        Ok(self.lock().edges.values().cloned().collect())
    }

    async fn apply_edge(
        &self,
        edge: &HierarchyEdge,
        guard: Option<u64>,
    ) -> Result<HierarchyEdge, StoreError> {
        let mut state = self.lock();
        let next_version = check_guard(state.edges.get(&edge.actor_id), guard)?;
        let committed = HierarchyEdge {
            version: next_version,
            ..edge.clone()
        };
        state.edges.insert(edge.actor_id, committed.clone());
        Ok(committed)
    }

    async fn apply_reparent(
        &self,
        moved: &HierarchyEdge,
        moved_guard: u64,
        root_updates: &[RootUpdate],
        read_guards: &[(ActorId, u64)],
    ) -> Result<HierarchyEdge, StoreError> {
        let mut state = self.lock();

        // Validate every guard before touching anything.
        let next_version = check_guard(state.edges.get(&moved.actor_id), Some(moved_guard))?;
        for update in root_updates {
            match state.edges.get(&update.actor_id) {
                Some(edge) if edge.version == update.expected_version => {}
                _ => return Err(StoreError::Conflict),
            }
        }
        for (actor_id, expected) in read_guards {
            match state.edges.get(actor_id) {
                Some(edge) if edge.version == *expected => {}
                _ => return Err(StoreError::Conflict),
            }
        }

        let committed = HierarchyEdge {
            version: next_version,
            ..moved.clone()
        };
        state.edges.insert(moved.actor_id, committed.clone());
        for update in root_updates {
            if let Some(edge) = state.edges.get_mut(&update.actor_id) {
                edge.root_id = update.new_root_id;
                edge.version += 1;
            }
        }
        Ok(committed)
    }

    async fn insert_code(&self, code: &ReferenceCode) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.codes.iter().any(|c| c.code == code.code) {
            return Err(StoreError::Duplicate(code.code.clone()));
        }
        state.codes.push(code.clone());
        Ok(())
    }

    async fn code_by_value(&self, normalized: &str) -> Result<Option<ReferenceCode>, StoreError> {
        Ok(self
            .lock()
            .codes
            .iter()
            .find(|c| c.code == normalized)
            .cloned())
    }

    async fn code_by_id(&self, id: CodeId) -> Result<Option<ReferenceCode>, StoreError> {
        Ok(self.lock().codes.iter().find(|c| c.id == id).cloned())
    }

    async fn set_code_active(&self, id: CodeId, active: bool) -> Result<(), StoreError> {
        let mut state = self.lock();
        match state.codes.iter_mut().find(|c| c.id == id) {
            Some(code) => {
                code.active = active;
                Ok(())
            }
            None => Err(StoreError::Backend(format!("unknown code id {id}"))),
        }
    }

    async fn codes_of(&self, owner: ActorId) -> Result<Vec<ReferenceCode>, StoreError> {
        Ok(self
            .lock()
            .codes
            .iter()
            .filter(|c| c.owner_id == owner)
            .cloned()
            .collect())
    }

    async fn rate_config(&self, issuer: ActorId) -> Result<Option<RateConfig>, StoreError> {
        Ok(self.lock().rates.get(&issuer).cloned())
    }

    async fn replace_rate_config(
        &self,
        next: &RateConfig,
        change_reason: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(prior) = state.rates.get(&next.issuer_id).cloned() {
            state
                .rate_history
                .entry(next.issuer_id)
                .or_default()
                .push(RateConfigSnapshot {
                    prior,
                    change_reason: change_reason.to_string(),
                    superseded_at: Utc::now(),
                });
        }
        state.rates.insert(next.issuer_id, next.clone());
        Ok(())
    }

    async fn rate_config_history(
        &self,
        issuer: ActorId,
    ) -> Result<Vec<RateConfigSnapshot>, StoreError> {
        Ok(self
            .lock()
            .rate_history
            .get(&issuer)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id.to_string()));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.lock();
        match state.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!("unknown job id {}", job.id))),
        }
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn jobs_matching(&self, filter: &JobAccessFilter) -> Result<Vec<Job>, StoreError> {
        let state = self.lock();
        let index = EdgeIndex::from_edges(state.edges.values().cloned());
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job, &index))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn completed_jobs_between(&self, period: Period) -> Result<Vec<Job>, StoreError> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Completed
                    && job.completed_at.map(|at| period.contains(at)).unwrap_or(false)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.completed_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActorRole;

    fn edge(actor_id: ActorId, root: ActorId) -> HierarchyEdge {
        HierarchyEdge {
            actor_id,
            parent_id: Some(root),
            root_id: root,
            level: 2,
            version: 0,
        }
    }

    #[tokio::test]
    async fn apply_edge_enforces_version_guards() {
        let store = MemoryBrokerStore::new();
        let root = ActorId::generate();
        let actor = ActorId::generate();

        let committed = store.apply_edge(&edge(actor, root), None).await.unwrap();
        assert_eq!(committed.version, 1);

        // Stale guard: someone else wrote version 1 already.
        let err = store.apply_edge(&edge(actor, root), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));

        let committed = store
            .apply_edge(&edge(actor, root), Some(1))
            .await
            .unwrap();
        assert_eq!(committed.version, 2);
    }

    #[tokio::test]
    async fn reparent_aborts_whole_write_on_any_stale_guard() {
        let store = MemoryBrokerStore::new();
        let root_a = ActorId::generate();
        let root_b = ActorId::generate();
        let moved = ActorId::generate();
        let child = ActorId::generate();

        let moved_edge = store.apply_edge(&edge(moved, root_a), None).await.unwrap();
        store.apply_edge(&edge(child, root_a), None).await.unwrap();

        let relocated = HierarchyEdge {
            parent_id: Some(root_b),
            root_id: root_b,
            ..moved_edge.clone()
        };
        let stale = [RootUpdate {
            actor_id: child,
            new_root_id: root_b,
            expected_version: 99,
        }];

        let err = store
            .apply_reparent(&relocated, moved_edge.version, &stale, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));

        // Nothing moved.
        let unchanged = store.edge_of(moved).await.unwrap().unwrap();
        assert_eq!(unchanged.root_id, root_a);
    }

    #[tokio::test]
    async fn reparent_rejects_stale_parent_read_guard() {
        let store = MemoryBrokerStore::new();
        let root_a = ActorId::generate();
        let root_b = ActorId::generate();
        let parent = ActorId::generate();
        let moved = ActorId::generate();

        let parent_edge = store.apply_edge(&edge(parent, root_a), None).await.unwrap();
        let moved_edge = store.apply_edge(&edge(moved, root_a), None).await.unwrap();

        // The parent is concurrently moved under another root after the
        // caller took its snapshot.
        store
            .apply_edge(
                &HierarchyEdge {
                    root_id: root_b,
                    ..parent_edge.clone()
                },
                Some(parent_edge.version),
            )
            .await
            .unwrap();

        // The caller's write set still carries the parent's old root; the
        // stale read guard must abort it instead of committing root_a.
        let relocated = HierarchyEdge {
            parent_id: Some(parent),
            root_id: parent_edge.root_id,
            ..moved_edge.clone()
        };
        let err = store
            .apply_reparent(
                &relocated,
                moved_edge.version,
                &[],
                &[(parent, parent_edge.version)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));

        let unchanged = store.edge_of(moved).await.unwrap().unwrap();
        assert_eq!(unchanged.parent_id, Some(root_a));
    }

    #[tokio::test]
    async fn duplicate_code_values_are_rejected() {
        let store = MemoryBrokerStore::new();
        let owner = ActorId::generate();
        let code = ReferenceCode {
            id: CodeId::generate(),
            code: "AAAA111122".to_string(),
            owner_id: owner,
            purpose: crate::types::ReferralPurpose::ClientRecruitment,
            active: true,
            issued_at: Utc::now(),
        };

        store.insert_code(&code).await.unwrap();
        let twin = ReferenceCode {
            id: CodeId::generate(),
            ..code
        };
        assert!(matches!(
            store.insert_code(&twin).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn rate_updates_snapshot_prior_rows() {
        let store = MemoryBrokerStore::new();
        let issuer = ActorId::generate();
        let v1 = RateConfig {
            issuer_id: issuer,
            min_words: 500,
            max_words: 10_000,
            rate_per_500_minor: 750,
            issuer_fee_percent: 18,
            updated_at: Utc::now(),
        };

        store.replace_rate_config(&v1, "initial").await.unwrap();
        assert!(store.rate_config_history(issuer).await.unwrap().is_empty());

        let v2 = RateConfig {
            rate_per_500_minor: 800,
            ..v1.clone()
        };
        store.replace_rate_config(&v2, "rate bump").await.unwrap();

        let history = store.rate_config_history(issuer).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].prior, v1);
        assert_eq!(history[0].change_reason, "rate bump");
        assert_eq!(
            store.rate_config(issuer).await.unwrap().unwrap().rate_per_500_minor,
            800
        );
    }

    #[tokio::test]
    async fn actors_are_unique_by_id() {
        let store = MemoryBrokerStore::new();
        let actor = Actor::new("dup", ActorRole::Client);
        store.insert_actor(&actor).await.unwrap();
        assert!(matches!(
            store.insert_actor(&actor).await,
            Err(StoreError::Duplicate(_))
        ));
    }
}
