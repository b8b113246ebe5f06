//! Storage boundary for the brokerage core.
//!
//! Reads are granular; writes that must hold invariants across several rows
//! are composite and atomic per backend. The engine computes the full write
//! set up front and the backend applies it guarded by row versions, so a
//! concurrent update surfaces as [`StoreError::Conflict`] instead of a
//! partial write.

use crate::access::JobAccessFilter;
use crate::error::StoreError;
use crate::types::{
    Actor, ActorId, CodeId, HierarchyEdge, Job, JobId, Period, RateConfig, RateConfigSnapshot,
    ReferenceCode,
};
use async_trait::async_trait;

/// Guarded update of one descendant's `root_id` during a reparent.
#[derive(Debug, Clone, Copy)]
pub struct RootUpdate {
    pub actor_id: ActorId,
    pub new_root_id: ActorId,
    pub expected_version: u64,
}

#[async_trait]
pub trait BrokerStore: Send + Sync {
    // -- actors ------------------------------------------------------------

    async fn insert_actor(&self, actor: &Actor) -> Result<(), StoreError>;
    async fn actor(&self, id: ActorId) -> Result<Option<Actor>, StoreError>;
    async fn all_actors(&self) -> Result<Vec<Actor>, StoreError>;

    // -- hierarchy edges ---------------------------------------------------

    async fn edge_of(&self, id: ActorId) -> Result<Option<HierarchyEdge>, StoreError>;
    async fn children_of(&self, id: ActorId) -> Result<Vec<HierarchyEdge>, StoreError>;
    async fn all_edges(&self) -> Result<Vec<HierarchyEdge>, StoreError>;

    /// Compare-and-set upsert. `guard` is the version the caller read
    /// (`None` when no edge is expected to exist). The stored version is
    /// bumped by the backend on success.
    async fn apply_edge(
        &self,
        edge: &HierarchyEdge,
        guard: Option<u64>,
    ) -> Result<HierarchyEdge, StoreError>;

    /// Apply a reparent atomically: the moved edge plus the `root_id`
    /// rewrites of its descendants, each guarded. `read_guards` are rows the
    /// write set was derived from but does not modify (the new parent's
    /// edge); their versions are re-checked in the same transaction so a
    /// concurrent reparent of the parent cannot smuggle in a stale
    /// `root_id`. Any stale guard aborts the whole write with
    /// [`StoreError::Conflict`].
    async fn apply_reparent(
        &self,
        moved: &HierarchyEdge,
        moved_guard: u64,
        root_updates: &[RootUpdate],
        read_guards: &[(ActorId, u64)],
    ) -> Result<HierarchyEdge, StoreError>;

    // -- reference codes ---------------------------------------------------

    /// Fails with [`StoreError::Duplicate`] when the normalized code value
    /// already exists, active or not.
    async fn insert_code(&self, code: &ReferenceCode) -> Result<(), StoreError>;
    async fn code_by_value(&self, normalized: &str) -> Result<Option<ReferenceCode>, StoreError>;
    async fn code_by_id(&self, id: CodeId) -> Result<Option<ReferenceCode>, StoreError>;
    async fn set_code_active(&self, id: CodeId, active: bool) -> Result<(), StoreError>;
    async fn codes_of(&self, owner: ActorId) -> Result<Vec<ReferenceCode>, StoreError>;

    // -- rate configs ------------------------------------------------------

    async fn rate_config(&self, issuer: ActorId) -> Result<Option<RateConfig>, StoreError>;

    /// Snapshot the prior row into the history ledger, then write the new
    /// row, in one transaction. No store-side triggers.
    async fn replace_rate_config(
        &self,
        next: &RateConfig,
        change_reason: &str,
    ) -> Result<(), StoreError>;

    async fn rate_config_history(
        &self,
        issuer: ActorId,
    ) -> Result<Vec<RateConfigSnapshot>, StoreError>;

    // -- jobs --------------------------------------------------------------

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Listing boundary: every job collection read goes through a
    /// [`JobAccessFilter`].
    async fn jobs_matching(&self, filter: &JobAccessFilter) -> Result<Vec<Job>, StoreError>;

    async fn completed_jobs_between(&self, period: Period) -> Result<Vec<Job>, StoreError>;
}
