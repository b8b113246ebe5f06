//! The `BrokerEngine` facade.
//!
//! Every public operation is a single request-scoped unit of work: read a
//! consistent snapshot, validate against it, write through a guarded store
//! call. Writes that lose an optimistic race retry a bounded number of times
//! before surfacing [`BrokerError::Conflict`].

use crate::access::{self, JobAccessFilter};
use crate::audit::AuditSink;
use crate::error::{BrokerError, StoreError};
use crate::fees::{self, FeePolicy};
use crate::hierarchy::{
    self, derive_assignment, integrity_scan, EdgeIndex, IntegrityReport,
};
use crate::notify::{self, JobEvent};
use crate::pricing::{self, PriceTable};
use crate::redaction::{filter_view, JobView};
use crate::referral;
use crate::store::{BrokerStore, RootUpdate};
use crate::types::{
    Actor, ActorId, ActorRole, CodeId, EarningsSummary, FeeBreakdown, HierarchyEdge, Identity,
    Job, JobId, JobStatus, NotificationIntent, Period, PricingBreakdown, RateConfig,
    ReferenceCode, ReferralPurpose,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BrokerEngineConfig {
    /// Attempts before code generation gives up on uniqueness collisions.
    pub code_attempts: u32,
    /// Optimistic retries for guarded hierarchy writes.
    pub write_retries: u32,
    pub price_table: PriceTable,
    pub fee_policy: FeePolicy,
}

impl Default for BrokerEngineConfig {
    fn default() -> Self {
        Self {
            code_attempts: 5,
            write_retries: 3,
            price_table: PriceTable::default(),
            fee_policy: FeePolicy::default(),
        }
    }
}

/// Request shape for creating a priced job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub client_id: ActorId,
    pub fulfiller_id: Option<ActorId>,
    pub issuer_id: Option<ActorId>,
    pub sub_fulfiller_id: Option<ActorId>,
    pub sub_issuer_id: Option<ActorId>,
    pub word_count: u32,
    pub deadline: DateTime<Utc>,
}

/// Hierarchy-aware authorization and pricing engine.
pub struct BrokerEngine {
    store: Arc<dyn BrokerStore>,
    audit: Arc<dyn AuditSink>,
    config: BrokerEngineConfig,
}

impl BrokerEngine {
    pub fn new(
        store: Arc<dyn BrokerStore>,
        audit: Arc<dyn AuditSink>,
        config: BrokerEngineConfig,
    ) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    // -- actors & reference codes -----------------------------------------

    /// Register an actor and issue its standard code set. Root actors are
    /// self-rooted immediately; everyone else joins the tree by redeeming a
    /// code.
    pub async fn register_actor(
        &self,
        display_name: impl Into<String>,
        role: ActorRole,
    ) -> Result<(Actor, Vec<ReferenceCode>), BrokerError> {
        let actor = Actor::new(display_name, role);
        self.store.insert_actor(&actor).await?;

        if role == ActorRole::Root {
            let edge = HierarchyEdge {
                actor_id: actor.id,
                parent_id: None,
                root_id: actor.id,
                level: role.level(),
                version: 0,
            };
            self.store.apply_edge(&edge, None).await?;
        }

        let mut codes = Vec::new();
        for purpose in referral::standard_purposes(role) {
            codes.push(self.issue_code(actor.id, *purpose).await?);
        }

        info!(actor = %actor.id, role = role.label(), codes = codes.len(), "actor registered");
        Ok((actor, codes))
    }

    pub async fn issue_code(
        &self,
        owner_id: ActorId,
        purpose: ReferralPurpose,
    ) -> Result<ReferenceCode, BrokerError> {
        let owner = self
            .store
            .actor(owner_id)
            .await?
            .ok_or(BrokerError::Unauthorized)?;
        if !referral::can_issue(owner.role, purpose) {
            return Err(BrokerError::Unauthorized);
        }

        for attempt in 0..self.config.code_attempts {
            let code = ReferenceCode {
                id: CodeId::generate(),
                code: referral::generate_token(),
                owner_id,
                purpose,
                active: true,
                issued_at: Utc::now(),
            };
            match self.store.insert_code(&code).await {
                Ok(()) => return Ok(code),
                Err(StoreError::Duplicate(value)) => {
                    debug!(attempt, value, "code collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BrokerError::CodeGenerationExhausted {
            attempts: self.config.code_attempts,
        })
    }

    /// Resolve an active code to its owner and purpose.
    pub async fn validate_code(&self, raw: &str) -> Result<ReferenceCode, BrokerError> {
        let normalized = referral::normalize_code(raw);
        match self.store.code_by_value(&normalized).await? {
            Some(code) if code.active => Ok(code),
            _ => Err(BrokerError::InvalidOrInactiveCode),
        }
    }

    pub async fn deactivate_code(
        &self,
        code_id: CodeId,
        requester_id: ActorId,
    ) -> Result<(), BrokerError> {
        let code = self
            .store
            .code_by_id(code_id)
            .await?
            .ok_or(BrokerError::InvalidOrInactiveCode)?;
        if code.owner_id != requester_id {
            return Err(BrokerError::NotOwner);
        }
        self.store.set_code_active(code_id, false).await?;
        info!(code = %code_id, owner = %requester_id, "reference code deactivated");
        Ok(())
    }

    // -- hierarchy ---------------------------------------------------------

    /// Redeem a code and place `new_actor_id` in the tree. Re-assignment
    /// overwrites the prior edge for that actor.
    pub async fn assign_to_hierarchy(
        &self,
        new_actor_id: ActorId,
        raw_code: &str,
    ) -> Result<HierarchyEdge, BrokerError> {
        let code = self.validate_code(raw_code).await?;
        let owner = self
            .store
            .actor(code.owner_id)
            .await?
            .ok_or(BrokerError::InvalidOrInactiveCode)?;
        let new_actor = self
            .store
            .actor(new_actor_id)
            .await?
            .ok_or(BrokerError::NotPlaced(new_actor_id))?;

        for attempt in 0..=self.config.write_retries {
            let owner_edge = self.store.edge_of(owner.id).await?;
            let edge = derive_assignment(&code, &owner, owner_edge.as_ref(), &new_actor)?;
            let guard = self
                .store
                .edge_of(new_actor_id)
                .await?
                .map(|prior| prior.version);

            match self.store.apply_edge(&edge, guard).await {
                Ok(committed) => {
                    info!(
                        actor = %new_actor_id,
                        parent = %owner.id,
                        level = committed.level,
                        "actor placed in hierarchy"
                    );
                    return Ok(committed);
                }
                Err(StoreError::Conflict) => {
                    warn!(attempt, actor = %new_actor_id, "assignment lost optimistic race");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BrokerError::Conflict)
    }

    /// Move an actor under a new parent, revalidating cycles and levels and
    /// propagating the new root to the whole subtree.
    pub async fn reparent(
        &self,
        actor_id: ActorId,
        new_parent_id: ActorId,
        requester: Identity,
    ) -> Result<HierarchyEdge, BrokerError> {
        if actor_id == new_parent_id {
            return Err(BrokerError::CircularHierarchy { actor_id });
        }

        let moved_actor = self
            .store
            .actor(actor_id)
            .await?
            .ok_or(BrokerError::NotPlaced(actor_id))?;
        let new_parent = self
            .store
            .actor(new_parent_id)
            .await?
            .ok_or(BrokerError::NotPlaced(new_parent_id))?;

        if hierarchy::recruiting_role(moved_actor.role) != Some(new_parent.role) {
            return Err(BrokerError::HierarchyLevelMismatch {
                role: moved_actor.role.label(),
                level: new_parent.role.level() + 1,
            });
        }

        for attempt in 0..=self.config.write_retries {
            let index = EdgeIndex::from_edges(self.store.all_edges().await?);
            let moved_edge = index
                .get(actor_id)
                .cloned()
                .ok_or(BrokerError::NotPlaced(actor_id))?;

            if !access::can_access(requester, actor_id, Some(&moved_edge)) {
                return Err(BrokerError::Unauthorized);
            }

            // Walk upward from the new parent: the moved actor must not
            // appear on that path.
            if index.on_upward_path(new_parent_id, actor_id) {
                return Err(BrokerError::CircularHierarchy { actor_id });
            }

            let parent_edge = index
                .get(new_parent_id)
                .cloned()
                .ok_or(BrokerError::NotPlaced(new_parent_id))?;

            let relocated = HierarchyEdge {
                actor_id,
                parent_id: Some(new_parent_id),
                root_id: parent_edge.root_id,
                level: moved_actor.role.level(),
                version: moved_edge.version,
            };

            let root_updates: Vec<RootUpdate> = index
                .descendants(actor_id)
                .into_iter()
                .filter_map(|id| index.get(id))
                .filter(|edge| edge.root_id != parent_edge.root_id)
                .map(|edge| RootUpdate {
                    actor_id: edge.actor_id,
                    new_root_id: parent_edge.root_id,
                    expected_version: edge.version,
                })
                .collect();

            // The parent row is read-only in this write set, but its root_id
            // was propagated; guard it so a concurrent move of the parent
            // aborts this commit.
            match self
                .store
                .apply_reparent(
                    &relocated,
                    moved_edge.version,
                    &root_updates,
                    &[(new_parent_id, parent_edge.version)],
                )
                .await
            {
                Ok(committed) => {
                    info!(
                        actor = %actor_id,
                        new_parent = %new_parent_id,
                        propagated = root_updates.len(),
                        "actor reparented"
                    );
                    return Ok(committed);
                }
                Err(StoreError::Conflict) => {
                    warn!(attempt, actor = %actor_id, "reparent lost optimistic race");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BrokerError::Conflict)
    }

    /// Advisory full-tree health check.
    pub async fn hierarchy_integrity_check(&self) -> Result<IntegrityReport, BrokerError> {
        let actors = self.store.all_actors().await?;
        let index = EdgeIndex::from_edges(self.store.all_edges().await?);
        Ok(integrity_scan(&actors, &index))
    }

    pub async fn path_to_root(&self, actor_id: ActorId) -> Result<Vec<ActorId>, BrokerError> {
        let index = EdgeIndex::from_edges(self.store.all_edges().await?);
        index.path_to_root(actor_id)
    }

    pub async fn descendants(&self, actor_id: ActorId) -> Result<BTreeSet<ActorId>, BrokerError> {
        let index = EdgeIndex::from_edges(self.store.all_edges().await?);
        Ok(index.descendants(actor_id))
    }

    // -- access control ----------------------------------------------------

    pub async fn can_access(
        &self,
        requester: Identity,
        target_id: ActorId,
    ) -> Result<bool, BrokerError> {
        let edge = self.store.edge_of(target_id).await?;
        Ok(access::can_access(requester, target_id, edge.as_ref()))
    }

    pub async fn can_access_job(
        &self,
        requester: Identity,
        job_id: JobId,
    ) -> Result<bool, BrokerError> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or(BrokerError::UnknownJob(job_id))?;
        let index = EdgeIndex::from_edges(self.store.all_edges().await?);
        Ok(access::can_access_job(requester, &job, &index))
    }

    /// The per-role predicate gating every job listing.
    pub async fn accessible_jobs_filter(
        &self,
        requester: Identity,
    ) -> Result<JobAccessFilter, BrokerError> {
        let index = EdgeIndex::from_edges(self.store.all_edges().await?);
        Ok(JobAccessFilter::for_requester(requester, &index))
    }

    pub async fn accessible_jobs(&self, requester: Identity) -> Result<Vec<Job>, BrokerError> {
        let filter = self.accessible_jobs_filter(requester).await?;
        Ok(self.store.jobs_matching(&filter).await?)
    }

    // -- pricing -----------------------------------------------------------

    /// Nearest ancestor of `client_id` owning a rate config, if any.
    pub async fn effective_rate(
        &self,
        client_id: ActorId,
    ) -> Result<Option<RateConfig>, BrokerError> {
        for ancestor in self.path_to_root(client_id).await? {
            if let Some(config) = self.store.rate_config(ancestor).await? {
                return Ok(Some(config));
            }
        }
        Ok(None)
    }

    pub async fn quote_price(
        &self,
        client_id: ActorId,
        word_count: u32,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PricingBreakdown, BrokerError> {
        let rate = self.effective_rate(client_id).await?;
        pricing::quote(
            rate.as_ref(),
            &self.config.price_table,
            word_count,
            deadline,
            now,
        )
    }

    /// Install or update an issuer's custom tier. The prior row is
    /// snapshotted into the history ledger inside the same transaction.
    pub async fn update_rate_config(
        &self,
        requester: Identity,
        config: RateConfig,
        change_reason: &str,
    ) -> Result<(), BrokerError> {
        pricing::validate_rate_config(&config)?;

        let permitted = requester.actor_id == config.issuer_id
            || self.can_access(requester, config.issuer_id).await?;
        if !permitted {
            return Err(BrokerError::Unauthorized);
        }

        self.store
            .replace_rate_config(&config, change_reason)
            .await?;
        info!(issuer = %config.issuer_id, reason = change_reason, "rate config updated");
        Ok(())
    }

    // -- jobs --------------------------------------------------------------

    pub async fn create_job(
        &self,
        request: JobRequest,
        now: DateTime<Utc>,
    ) -> Result<Job, BrokerError> {
        let pricing = self
            .quote_price(request.client_id, request.word_count, request.deadline, now)
            .await?;

        let job = Job {
            id: JobId::generate(),
            client_id: request.client_id,
            fulfiller_id: request.fulfiller_id,
            issuer_id: request.issuer_id,
            sub_fulfiller_id: request.sub_fulfiller_id,
            sub_issuer_id: request.sub_issuer_id,
            word_count: request.word_count,
            deadline: request.deadline,
            pricing,
            status: JobStatus::Open,
            created_at: now,
            completed_at: None,
        };
        self.store.insert_job(&job).await?;
        debug!(job = %job.id, total = job.pricing.total_minor, "job created");
        Ok(job)
    }

    /// Explicit re-quote: the only path that rewrites pricing fields.
    pub async fn requote_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, BrokerError> {
        let mut job = self
            .store
            .job(job_id)
            .await?
            .ok_or(BrokerError::UnknownJob(job_id))?;
        job.pricing = self
            .quote_price(job.client_id, job.word_count, job.deadline, now)
            .await?;
        self.store.update_job(&job).await?;
        Ok(job)
    }

    pub async fn complete_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, BrokerError> {
        let mut job = self
            .store
            .job(job_id)
            .await?
            .ok_or(BrokerError::UnknownJob(job_id))?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        self.store.update_job(&job).await?;
        Ok(job)
    }

    // -- fees & redaction --------------------------------------------------

    pub async fn distribute_fees(&self, job_id: JobId) -> Result<FeeBreakdown, BrokerError> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or(BrokerError::UnknownJob(job_id))?;
        Ok(fees::distribute(&job, &job.pricing, &self.config.fee_policy))
    }

    pub async fn rollup_earnings(
        &self,
        actor_id: ActorId,
        role: ActorRole,
        period: Period,
    ) -> Result<EarningsSummary, BrokerError> {
        let completed = self.store.completed_jobs_between(period).await?;
        let index = EdgeIndex::from_edges(self.store.all_edges().await?);

        let relevant: Vec<Job> = completed
            .into_iter()
            .filter(|job| match role {
                ActorRole::Root => job
                    .slots()
                    .iter()
                    .filter_map(|(_, id)| index.get(*id))
                    .any(|edge| edge.root_id == actor_id),
                ActorRole::Issuer => {
                    job.issuer_id == Some(actor_id)
                        || matches!(
                            &job.pricing.rate_source,
                            crate::types::RateSource::Custom { issuer_id, .. }
                                if *issuer_id == actor_id
                        )
                }
                ActorRole::SubIssuer => job.sub_issuer_id == Some(actor_id),
                ActorRole::Fulfiller => {
                    job.fulfiller_id == Some(actor_id) || job.sub_fulfiller_id == Some(actor_id)
                }
                ActorRole::Client => job.client_id == actor_id,
            })
            .collect();

        Ok(fees::rollup(
            actor_id,
            role,
            period,
            &relevant,
            &self.config.fee_policy,
        ))
    }

    /// Redact a job record for a viewer. Always audited.
    pub async fn filter_financial_fields(
        &self,
        viewer: Identity,
        job_id: JobId,
    ) -> Result<JobView, BrokerError> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or(BrokerError::UnknownJob(job_id))?;
        let fees = fees::distribute(&job, &job.pricing, &self.config.fee_policy);
        let view = JobView::unredacted(&job, Some(&fees));
        Ok(filter_view(view, viewer, self.audit.as_ref()))
    }

    // -- notifications -----------------------------------------------------

    /// Eligibility + payload shaping for the delivery collaborator.
    pub async fn job_event_intents(
        &self,
        event: JobEvent,
        job_id: JobId,
    ) -> Result<Vec<NotificationIntent>, BrokerError> {
        let job = self
            .store
            .job(job_id)
            .await?
            .ok_or(BrokerError::UnknownJob(job_id))?;

        let mut roles: HashMap<ActorId, ActorRole> = HashMap::new();
        for actor_id in notify::recipients(&job) {
            if let Some(actor) = self.store.actor(actor_id).await? {
                roles.insert(actor_id, actor.role);
            }
        }
        Ok(notify::intents_for(event, &job, &roles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::memory::MemoryBrokerStore;
    use chrono::Duration;

    struct Harness {
        engine: BrokerEngine,
        audit: Arc<MemoryAuditSink>,
    }

    fn harness() -> Harness {
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = BrokerEngine::new(
            Arc::new(MemoryBrokerStore::new()),
            audit.clone(),
            BrokerEngineConfig::default(),
        );
        Harness { engine, audit }
    }

    struct Tree {
        root: Actor,
        issuer: Actor,
        sub_issuer: Actor,
        client: Actor,
        fulfiller: Actor,
    }

    /// Root recruits issuer + sub-issuer; issuer recruits client;
    /// sub-issuer recruits fulfiller. Everything via code redemption.
    async fn build_tree(engine: &BrokerEngine) -> Tree {
        let (root, root_codes) = engine.register_actor("root", ActorRole::Root).await.unwrap();
        let issuer_code = root_codes
            .iter()
            .find(|c| c.purpose == ReferralPurpose::IssuerRecruitment)
            .unwrap();
        let sub_code = root_codes
            .iter()
            .find(|c| c.purpose == ReferralPurpose::SubIssuerRecruitment)
            .unwrap();

        let (issuer, issuer_codes) = engine
            .register_actor("issuer", ActorRole::Issuer)
            .await
            .unwrap();
        engine
            .assign_to_hierarchy(issuer.id, &issuer_code.code)
            .await
            .unwrap();

        let (sub_issuer, sub_codes) = engine
            .register_actor("sub-issuer", ActorRole::SubIssuer)
            .await
            .unwrap();
        engine
            .assign_to_hierarchy(sub_issuer.id, &sub_code.code)
            .await
            .unwrap();

        let (client, _) = engine.register_actor("client", ActorRole::Client).await.unwrap();
        engine
            .assign_to_hierarchy(client.id, &issuer_codes[0].code)
            .await
            .unwrap();

        let (fulfiller, _) = engine
            .register_actor("fulfiller", ActorRole::Fulfiller)
            .await
            .unwrap();
        engine
            .assign_to_hierarchy(fulfiller.id, &sub_codes[0].code)
            .await
            .unwrap();

        Tree {
            root,
            issuer,
            sub_issuer,
            client,
            fulfiller,
        }
    }

    fn issuer_rate(issuer_id: ActorId) -> RateConfig {
        RateConfig {
            issuer_id,
            min_words: 500,
            max_words: 10_000,
            rate_per_500_minor: 750,
            issuer_fee_percent: 18,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn recruitment_flow_builds_a_valid_tree() {
        let h = harness();
        let t = build_tree(&h.engine).await;

        let client_edge = h.engine.store.edge_of(t.client.id).await.unwrap().unwrap();
        assert_eq!(client_edge.level, 3);
        assert_eq!(client_edge.parent_id, Some(t.issuer.id));
        assert_eq!(client_edge.root_id, t.root.id);

        let report = h.engine.hierarchy_integrity_check().await.unwrap();
        assert!(report.valid, "issues: {:?}", report.issues);

        let path = h.engine.path_to_root(t.fulfiller.id).await.unwrap();
        assert_eq!(path, vec![t.sub_issuer.id, t.root.id]);
    }

    #[tokio::test]
    async fn invalid_and_deactivated_codes_are_rejected() {
        let h = harness();
        let (root, codes) = h.engine.register_actor("root", ActorRole::Root).await.unwrap();

        assert!(matches!(
            h.engine.validate_code("NOSUCHCODE").await,
            Err(BrokerError::InvalidOrInactiveCode)
        ));

        // Validation normalizes case and whitespace.
        let sloppy = format!("  {}  ", codes[0].code.to_ascii_lowercase());
        assert!(h.engine.validate_code(&sloppy).await.is_ok());

        // Only the owner may deactivate.
        let stranger = ActorId::generate();
        assert!(matches!(
            h.engine.deactivate_code(codes[0].id, stranger).await,
            Err(BrokerError::NotOwner)
        ));

        h.engine.deactivate_code(codes[0].id, root.id).await.unwrap();
        assert!(matches!(
            h.engine.validate_code(&codes[0].code).await,
            Err(BrokerError::InvalidOrInactiveCode)
        ));
    }

    #[tokio::test]
    async fn clients_cannot_issue_codes() {
        let h = harness();
        let (client, codes) = h.engine.register_actor("client", ActorRole::Client).await.unwrap();
        assert!(codes.is_empty());
        assert!(matches!(
            h.engine
                .issue_code(client.id, ReferralPurpose::ClientRecruitment)
                .await,
            Err(BrokerError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn reparent_into_own_subtree_fails_and_leaves_tree_unchanged() {
        let h = harness();
        let t = build_tree(&h.engine).await;
        let root = Identity::new(t.root.id, ActorRole::Root);

        // The issuer's subtree contains the client; moving the issuer under
        // any descendant must fail. Self-parenting too.
        assert!(matches!(
            h.engine.reparent(t.issuer.id, t.issuer.id, root).await,
            Err(BrokerError::CircularHierarchy { .. })
        ));

        let before = h.engine.store.edge_of(t.client.id).await.unwrap().unwrap();
        let err = h
            .engine
            .reparent(t.issuer.id, t.client.id, root)
            .await
            .unwrap_err();
        // Client cannot recruit issuers, so this trips the role table before
        // the cycle walk; either way the tree must not move.
        assert!(matches!(
            err,
            BrokerError::HierarchyLevelMismatch { .. } | BrokerError::CircularHierarchy { .. }
        ));
        let after = h.engine.store.edge_of(t.client.id).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn reparent_moves_subtree_roots() {
        let h = harness();
        let t = build_tree(&h.engine).await;

        // Second tree with its own root and issuer.
        let (root2, root2_codes) = h.engine.register_actor("root2", ActorRole::Root).await.unwrap();
        let issuer2_code = root2_codes
            .iter()
            .find(|c| c.purpose == ReferralPurpose::IssuerRecruitment)
            .unwrap();
        let (issuer2, _) = h
            .engine
            .register_actor("issuer2", ActorRole::Issuer)
            .await
            .unwrap();
        h.engine
            .assign_to_hierarchy(issuer2.id, &issuer2_code.code)
            .await
            .unwrap();

        // Root of the first tree moves its client under the foreign issuer.
        let committed = h
            .engine
            .reparent(
                t.client.id,
                issuer2.id,
                Identity::new(t.root.id, ActorRole::Root),
            )
            .await
            .unwrap();

        assert_eq!(committed.parent_id, Some(issuer2.id));
        assert_eq!(committed.root_id, root2.id);
        assert_eq!(committed.level, 3);

        let report = h.engine.hierarchy_integrity_check().await.unwrap();
        assert!(report.valid, "issues: {:?}", report.issues);
    }

    #[tokio::test]
    async fn reparent_requires_access_to_the_moved_actor() {
        let h = harness();
        let t = build_tree(&h.engine).await;
        let stranger = Identity::new(ActorId::generate(), ActorRole::Issuer);

        assert!(matches!(
            h.engine.reparent(t.client.id, t.issuer.id, stranger).await,
            Err(BrokerError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn quote_uses_nearest_ancestor_tier() {
        let h = harness();
        let t = build_tree(&h.engine).await;
        let issuer = Identity::new(t.issuer.id, ActorRole::Issuer);
        h.engine
            .update_rate_config(issuer, issuer_rate(t.issuer.id), "initial tier")
            .await
            .unwrap();

        let now = Utc::now();
        let breakdown = h
            .engine
            .quote_price(t.client.id, 1_500, now + Duration::days(1), now)
            .await
            .unwrap();

        assert_eq!(breakdown.base_cost_minor, 2_250);
        assert_eq!(breakdown.urgency_surcharge_minor, 3_000);
        assert_eq!(breakdown.total_minor, 5_250);
        assert_eq!(breakdown.urgency, crate::types::UrgencyLevel::Rush);
    }

    #[tokio::test]
    async fn quote_falls_back_to_default_table() {
        let h = harness();
        let t = build_tree(&h.engine).await;

        let now = Utc::now();
        let breakdown = h
            .engine
            .quote_price(t.client.id, 1_500, now + Duration::days(10), now)
            .await
            .unwrap();

        assert_eq!(breakdown.base_cost_minor, 6_500);
        assert_eq!(breakdown.urgency_surcharge_minor, 0);
        assert_eq!(
            breakdown.rate_source,
            crate::types::RateSource::DefaultTable
        );
    }

    #[tokio::test]
    async fn rate_updates_validate_and_snapshot_history() {
        let h = harness();
        let t = build_tree(&h.engine).await;
        let issuer = Identity::new(t.issuer.id, ActorRole::Issuer);

        let mut bad = issuer_rate(t.issuer.id);
        bad.issuer_fee_percent = 130;
        assert!(matches!(
            h.engine.update_rate_config(issuer, bad, "oops").await,
            Err(BrokerError::RateConfigInvalid(_))
        ));

        h.engine
            .update_rate_config(issuer, issuer_rate(t.issuer.id), "initial tier")
            .await
            .unwrap();
        let mut bumped = issuer_rate(t.issuer.id);
        bumped.rate_per_500_minor = 900;
        h.engine
            .update_rate_config(issuer, bumped, "seasonal bump")
            .await
            .unwrap();

        let history = h
            .engine
            .store
            .rate_config_history(t.issuer.id)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].prior.rate_per_500_minor, 750);
        assert_eq!(history[0].change_reason, "seasonal bump");

        // A foreign issuer may not touch this tier.
        let (other, _) = h
            .engine
            .register_actor("other-issuer", ActorRole::Issuer)
            .await
            .unwrap();
        assert!(matches!(
            h.engine
                .update_rate_config(
                    Identity::new(other.id, ActorRole::Issuer),
                    issuer_rate(t.issuer.id),
                    "hostile"
                )
                .await,
            Err(BrokerError::Unauthorized)
        ));
    }

    async fn completed_job(h: &Harness, t: &Tree, now: DateTime<Utc>) -> Job {
        let job = h
            .engine
            .create_job(
                JobRequest {
                    client_id: t.client.id,
                    fulfiller_id: Some(t.fulfiller.id),
                    issuer_id: Some(t.issuer.id),
                    sub_fulfiller_id: None,
                    sub_issuer_id: Some(t.sub_issuer.id),
                    word_count: 1_500,
                    deadline: now + Duration::days(1),
                },
                now,
            )
            .await
            .unwrap();
        h.engine.complete_job(job.id, now).await.unwrap()
    }

    #[tokio::test]
    async fn fee_split_is_lossless_end_to_end() {
        let h = harness();
        let t = build_tree(&h.engine).await;
        h.engine
            .update_rate_config(
                Identity::new(t.issuer.id, ActorRole::Issuer),
                issuer_rate(t.issuer.id),
                "initial tier",
            )
            .await
            .unwrap();

        let now = Utc::now();
        let job = completed_job(&h, &t, now).await;
        let fees = h.engine.distribute_fees(job.id).await.unwrap();

        assert_eq!(fees.total_minor, 5_250);
        assert_eq!(fees.fulfiller_fee_minor, 1_500);
        assert_eq!(fees.issuer_fee_minor, 405);
        assert_eq!(
            fees.total_minor,
            fees.fulfiller_fee_minor + fees.issuer_fee_minor + fees.root_net_minor
        );
    }

    #[tokio::test]
    async fn rollup_reports_the_issuer_share() {
        let h = harness();
        let t = build_tree(&h.engine).await;
        h.engine
            .update_rate_config(
                Identity::new(t.issuer.id, ActorRole::Issuer),
                issuer_rate(t.issuer.id),
                "initial tier",
            )
            .await
            .unwrap();

        let now = Utc::now();
        completed_job(&h, &t, now).await;
        completed_job(&h, &t, now).await;

        let period = Period {
            start: now - Duration::days(1),
            end: now + Duration::days(1),
        };
        let summary = h
            .engine
            .rollup_earnings(t.issuer.id, ActorRole::Issuer, period)
            .await
            .unwrap();
        assert_eq!(summary.jobs.len(), 2);
        assert_eq!(summary.earned_minor, 810);

        let root_summary = h
            .engine
            .rollup_earnings(t.root.id, ActorRole::Root, period)
            .await
            .unwrap();
        assert_eq!(root_summary.jobs.len(), 2);
        assert_eq!(root_summary.earned_minor, 6_690);
    }

    #[tokio::test]
    async fn job_listing_is_scoped_per_role() {
        let h = harness();
        let t = build_tree(&h.engine).await;
        let now = Utc::now();
        let job = completed_job(&h, &t, now).await;

        for (actor, role) in [
            (t.root.id, ActorRole::Root),
            (t.issuer.id, ActorRole::Issuer),
            (t.client.id, ActorRole::Client),
            (t.fulfiller.id, ActorRole::Fulfiller),
        ] {
            let jobs = h
                .engine
                .accessible_jobs(Identity::new(actor, role))
                .await
                .unwrap();
            assert_eq!(jobs.len(), 1, "role {}", role.label());
            assert_eq!(jobs[0].id, job.id);
        }

        let stranger = Identity::new(ActorId::generate(), ActorRole::Client);
        assert!(h.engine.accessible_jobs(stranger).await.unwrap().is_empty());

        assert!(h
            .engine
            .can_access_job(Identity::new(t.sub_issuer.id, ActorRole::SubIssuer), job.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn redaction_strips_everything_for_fulfillers_and_audits() {
        let h = harness();
        let t = build_tree(&h.engine).await;
        let now = Utc::now();
        let job = completed_job(&h, &t, now).await;

        let view = h
            .engine
            .filter_financial_fields(Identity::new(t.fulfiller.id, ActorRole::Fulfiller), job.id)
            .await
            .unwrap();
        assert!(view.base_cost_minor.is_none());
        assert!(view.issuer_fee_minor.is_none());
        assert!(view.total_minor.is_none());
        assert!(view.root_net_minor.is_none());

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].viewer_id, t.fulfiller.id);
        assert!(!records[0].granted);
    }

    /// Store double whose code inserts always collide, driving the bounded
    /// generation retry to exhaustion.
    struct CollidingCodeStore {
        inner: MemoryBrokerStore,
    }

    #[async_trait::async_trait]
    impl BrokerStore for CollidingCodeStore {
        async fn insert_actor(&self, actor: &Actor) -> Result<(), StoreError> {
            self.inner.insert_actor(actor).await
        }
        async fn actor(&self, id: ActorId) -> Result<Option<Actor>, StoreError> {
            self.inner.actor(id).await
        }
        async fn all_actors(&self) -> Result<Vec<Actor>, StoreError> {
            self.inner.all_actors().await
        }
        async fn edge_of(&self, id: ActorId) -> Result<Option<HierarchyEdge>, StoreError> {
            self.inner.edge_of(id).await
        }
        async fn children_of(&self, id: ActorId) -> Result<Vec<HierarchyEdge>, StoreError> {
            self.inner.children_of(id).await
        }
        async fn all_edges(&self) -> Result<Vec<HierarchyEdge>, StoreError> {
            self.inner.all_edges().await
        }
        async fn apply_edge(
            &self,
            edge: &HierarchyEdge,
            guard: Option<u64>,
        ) -> Result<HierarchyEdge, StoreError> {
            self.inner.apply_edge(edge, guard).await
        }
        async fn apply_reparent(
            &self,
            moved: &HierarchyEdge,
            moved_guard: u64,
            root_updates: &[RootUpdate],
            read_guards: &[(ActorId, u64)],
        ) -> Result<HierarchyEdge, StoreError> {
            self.inner
                .apply_reparent(moved, moved_guard, root_updates, read_guards)
                .await
        }
        async fn insert_code(&self, code: &ReferenceCode) -> Result<(), StoreError> {
            Err(StoreError::Duplicate(code.code.clone()))
        }
        async fn code_by_value(
            &self,
            normalized: &str,
        ) -> Result<Option<ReferenceCode>, StoreError> {
            self.inner.code_by_value(normalized).await
        }
        async fn code_by_id(&self, id: CodeId) -> Result<Option<ReferenceCode>, StoreError> {
            self.inner.code_by_id(id).await
        }
        async fn set_code_active(&self, id: CodeId, active: bool) -> Result<(), StoreError> {
            self.inner.set_code_active(id, active).await
        }
        async fn codes_of(&self, owner: ActorId) -> Result<Vec<ReferenceCode>, StoreError> {
            self.inner.codes_of(owner).await
        }
        async fn rate_config(&self, issuer: ActorId) -> Result<Option<RateConfig>, StoreError> {
            self.inner.rate_config(issuer).await
        }
        async fn replace_rate_config(
            &self,
            next: &RateConfig,
            change_reason: &str,
        ) -> Result<(), StoreError> {
            self.inner.replace_rate_config(next, change_reason).await
        }
        async fn rate_config_history(
            &self,
            issuer: ActorId,
        ) -> Result<Vec<crate::types::RateConfigSnapshot>, StoreError> {
            self.inner.rate_config_history(issuer).await
        }
        async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
            self.inner.insert_job(job).await
        }
        async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
            self.inner.update_job(job).await
        }
        async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
            self.inner.job(id).await
        }
        async fn jobs_matching(&self, filter: &JobAccessFilter) -> Result<Vec<Job>, StoreError> {
            self.inner.jobs_matching(filter).await
        }
        async fn completed_jobs_between(&self, period: Period) -> Result<Vec<Job>, StoreError> {
            self.inner.completed_jobs_between(period).await
        }
    }

    #[tokio::test]
    async fn code_generation_exhausts_after_bounded_attempts() {
        let store = Arc::new(CollidingCodeStore {
            inner: MemoryBrokerStore::new(),
        });
        let root = Actor::new("root", ActorRole::Root);
        store.inner.insert_actor(&root).await.unwrap();

        let engine = BrokerEngine::new(
            store,
            Arc::new(MemoryAuditSink::new()),
            BrokerEngineConfig::default(),
        );
        let err = engine
            .issue_code(root.id, ReferralPurpose::IssuerRecruitment)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::CodeGenerationExhausted { attempts: 5 }
        ));
    }

    #[tokio::test]
    async fn notification_intents_split_by_financial_visibility() {
        let h = harness();
        let t = build_tree(&h.engine).await;
        let now = Utc::now();
        let job = completed_job(&h, &t, now).await;

        let intents = h
            .engine
            .job_event_intents(JobEvent::Completed, job.id)
            .await
            .unwrap();
        assert_eq!(intents.len(), 2);
        let stripped = intents.iter().find(|i| !i.financial_fields_allowed).unwrap();
        assert!(stripped.targets.contains(&t.fulfiller.id));
    }

    #[tokio::test]
    async fn pricing_ancestor_receives_intents_without_a_slot() {
        let h = harness();
        let t = build_tree(&h.engine).await;
        h.engine
            .update_rate_config(
                Identity::new(t.issuer.id, ActorRole::Issuer),
                issuer_rate(t.issuer.id),
                "initial tier",
            )
            .await
            .unwrap();

        // The issuer priced this job through its tier but occupies no slot.
        let now = Utc::now();
        let job = h
            .engine
            .create_job(
                JobRequest {
                    client_id: t.client.id,
                    fulfiller_id: Some(t.fulfiller.id),
                    issuer_id: None,
                    sub_fulfiller_id: None,
                    sub_issuer_id: None,
                    word_count: 1_500,
                    deadline: now + Duration::days(10),
                },
                now,
            )
            .await
            .unwrap();

        let intents = h
            .engine
            .job_event_intents(JobEvent::Created, job.id)
            .await
            .unwrap();
        let all_targets: Vec<ActorId> = intents
            .iter()
            .flat_map(|i| i.targets.iter().copied())
            .collect();
        assert!(all_targets.contains(&t.issuer.id));
        assert!(all_targets.contains(&t.client.id));
    }
}
