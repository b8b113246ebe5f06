//! PostgreSQL implementation of [`BrokerStore`].
//!
//! Composite writes run in a single transaction with `version`-guarded
//! `UPDATE` statements, so a lost optimistic race surfaces as
//! [`StoreError::Conflict`] and never as a partial write. No triggers and no
//! recursive queries: listing predicates are evaluated in process against an
//! edge snapshot, exactly like the memory backend.

use async_trait::async_trait;
use chrono::Utc;
use refline_core::access::JobAccessFilter;
use refline_core::error::StoreError;
use refline_core::hierarchy::EdgeIndex;
use refline_core::memory::MemoryBrokerStore;
use refline_core::store::{BrokerStore, RootUpdate};
use refline_core::types::{
    Actor, ActorId, ActorRole, CodeId, HierarchyEdge, Job, JobId, JobStatus, Period,
    PricingBreakdown, RateConfig, RateConfigSnapshot, ReferenceCode, ReferralPurpose,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Backend selection for the engine's store dependency.
#[derive(Debug, Clone)]
pub enum BrokerStorageConfig {
    /// Keep all state in process memory only.
    Memory,
    /// Persist all state in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl BrokerStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }

    /// Build the configured backend, creating the schema when needed.
    pub async fn bootstrap(self) -> Result<Arc<dyn BrokerStore>, StoreError> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryBrokerStore::new())),
            Self::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PgBrokerStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                info!("postgres broker store ready");
                Ok(Arc::new(store))
            }
        }
    }
}

impl Default for BrokerStorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone)]
pub struct PgBrokerStore {
    pool: PgPool,
}

fn backend(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{context}: {e}"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e.as_database_error().map(|db| db.kind()),
        Some(sqlx::error::ErrorKind::UniqueViolation)
    )
}

fn role_to_str(role: ActorRole) -> &'static str {
    role.label()
}

fn parse_role(raw: &str) -> Result<ActorRole, StoreError> {
    match raw {
        "root" => Ok(ActorRole::Root),
        "issuer" => Ok(ActorRole::Issuer),
        "sub_issuer" => Ok(ActorRole::SubIssuer),
        "client" => Ok(ActorRole::Client),
        "fulfiller" => Ok(ActorRole::Fulfiller),
        other => Err(StoreError::Backend(format!("unknown role '{other}'"))),
    }
}

fn purpose_to_str(purpose: ReferralPurpose) -> &'static str {
    match purpose {
        ReferralPurpose::IssuerRecruitment => "issuer_recruitment",
        ReferralPurpose::SubIssuerRecruitment => "sub_issuer_recruitment",
        ReferralPurpose::ClientRecruitment => "client_recruitment",
        ReferralPurpose::FulfillerRecruitment => "fulfiller_recruitment",
    }
}

fn parse_purpose(raw: &str) -> Result<ReferralPurpose, StoreError> {
    match raw {
        "issuer_recruitment" => Ok(ReferralPurpose::IssuerRecruitment),
        "sub_issuer_recruitment" => Ok(ReferralPurpose::SubIssuerRecruitment),
        "client_recruitment" => Ok(ReferralPurpose::ClientRecruitment),
        "fulfiller_recruitment" => Ok(ReferralPurpose::FulfillerRecruitment),
        other => Err(StoreError::Backend(format!("unknown purpose '{other}'"))),
    }
}

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Open => "open",
        JobStatus::InProgress => "in_progress",
        JobStatus::Completed => "completed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    match raw {
        "open" => Ok(JobStatus::Open),
        "in_progress" => Ok(JobStatus::InProgress),
        "completed" => Ok(JobStatus::Completed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(StoreError::Backend(format!("unknown job status '{other}'"))),
    }
}

fn actor_from_row(row: &PgRow) -> Result<Actor, StoreError> {
    let role: String = row
        .try_get("role")
        .map_err(|e| backend("decode actor role", e))?;
    Ok(Actor {
        id: ActorId(
            row.try_get("actor_id")
                .map_err(|e| backend("decode actor id", e))?,
        ),
        display_name: row
            .try_get("display_name")
            .map_err(|e| backend("decode display name", e))?,
        role: parse_role(&role)?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| backend("decode created_at", e))?,
    })
}

fn edge_from_row(row: &PgRow) -> Result<HierarchyEdge, StoreError> {
    let level: i16 = row
        .try_get("level")
        .map_err(|e| backend("decode edge level", e))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| backend("decode edge version", e))?;
    let parent: Option<Uuid> = row
        .try_get("parent_id")
        .map_err(|e| backend("decode parent id", e))?;
    Ok(HierarchyEdge {
        actor_id: ActorId(
            row.try_get("actor_id")
                .map_err(|e| backend("decode edge actor id", e))?,
        ),
        parent_id: parent.map(ActorId),
        root_id: ActorId(
            row.try_get("root_id")
                .map_err(|e| backend("decode root id", e))?,
        ),
        level: level
            .try_into()
            .map_err(|_| StoreError::Backend("edge level out of range".to_string()))?,
        version: version
            .try_into()
            .map_err(|_| StoreError::Backend("negative edge version in storage".to_string()))?,
    })
}

fn code_from_row(row: &PgRow) -> Result<ReferenceCode, StoreError> {
    let purpose: String = row
        .try_get("purpose")
        .map_err(|e| backend("decode code purpose", e))?;
    Ok(ReferenceCode {
        id: CodeId(
            row.try_get("code_id")
                .map_err(|e| backend("decode code id", e))?,
        ),
        code: row
            .try_get("code")
            .map_err(|e| backend("decode code value", e))?,
        owner_id: ActorId(
            row.try_get("owner_id")
                .map_err(|e| backend("decode code owner", e))?,
        ),
        purpose: parse_purpose(&purpose)?,
        active: row
            .try_get("active")
            .map_err(|e| backend("decode code active flag", e))?,
        issued_at: row
            .try_get("issued_at")
            .map_err(|e| backend("decode issued_at", e))?,
    })
}

fn rate_from_row(row: &PgRow) -> Result<RateConfig, StoreError> {
    let min_words: i64 = row
        .try_get("min_words")
        .map_err(|e| backend("decode min_words", e))?;
    let max_words: i64 = row
        .try_get("max_words")
        .map_err(|e| backend("decode max_words", e))?;
    let fee_percent: i16 = row
        .try_get("issuer_fee_percent")
        .map_err(|e| backend("decode issuer_fee_percent", e))?;
    Ok(RateConfig {
        issuer_id: ActorId(
            row.try_get("issuer_id")
                .map_err(|e| backend("decode rate issuer id", e))?,
        ),
        min_words: min_words
            .try_into()
            .map_err(|_| StoreError::Backend("min_words out of range".to_string()))?,
        max_words: max_words
            .try_into()
            .map_err(|_| StoreError::Backend("max_words out of range".to_string()))?,
        rate_per_500_minor: row
            .try_get("rate_per_500_minor")
            .map_err(|e| backend("decode rate_per_500", e))?,
        issuer_fee_percent: fee_percent
            .try_into()
            .map_err(|_| StoreError::Backend("issuer_fee_percent out of range".to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| backend("decode rate updated_at", e))?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| backend("decode job status", e))?;
    let word_count: i64 = row
        .try_get("word_count")
        .map_err(|e| backend("decode word_count", e))?;
    let pricing_json: serde_json::Value = row
        .try_get("pricing")
        .map_err(|e| backend("decode job pricing", e))?;
    let pricing: PricingBreakdown = serde_json::from_value(pricing_json)
        .map_err(|e| backend("deserialize job pricing", e))?;

    let optional_actor = |column: &str| -> Result<Option<ActorId>, StoreError> {
        let id: Option<Uuid> = row
            .try_get(column)
            .map_err(|e| backend("decode job slot", e))?;
        Ok(id.map(ActorId))
    };

    Ok(Job {
        id: JobId(
            row.try_get("job_id")
                .map_err(|e| backend("decode job id", e))?,
        ),
        client_id: ActorId(
            row.try_get("client_id")
                .map_err(|e| backend("decode job client", e))?,
        ),
        fulfiller_id: optional_actor("fulfiller_id")?,
        issuer_id: optional_actor("issuer_id")?,
        sub_fulfiller_id: optional_actor("sub_fulfiller_id")?,
        sub_issuer_id: optional_actor("sub_issuer_id")?,
        word_count: word_count
            .try_into()
            .map_err(|_| StoreError::Backend("word_count out of range".to_string()))?,
        deadline: row
            .try_get("deadline")
            .map_err(|e| backend("decode job deadline", e))?,
        pricing,
        status: parse_status(&status)?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| backend("decode job created_at", e))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|e| backend("decode job completed_at", e))?,
    })
}

fn version_to_db(version: u64) -> Result<i64, StoreError> {
    version
        .try_into()
        .map_err(|_| StoreError::Backend("edge version exceeds BIGINT range".to_string()))
}

impl PgBrokerStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| backend("postgres connect failed", e))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if missing. Uniqueness of normalized code
    /// values is the only constraint the store enforces itself.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS refline_actors (
                actor_id UUID PRIMARY KEY,
                display_name TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS refline_edges (
                actor_id UUID PRIMARY KEY,
                parent_id UUID NULL,
                root_id UUID NOT NULL,
                level SMALLINT NOT NULL,
                version BIGINT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_refline_edges_parent ON refline_edges (parent_id)",
            "CREATE INDEX IF NOT EXISTS idx_refline_edges_root ON refline_edges (root_id)",
            r#"
            CREATE TABLE IF NOT EXISTS refline_codes (
                code_id UUID PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                owner_id UUID NOT NULL,
                purpose TEXT NOT NULL,
                active BOOLEAN NOT NULL,
                issued_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_refline_codes_owner ON refline_codes (owner_id)",
            r#"
            CREATE TABLE IF NOT EXISTS refline_rate_configs (
                issuer_id UUID PRIMARY KEY,
                min_words BIGINT NOT NULL,
                max_words BIGINT NOT NULL,
                rate_per_500_minor BIGINT NOT NULL,
                issuer_fee_percent SMALLINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS refline_rate_config_history (
                history_id BIGSERIAL PRIMARY KEY,
                issuer_id UUID NOT NULL,
                prior JSONB NOT NULL,
                change_reason TEXT NOT NULL,
                superseded_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_refline_rate_history_issuer ON refline_rate_config_history (issuer_id)",
            r#"
            CREATE TABLE IF NOT EXISTS refline_jobs (
                job_id UUID PRIMARY KEY,
                client_id UUID NOT NULL,
                fulfiller_id UUID NULL,
                issuer_id UUID NULL,
                sub_fulfiller_id UUID NULL,
                sub_issuer_id UUID NULL,
                word_count BIGINT NOT NULL,
                deadline TIMESTAMPTZ NOT NULL,
                pricing JSONB NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_refline_jobs_client ON refline_jobs (client_id)",
            "CREATE INDEX IF NOT EXISTS idx_refline_jobs_status ON refline_jobs (status, completed_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| backend("postgres schema create failed", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerStore for PgBrokerStore {
    async fn insert_actor(&self, actor: &Actor) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO refline_actors (actor_id, display_name, role, created_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(actor.id.0)
        .bind(&actor.display_name)
        .bind(role_to_str(actor.role))
        .bind(actor.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(actor.id.to_string())
            } else {
                backend("insert actor failed", e)
            }
        })?;
        Ok(())
    }

    async fn actor(&self, id: ActorId) -> Result<Option<Actor>, StoreError> {
        let row = sqlx::query("SELECT * FROM refline_actors WHERE actor_id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("load actor failed", e))?;
        row.as_ref().map(actor_from_row).transpose()
    }

    async fn all_actors(&self) -> Result<Vec<Actor>, StoreError> {
        let rows = sqlx::query("SELECT * FROM refline_actors ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("load actors failed", e))?;
        rows.iter().map(actor_from_row).collect()
    }

    async fn edge_of(&self, id: ActorId) -> Result<Option<HierarchyEdge>, StoreError> {
        let row = sqlx::query("SELECT * FROM refline_edges WHERE actor_id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("load edge failed", e))?;
        row.as_ref().map(edge_from_row).transpose()
    }

    async fn children_of(&self, id: ActorId) -> Result<Vec<HierarchyEdge>, StoreError> {
        let rows = sqlx::query("SELECT * FROM refline_edges WHERE parent_id = $1")
            .bind(id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("load children failed", e))?;
        rows.iter().map(edge_from_row).collect()
    }

    async fn all_edges(&self) -> Result<Vec<HierarchyEdge>, StoreError> {
        let rows = sqlx::query("SELECT * FROM refline_edges")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("load edges failed", e))?;
        rows.iter().map(edge_from_row).collect()
    }

    async fn apply_edge(
        &self,
        edge: &HierarchyEdge,
        guard: Option<u64>,
    ) -> Result<HierarchyEdge, StoreError> {
        let next_version = match guard {
            None => {
                let result = sqlx::query(
                    "INSERT INTO refline_edges (actor_id, parent_id, root_id, level, version) \
                     VALUES ($1, $2, $3, $4, 1) \
                     ON CONFLICT (actor_id) DO NOTHING",
                )
                .bind(edge.actor_id.0)
                .bind(edge.parent_id.map(|p| p.0))
                .bind(edge.root_id.0)
                .bind(i16::from(edge.level))
                .execute(&self.pool)
                .await
                .map_err(|e| backend("insert edge failed", e))?;
                // An existing row the caller did not expect is a lost race.
                if result.rows_affected() == 0 {
                    return Err(StoreError::Conflict);
                }
                1
            }
            Some(expected) => {
                let result = sqlx::query(
                    "UPDATE refline_edges \
                     SET parent_id = $2, root_id = $3, level = $4, version = version + 1 \
                     WHERE actor_id = $1 AND version = $5",
                )
                .bind(edge.actor_id.0)
                .bind(edge.parent_id.map(|p| p.0))
                .bind(edge.root_id.0)
                .bind(i16::from(edge.level))
                .bind(version_to_db(expected)?)
                .execute(&self.pool)
                .await
                .map_err(|e| backend("update edge failed", e))?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::Conflict);
                }
                expected + 1
            }
        };

        Ok(HierarchyEdge {
            version: next_version,
            ..edge.clone()
        })
    }

    async fn apply_reparent(
        &self,
        moved: &HierarchyEdge,
        moved_guard: u64,
        root_updates: &[RootUpdate],
        read_guards: &[(ActorId, u64)],
    ) -> Result<HierarchyEdge, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("begin reparent tx failed", e))?;

        // Rows the write set was derived from but does not touch (the new
        // parent). Lock them for the duration of the transaction and verify
        // the caller's snapshot is still current.
        for (actor_id, expected) in read_guards {
            let row = sqlx::query(
                "SELECT version FROM refline_edges WHERE actor_id = $1 FOR SHARE",
            )
            .bind(actor_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| backend("reparent read guard failed", e))?;
            let current: i64 = match row {
                Some(row) => row
                    .try_get("version")
                    .map_err(|e| backend("decode guard version", e))?,
                None => return Err(StoreError::Conflict),
            };
            if current != version_to_db(*expected)? {
                return Err(StoreError::Conflict);
            }
        }

        let result = sqlx::query(
            "UPDATE refline_edges \
             SET parent_id = $2, root_id = $3, level = $4, version = version + 1 \
             WHERE actor_id = $1 AND version = $5",
        )
        .bind(moved.actor_id.0)
        .bind(moved.parent_id.map(|p| p.0))
        .bind(moved.root_id.0)
        .bind(i16::from(moved.level))
        .bind(version_to_db(moved_guard)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("reparent moved edge failed", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }

        for update in root_updates {
            let result = sqlx::query(
                "UPDATE refline_edges \
                 SET root_id = $2, version = version + 1 \
                 WHERE actor_id = $1 AND version = $3",
            )
            .bind(update.actor_id.0)
            .bind(update.new_root_id.0)
            .bind(version_to_db(update.expected_version)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("reparent root rewrite failed", e))?;
            // Dropping the transaction rolls back the moved edge too.
            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict);
            }
        }

        tx.commit()
            .await
            .map_err(|e| backend("commit reparent tx failed", e))?;

        Ok(HierarchyEdge {
            version: moved_guard + 1,
            ..moved.clone()
        })
    }

    async fn insert_code(&self, code: &ReferenceCode) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO refline_codes (code_id, code, owner_id, purpose, active, issued_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(code.id.0)
        .bind(&code.code)
        .bind(code.owner_id.0)
        .bind(purpose_to_str(code.purpose))
        .bind(code.active)
        .bind(code.issued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(code.code.clone())
            } else {
                backend("insert code failed", e)
            }
        })?;
        Ok(())
    }

    async fn code_by_value(&self, normalized: &str) -> Result<Option<ReferenceCode>, StoreError> {
        let row = sqlx::query("SELECT * FROM refline_codes WHERE code = $1")
            .bind(normalized)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("load code failed", e))?;
        row.as_ref().map(code_from_row).transpose()
    }

    async fn code_by_id(&self, id: CodeId) -> Result<Option<ReferenceCode>, StoreError> {
        let row = sqlx::query("SELECT * FROM refline_codes WHERE code_id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("load code failed", e))?;
        row.as_ref().map(code_from_row).transpose()
    }

    async fn set_code_active(&self, id: CodeId, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE refline_codes SET active = $2 WHERE code_id = $1")
            .bind(id.0)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(|e| backend("update code failed", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!("unknown code id {id}")));
        }
        Ok(())
    }

    async fn codes_of(&self, owner: ActorId) -> Result<Vec<ReferenceCode>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM refline_codes WHERE owner_id = $1 ORDER BY issued_at ASC")
                .bind(owner.0)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| backend("load codes failed", e))?;
        rows.iter().map(code_from_row).collect()
    }

    async fn rate_config(&self, issuer: ActorId) -> Result<Option<RateConfig>, StoreError> {
        let row = sqlx::query("SELECT * FROM refline_rate_configs WHERE issuer_id = $1")
            .bind(issuer.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("load rate config failed", e))?;
        row.as_ref().map(rate_from_row).transpose()
    }

    async fn replace_rate_config(
        &self,
        next: &RateConfig,
        change_reason: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("begin rate tx failed", e))?;

        let prior = sqlx::query(
            "SELECT * FROM refline_rate_configs WHERE issuer_id = $1 FOR UPDATE",
        )
        .bind(next.issuer_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| backend("load prior rate failed", e))?;

        if let Some(row) = prior {
            let prior_config = rate_from_row(&row)?;
            let payload = serde_json::to_value(&prior_config)
                .map_err(|e| backend("serialize prior rate failed", e))?;
            sqlx::query(
                "INSERT INTO refline_rate_config_history \
                 (issuer_id, prior, change_reason, superseded_at) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(next.issuer_id.0)
            .bind(payload)
            .bind(change_reason)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("insert rate history failed", e))?;
        }

        sqlx::query(
            "INSERT INTO refline_rate_configs \
             (issuer_id, min_words, max_words, rate_per_500_minor, issuer_fee_percent, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (issuer_id) DO UPDATE SET \
                 min_words = EXCLUDED.min_words, \
                 max_words = EXCLUDED.max_words, \
                 rate_per_500_minor = EXCLUDED.rate_per_500_minor, \
                 issuer_fee_percent = EXCLUDED.issuer_fee_percent, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(next.issuer_id.0)
        .bind(i64::from(next.min_words))
        .bind(i64::from(next.max_words))
        .bind(next.rate_per_500_minor)
        .bind(i16::from(next.issuer_fee_percent))
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("upsert rate config failed", e))?;

        tx.commit()
            .await
            .map_err(|e| backend("commit rate tx failed", e))
    }

    async fn rate_config_history(
        &self,
        issuer: ActorId,
    ) -> Result<Vec<RateConfigSnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT prior, change_reason, superseded_at \
             FROM refline_rate_config_history \
             WHERE issuer_id = $1 ORDER BY history_id ASC",
        )
        .bind(issuer.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("load rate history failed", e))?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row
                .try_get("prior")
                .map_err(|e| backend("decode prior rate", e))?;
            snapshots.push(RateConfigSnapshot {
                prior: serde_json::from_value(payload)
                    .map_err(|e| backend("deserialize prior rate", e))?,
                change_reason: row
                    .try_get("change_reason")
                    .map_err(|e| backend("decode change reason", e))?,
                superseded_at: row
                    .try_get("superseded_at")
                    .map_err(|e| backend("decode superseded_at", e))?,
            });
        }
        Ok(snapshots)
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let pricing = serde_json::to_value(&job.pricing)
            .map_err(|e| backend("serialize job pricing", e))?;
        sqlx::query(
            "INSERT INTO refline_jobs \
             (job_id, client_id, fulfiller_id, issuer_id, sub_fulfiller_id, sub_issuer_id, \
              word_count, deadline, pricing, status, created_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(job.id.0)
        .bind(job.client_id.0)
        .bind(job.fulfiller_id.map(|a| a.0))
        .bind(job.issuer_id.map(|a| a.0))
        .bind(job.sub_fulfiller_id.map(|a| a.0))
        .bind(job.sub_issuer_id.map(|a| a.0))
        .bind(i64::from(job.word_count))
        .bind(job.deadline)
        .bind(pricing)
        .bind(status_to_str(job.status))
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(job.id.to_string())
            } else {
                backend("insert job failed", e)
            }
        })?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let pricing = serde_json::to_value(&job.pricing)
            .map_err(|e| backend("serialize job pricing", e))?;
        let result = sqlx::query(
            "UPDATE refline_jobs SET \
                 fulfiller_id = $2, issuer_id = $3, sub_fulfiller_id = $4, sub_issuer_id = $5, \
                 word_count = $6, deadline = $7, pricing = $8, status = $9, completed_at = $10 \
             WHERE job_id = $1",
        )
        .bind(job.id.0)
        .bind(job.fulfiller_id.map(|a| a.0))
        .bind(job.issuer_id.map(|a| a.0))
        .bind(job.sub_fulfiller_id.map(|a| a.0))
        .bind(job.sub_issuer_id.map(|a| a.0))
        .bind(i64::from(job.word_count))
        .bind(job.deadline)
        .bind(pricing)
        .bind(status_to_str(job.status))
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("update job failed", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!("unknown job id {}", job.id)));
        }
        Ok(())
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM refline_jobs WHERE job_id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("load job failed", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn jobs_matching(&self, filter: &JobAccessFilter) -> Result<Vec<Job>, StoreError> {
        // Predicate evaluation happens in process against an edge snapshot;
        // the database never runs hierarchy logic.
        let index = EdgeIndex::from_edges(self.all_edges().await?);
        let rows = sqlx::query("SELECT * FROM refline_jobs ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("load jobs failed", e))?;

        let mut jobs = Vec::new();
        for row in &rows {
            let job = job_from_row(row)?;
            if filter.matches(&job, &index) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn completed_jobs_between(&self, period: Period) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM refline_jobs \
             WHERE status = 'completed' AND completed_at BETWEEN $1 AND $2 \
             ORDER BY completed_at ASC",
        )
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("load completed jobs failed", e))?;
        rows.iter().map(job_from_row).collect()
    }
}
