use thiserror::Error;

/// Storage-boundary failures. Infrastructure errors stay in `Backend` and are
/// never rewritten as domain errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("optimistic write conflict")]
    Conflict,

    #[error("unique constraint violated: {0}")]
    Duplicate(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Terminal, typed domain failures. None of these are retried automatically
/// except code generation and optimistic reparent conflicts, both bounded.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("reference code is invalid or inactive")]
    InvalidOrInactiveCode,

    #[error("reference code generation exhausted after {attempts} attempts")]
    CodeGenerationExhausted { attempts: u32 },

    #[error("requester does not own this reference code")]
    NotOwner,

    #[error("reparenting would create a cycle through actor {actor_id}")]
    CircularHierarchy { actor_id: crate::types::ActorId },

    #[error("role '{role}' cannot sit at level {level}")]
    HierarchyLevelMismatch { role: &'static str, level: u8 },

    #[error("requester is not authorized for this operation")]
    Unauthorized,

    #[error("word count {words} outside allowed range {min}..={max}")]
    WordCountOutOfRange { words: u32, min: u32, max: u32 },

    #[error("rate configuration invalid: {0}")]
    RateConfigInvalid(String),

    #[error("concurrent hierarchy update conflict, retries exhausted")]
    Conflict,

    #[error("actor {0} is not placed in the hierarchy")]
    NotPlaced(crate::types::ActorId),

    #[error("unknown job {0}")]
    UnknownJob(crate::types::JobId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    pub fn rate_invalid(detail: impl Into<String>) -> Self {
        Self::RateConfigInvalid(detail.into())
    }
}
