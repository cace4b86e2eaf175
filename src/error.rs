//! Error types for the proxy-rotation-pool crate.

use thiserror::Error;

/// Errors produced by the pool, the cache store and the durable store.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No dispatchable detail is available in a rotation queue right now.
    /// Recoverable: the caller should try another queue or back off.
    #[error("rotation queue '{0}' is empty")]
    RotationQueueEmpty(String),

    /// A detail's recorded queue disagrees with the queue operating on it,
    /// or a detail references queue/proxy records the cache does not hold.
    #[error("rotation queue state invalid: {0}")]
    RotationQueueInvalid(String),

    /// Reserved seed/aggregate queue ids collide or their rows do not match
    /// the configured sentinel domains.
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),

    /// The durable store stayed unreachable for the full retry budget.
    #[error("connection to {target} exhausted after {attempts} attempts")]
    ConnectionExhausted { target: String, attempts: usize },

    /// An insert collided with an existing unique record. Recoverable: the
    /// existing record is the one to use.
    #[error("duplicate entity: {0}")]
    DuplicateEntity(String),

    /// A changed detail could not be resolved to durable ids during
    /// write-back. Lost or inconsistent state; must not be dropped silently.
    #[error("reconciliation failure: {0}")]
    ReconciliationFailure(String),

    /// A cache or durable record could not be decoded.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// Underlying store error (redis / postgres / in-memory backend).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl PoolError {
    /// Whether the caller can handle this locally (retry, skip, use the
    /// existing record) as opposed to aborting the operation or process.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PoolError::RotationQueueEmpty(_) | PoolError::DuplicateEntity(_)
        )
    }
}

impl From<redis::RedisError> for PoolError {
    fn from(e: redis::RedisError) -> Self {
        PoolError::Backend(e.to_string())
    }
}

impl From<sqlx::Error> for PoolError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = e {
            if db.kind() == sqlx::error::ErrorKind::UniqueViolation {
                return PoolError::DuplicateEntity(db.to_string());
            }
        }
        PoolError::Backend(e.to_string())
    }
}
