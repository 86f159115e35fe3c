pub mod keys;
pub mod memory;
pub mod models;
pub mod queries;
pub mod redis_cache;

use std::collections::HashMap;

use async_trait::async_trait;

pub use keys::CacheKey;
pub use memory::MemoryCache;
pub use queries::QueryService;
pub use redis_cache::RedisCache;

/// One write against the cache. A projected event becomes a list of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Set the given fields on a hash, leaving other fields alone.
    HashPut {
        key: String,
        fields: Vec<(String, String)>,
    },
    HashDelete { key: String, field: String },
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Self::HashPut { key, .. }
            | Self::HashDelete { key, .. }
            | Self::SetAdd { key, .. }
            | Self::SetRemove { key, .. } => key,
        }
    }
}

/// Key-value store with hash and set primitives.
///
/// Single-key operations are atomic. `apply` sends a whole plan in one round
/// trip but is not a transaction: a failure part way can leave earlier
/// mutations applied.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn apply(&self, plan: &[Mutation]) -> Result<(), CacheError>;

    /// All fields of a hash. A missing key reads as an empty map.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;

    /// Members of a set, in no particular order. A missing key reads as empty.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache command error: {0}")]
    Command(String),

    #[error("corrupt cache entry at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}
