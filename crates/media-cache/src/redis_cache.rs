use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands, cmd};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use tracing::{debug, error};

use crate::{Cache, CacheError, Mutation};

/// Cache backed by a Redis server through a connection pool.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool for `url`. No connection is opened until first use.
    pub fn connect(url: &str) -> Result<Self, CacheError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<Connection, CacheError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            CacheError::Connection(e.to_string())
        })
    }
}

fn command_error(e: redis::RedisError) -> CacheError {
    CacheError::Command(e.to_string())
}

#[async_trait]
impl Cache for RedisCache {
    async fn apply(&self, plan: &[Mutation]) -> Result<(), CacheError> {
        if plan.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for mutation in plan {
            match mutation {
                // HSET with no field/value pairs is a syntax error.
                Mutation::HashPut { fields, .. } if fields.is_empty() => {}
                Mutation::HashPut { key, fields } => {
                    pipe.hset_multiple(key, fields.as_slice()).ignore();
                }
                Mutation::HashDelete { key, field } => {
                    pipe.hdel(key, field).ignore();
                }
                Mutation::SetAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                Mutation::SetRemove { key, member } => {
                    pipe.srem(key, member).ignore();
                }
            }
        }

        let mut conn = self.conn().await?;
        let _: () = pipe.query_async(&mut conn).await.map_err(command_error)?;

        debug!(mutations = plan.len(), "Applied cache mutations");
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.hgetall(key).await.map_err(command_error)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.hget(key, field).await.map_err(command_error)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        conn.smembers(key).await.map_err(command_error)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }
}
