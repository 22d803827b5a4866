use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

use crate::{BloomParams, Client, CustomRedisError};

pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    /// Connects without timeouts: commands block until redis answers.
    pub async fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        Self::with_config(addr, None, None).await
    }

    /// `None` disables the corresponding timeout. `Duration::ZERO` is rejected.
    pub async fn with_config(
        addr: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        if response_timeout.is_some_and(|t| t.is_zero())
            || connection_timeout.is_some_and(|t| t.is_zero())
        {
            return Err(CustomRedisError::InvalidConfiguration(
                "redis timeouts cannot be zero, use None for no timeout".to_string(),
            ));
        }

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }
        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisClient { connection })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(k).await?;
        value.ok_or(CustomRedisError::NotFound)
    }

    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(k, v, seconds).await?;
        Ok(())
    }

    async fn bf_insert_expire_nx(
        &self,
        k: String,
        item: String,
        params: BloomParams,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();

        // BF.INSERT creates the filter with our parameters when missing, where
        // BF.ADD would fall back to the server defaults. EXPIRE NX needs redis 7.
        let (added,): (Vec<bool>,) = redis::pipe()
            .atomic()
            .cmd("BF.INSERT")
            .arg(&k)
            .arg("CAPACITY")
            .arg(params.capacity)
            .arg("ERROR")
            .arg(params.error_rate)
            .arg("NONSCALING")
            .arg("ITEMS")
            .arg(&item)
            .cmd("EXPIRE")
            .arg(&k)
            .arg(params.ttl_seconds)
            .arg("NX")
            .ignore()
            .query_async(&mut conn)
            .await?;

        added.first().copied().ok_or_else(|| {
            CustomRedisError::ParseError(format!("empty BF.INSERT reply for key {k}"))
        })
    }
}
