//! Shard backend connections
//!
//! One [`ShardBackend`] is a single logical connection to one cache-backend
//! shard. The trait seam exists so tests can inject in-memory backends; the
//! production implementation rides on a multiplexed async Redis connection.

use crate::error::{Result, RouterError};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Write operation supported by a shard backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
    Set,
    Lpush,
    Rpush,
}

impl WriteOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOp::Set => "set",
            WriteOp::Lpush => "lpush",
            WriteOp::Rpush => "rpush",
        }
    }
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteOp {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "set" => Ok(WriteOp::Set),
            "lpush" => Ok(WriteOp::Lpush),
            "rpush" => Ok(WriteOp::Rpush),
            other => Err(RouterError::Configuration(format!(
                "invalid op {}, supported ops are: set, lpush and rpush",
                other
            ))),
        }
    }
}

/// Connection coordinates for one shard master
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            db: 0,
        }
    }

    pub fn with_auth(mut self, password: Option<String>, db: i64) -> Self {
        self.password = password;
        self.db = db;
        self
    }

    /// Connection URL understood by the redis client
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Write-side operations on one shard
#[async_trait]
pub trait ShardBackend: Send {
    async fn set(&mut self, key: &str, data: &[u8]) -> Result<()>;
    async fn lpush(&mut self, key: &str, data: &[u8]) -> Result<()>;
    async fn rpush(&mut self, key: &str, data: &[u8]) -> Result<()>;

    /// Liveness probe; false means the shard is unreachable
    async fn ping(&mut self) -> bool;

    async fn execute(&mut self, op: WriteOp, key: &str, data: &[u8]) -> Result<()> {
        match op {
            WriteOp::Set => self.set(key, data).await,
            WriteOp::Lpush => self.lpush(key, data).await,
            WriteOp::Rpush => self.rpush(key, data).await,
        }
    }
}

/// Read-side operations on one shard
#[async_trait]
pub trait ReadBackend: Send {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn lpop(&mut self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn rpop(&mut self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Factory for shard backends, the injection point for tests
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ShardBackend>>;
}

/// Production backend over a multiplexed async Redis connection
pub struct RedisBackend {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisBackend {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let client = redis::Client::open(endpoint.url())?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl ShardBackend for RedisBackend {
    async fn set(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let _: () = self.connection.set(key, data).await?;
        Ok(())
    }

    async fn lpush(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let _: () = self.connection.lpush(key, data).await?;
        Ok(())
    }

    async fn rpush(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let _: () = self.connection.rpush(key, data).await?;
        Ok(())
    }

    async fn ping(&mut self) -> bool {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.connection)
            .await
            .is_ok()
    }
}

#[async_trait]
impl ReadBackend for RedisBackend {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let data: Option<Vec<u8>> = self.connection.get(key).await?;
        Ok(data)
    }

    async fn lpop(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let data: Option<Vec<u8>> = self.connection.lpop(key, None).await?;
        Ok(data)
    }

    async fn rpop(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let data: Option<Vec<u8>> = self.connection.rpop(key, None).await?;
        Ok(data)
    }
}

/// Default connector used outside of tests
#[derive(Debug, Clone, Default)]
pub struct RedisConnector;

#[async_trait]
impl BackendConnector for RedisConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ShardBackend>> {
        Ok(Box::new(RedisBackend::connect(endpoint).await?))
    }
}
