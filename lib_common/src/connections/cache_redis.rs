//! # Redis Client Pool
//!
//! Provides the gateway's Redis connection policy: one shared multiplexed
//! manager for ordinary commands, a dedicated connection per blocking stream
//! reader, and a dedicated client for pub/sub. Blocking reads (XREAD/XREADGROUP
//! with BLOCK) stall whatever connection they run on, so they must never share
//! one with the command path.

use redis::aio::{ConnectionManager, MultiplexedConnection, PubSub};
use redis::{Client, RedisResult};

/// Connection parameters for the Redis instance.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    /// Redis host name or address.
    pub host: String,
    /// Redis TCP port.
    pub port: u16,
    /// Optional AUTH password.
    pub password: Option<String>,
}

impl RedisSettings {
    /// Renders the settings as a `redis://` connection URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

/// A handler for Redis interactions.
#[derive(Clone)]
pub struct CacheHandler {
    client: Client,
    manager: ConnectionManager,
}

impl CacheHandler {
    /// Opens the client and establishes the shared command connection.
    pub async fn connect(settings: &RedisSettings) -> RedisResult<Self> {
        // Open the connection to the redis server
        let client = Client::open(settings.url())?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { client, manager })
    }

    /// A cheap clone of the shared command connection. Reconnects internally,
    /// suitable for GET/SET/XADD and pipelines.
    pub fn commands(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// A fresh connection owned exclusively by one blocking consumer task.
    pub async fn dedicated(&self) -> RedisResult<MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }

    /// A dedicated pub/sub connection. Must not be used for other commands.
    pub async fn pubsub(&self) -> RedisResult<PubSub> {
        self.client.get_async_pubsub().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_without_password() {
        let settings = RedisSettings {
            host: "127.0.0.1".into(),
            port: 6379,
            password: None,
        };
        assert_eq!(settings.url(), "redis://127.0.0.1:6379/");
    }

    #[test]
    fn url_with_password() {
        let settings = RedisSettings {
            host: "cache.internal".into(),
            port: 6380,
            password: Some("hunter2".into()),
        };
        assert_eq!(settings.url(), "redis://:hunter2@cache.internal:6380/");
    }
}
