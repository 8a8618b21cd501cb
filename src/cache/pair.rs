//! Read/write client split over one cache cluster.
//!
//! The writer always points at the master and carries every mutation and
//! lock operation. The reader points at a replica when one is configured or
//! discoverable and serves only lookup-cache GETs; it falls back to the
//! writer otherwise.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use super::backend::CacheBackend;
use super::redis::{resolve_via_sentinel, RedisBackend};
use crate::config::CacheConfig;

#[derive(Clone)]
pub struct CachePair {
    pub writer: Arc<dyn CacheBackend>,
    pub reader: Arc<dyn CacheBackend>,
}

impl CachePair {
    pub fn new(writer: Arc<dyn CacheBackend>, reader: Arc<dyn CacheBackend>) -> Self {
        Self { writer, reader }
    }

    /// Single backend serving both roles (tests, local runs).
    pub fn single(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            writer: Arc::clone(&backend),
            reader: backend,
        }
    }

    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        let (master_url, replica_url) = match &config.sentinel_hosts {
            Some(hosts) => {
                let (master, replica) =
                    resolve_via_sentinel(hosts, &config.sentinel_master_name).await?;
                info!(master = %master, replica = ?replica, "resolved cache endpoints via sentinel");
                (master, replica)
            }
            None => (config.url.clone(), config.replica_url.clone()),
        };

        let writer: Arc<dyn CacheBackend> = Arc::new(RedisBackend::connect(&master_url).await?);
        let reader: Arc<dyn CacheBackend> = match replica_url {
            Some(url) => match RedisBackend::connect(&url).await {
                Ok(backend) => Arc::new(backend),
                Err(err) => {
                    tracing::warn!(error = %err, "replica unreachable, reads fall back to master");
                    Arc::clone(&writer)
                }
            },
            None => Arc::clone(&writer),
        };

        Ok(Self { writer, reader })
    }
}
