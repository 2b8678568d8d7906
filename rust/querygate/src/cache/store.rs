//! Key-value store port used by the container reconciler, plus the Valkey/Redis adapter.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache command failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// One cursor step over the members of the sorted set at `index`. Start with cursor
    /// 0; a returned cursor of 0 means the scan is complete.
    async fn scan_page(
        &self,
        index: &str,
        cursor: u64,
        page_size: usize,
    ) -> Result<(u64, Vec<String>), CacheError>;

    /// Every member of the sorted set at `index`, fetched with cursor paging.
    async fn scan_index(&self, index: &str, page_size: usize) -> Result<Vec<String>, CacheError> {
        let mut members = Vec::new();
        let mut cursor = 0;
        let mut pages = 0usize;
        loop {
            let (next, page) = self.scan_page(index, cursor, page_size).await?;
            members.extend(page);
            pages += 1;
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!(index, members = members.len(), pages, "scanned cache index");
        Ok(members)
    }

    /// Writes a JSON blob without expiry and adds `member` to `index` with score 0.
    async fn upsert_entry(
        &self,
        data_key: &str,
        json: &str,
        index: &str,
        member: &str,
    ) -> Result<(), CacheError>;

    async fn delete_keys(&self, keys: &[String]) -> Result<(), CacheError>;

    async fn remove_members(&self, index: &str, members: &[String]) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Valkey/Redis adapter over a shared, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("connected to cache store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn scan_page(
        &self,
        index: &str,
        cursor: u64,
        page_size: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        let mut conn = self.conn.clone();
        // ZSCAN replies with the next cursor and a flat member/score list.
        let (next, page): (u64, Vec<String>) = redis::cmd("ZSCAN")
            .arg(index)
            .arg(cursor)
            .arg("MATCH")
            .arg("*")
            .arg("COUNT")
            .arg(page_size)
            .query_async(&mut conn)
            .await?;
        Ok((next, page.into_iter().step_by(2).collect()))
    }

    async fn upsert_entry(
        &self,
        data_key: &str,
        json: &str,
        index: &str,
        member: &str,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .set(data_key, json)
            .ignore()
            .zadd(index, member, 0)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn remove_members(&self, index: &str, members: &[String]) -> Result<(), CacheError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(index, members).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(CacheError::Other(format!("unexpected PING reply: {reply}")))
        }
    }
}
