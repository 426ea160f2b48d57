//! Storage backend contract and its Redis implementation.
//!
//! Key shapes:
//! - `hashrate` / `hashrate:{login}` — timestamp-scored share samples,
//!   trimmed to the hashrate window
//! - `round:{height}` — per-login share difficulty for round accounting
//! - `blocks:candidates` — block solutions awaiting confirmation
//! - `node:{name}` — last reported node state
//! - `bans` / `blacklist` — policy mirroring

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Share/round/state persistence consumed by the proxy. Implementations
/// must be safe to call concurrently; failures are reported, never panicked.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn write_share(
        &self,
        login: &str,
        worker: &str,
        ip: &str,
        difficulty: u64,
        height: u64,
        timestamp: i64,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn write_block_candidate(
        &self,
        login: &str,
        worker: &str,
        ip: &str,
        height: u64,
        nonce: &str,
        header: &str,
        difficulty: u64,
        timestamp: i64,
    ) -> Result<()>;

    async fn write_node_state(&self, name: &str, height: u64, difficulty: &str) -> Result<()>;

    async fn write_banned_ip(&self, ip: &str) -> Result<()>;

    async fn blacklisted_logins(&self) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
}

pub struct RedisBackend {
    client: redis::Client,
    connection: Arc<RwLock<Option<redis::aio::ConnectionManager>>>,
    hashrate_window: Duration,
}

impl RedisBackend {
    pub fn new(redis_url: &str, hashrate_window: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("failed to create redis client: {}", e))?;
        Ok(Self { client, connection: Arc::new(RwLock::new(None)), hashrate_window })
    }

    async fn connection(&self) -> Result<redis::aio::ConnectionManager> {
        {
            let guard = self.connection.read().await;
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }
        }
        let mut guard = self.connection.write().await;
        if guard.is_none() {
            let manager = self
                .client
                .get_connection_manager()
                .await
                .map_err(|e| anyhow!("failed to connect to redis: {}", e))?;
            *guard = Some(manager);
        }
        Ok(guard.clone().unwrap())
    }

    async fn record_sample(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        login: &str,
        sample: &str,
        timestamp: i64,
    ) -> Result<()> {
        let window = self.hashrate_window.as_secs() as i64;
        let cutoff = timestamp.saturating_sub(window);

        for key in ["hashrate".to_string(), format!("hashrate:{}", login)] {
            conn.zadd::<_, _, _, ()>(&key, sample, timestamp).await?;
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(&key)
                .arg(0)
                .arg(cutoff)
                .query_async::<_, ()>(conn)
                .await?;
            let _: () = conn.expire(&key, window + 3600).await.unwrap_or(());
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn write_share(
        &self,
        login: &str,
        worker: &str,
        ip: &str,
        difficulty: u64,
        height: u64,
        timestamp: i64,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        let sample = format!("{}:{}:{}:{}:{}", timestamp, difficulty, login, worker, ip);
        self.record_sample(&mut conn, login, &sample, timestamp).await?;

        conn.hincr::<_, _, _, ()>(format!("round:{}", height), login, difficulty)
            .await?;
        conn.set::<_, _, ()>(format!("miner:{}:last_share", login), timestamp)
            .await?;
        Ok(())
    }

    async fn write_block_candidate(
        &self,
        login: &str,
        worker: &str,
        ip: &str,
        height: u64,
        nonce: &str,
        header: &str,
        difficulty: u64,
        timestamp: i64,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        let sample = format!("{}:{}:{}:{}:{}", timestamp, difficulty, login, worker, ip);
        self.record_sample(&mut conn, login, &sample, timestamp).await?;

        conn.hincr::<_, _, _, ()>(format!("round:{}", height), login, difficulty)
            .await?;
        let candidate = serde_json::json!({
            "login": login,
            "worker": worker,
            "ip": ip,
            "height": height,
            "nonce": nonce,
            "header": header,
            "difficulty": difficulty,
            "timestamp": timestamp,
        });
        conn.lpush::<_, _, ()>("blocks:candidates", candidate.to_string())
            .await?;
        conn.hincr::<_, _, _, ()>(format!("miner:{}:stats", login), "blocks", 1)
            .await?;
        Ok(())
    }

    async fn write_node_state(&self, name: &str, height: u64, difficulty: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let now = chrono::Utc::now().timestamp();
        conn.hset_multiple::<_, _, _, ()>(
            format!("node:{}", name),
            &[
                ("height", height.to_string()),
                ("difficulty", difficulty.to_string()),
                ("last_beat", now.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn write_banned_ip(&self, ip: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.sadd::<_, _, ()>("bans", ip).await?;
        Ok(())
    }

    async fn blacklisted_logins(&self) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let logins: Vec<String> = conn.smembers("blacklist").await?;
        Ok(logins)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
