// Redis-backed fixed-window rate limiter for the submission endpoint.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

#[derive(Clone)]
pub struct CacheService {
    conn: ConnectionManager,
}

impl CacheService {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Fixed-window counter. Returns (allowed, remaining, reset_in_seconds).
    pub async fn check_rate_limit(
        &self,
        key: &str,
        max_requests: u32,
        window_seconds: u64,
    ) -> Result<(bool, u32, u64), redis::RedisError> {
        let mut conn = self.conn.clone();
        let cache_key = format!("ratelimit:{key}");

        let current: u32 = conn.get(&cache_key).await.unwrap_or(0);
        if current >= max_requests {
            let ttl: i64 = conn.ttl(&cache_key).await.unwrap_or(0);
            return Ok((false, 0, ttl.max(0) as u64));
        }

        let new_count: u32 = conn.incr(&cache_key, 1).await?;
        if new_count == 1 {
            let _: () = conn.expire(&cache_key, window_seconds as i64).await?;
        }

        let ttl: i64 = conn.ttl(&cache_key).await.unwrap_or(window_seconds as i64);
        let remaining = max_requests.saturating_sub(new_count);
        Ok((true, remaining, ttl.max(0) as u64))
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await.is_ok()
    }
}
