//! Distributed lease primitive used by the file discovery batcher (C3).
//!
//! A lease is a Redis key holding an opaque owner token with a TTL. Acquiring
//! is a `SET NX EX`; renewing and releasing both go through a Lua script that
//! compares the stored token before mutating the key, so a worker that lost
//! ownership (e.g. after a GC pause past the TTL) can never clobber the new
//! owner's lease.

use crate::SharedConnectionManager;
use redis::RedisError;
use uuid::Uuid;

/// Renew only if the caller still owns the key; otherwise leave it untouched.
const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Release only if the caller still owns the key.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// A held lease on `key`, identified by a random `token`. Dropping this value
/// does not release the lease; call [`DistributedLease::release`] explicitly.
pub struct DistributedLease {
    key: String,
    token: String,
}

impl DistributedLease {
    /// Attempt to acquire `key` for `ttl_ms` milliseconds. Returns `None` if
    /// another owner currently holds it.
    pub async fn acquire(
        manager: &SharedConnectionManager,
        key: &str,
        ttl_ms: u64,
    ) -> Result<Option<Self>, RedisError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = manager.lock().await;
        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, Option<String>>(&mut *conn)
            .await
            .map(|r| r.is_some())?;

        if acquired {
            Ok(Some(Self {
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Atomically verify ownership and extend the TTL. Returns `false` if
    /// ownership was lost (another worker's token is now stored).
    pub async fn renew(
        &self,
        manager: &SharedConnectionManager,
        ttl_ms: u64,
    ) -> Result<bool, RedisError> {
        let mut conn = manager.lock().await;
        let result: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await?;
        Ok(result == 1)
    }

    /// Check-on-write: verify ownership without mutating the TTL. Callers
    /// must invoke this immediately before any side-effecting emission.
    pub async fn verify_owned(&self, manager: &SharedConnectionManager) -> Result<bool, RedisError> {
        let mut conn = manager.lock().await;
        let stored: Option<String> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut *conn)
            .await?;
        Ok(stored.as_deref() == Some(self.token.as_str()))
    }

    /// Atomically release the lease if still owned.
    pub async fn release(&self, manager: &SharedConnectionManager) -> Result<bool, RedisError> {
        let mut conn = manager.lock().await;
        let result: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut *conn)
            .await?;
        Ok(result == 1)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_bodies_reference_expected_keys_and_args() {
        assert!(RENEW_SCRIPT.contains("PEXPIRE"));
        assert!(RELEASE_SCRIPT.contains("DEL"));
    }
}
