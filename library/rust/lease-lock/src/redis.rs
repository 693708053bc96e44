use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};

use crate::backend::{LockBackend, LockGuard};
use crate::config::RedisConfig;
use crate::LockError;

/// Redis を使ったリースストア。
///
/// 取得は SET NX PX で原子的に行い、解放・延長・確認は Lua スクリプトで
/// トークンを照合してから実行する。保持者以外はロックを変更できない。
#[derive(Clone)]
pub struct RedisLockBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisLockBackend {
    /// Redis URL から RedisLockBackend を作成する。
    ///
    /// # Arguments
    /// * `url` - Redis 接続 URL (例: "redis://127.0.0.1:6379")
    pub async fn new(url: &str) -> Result<Self, LockError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self {
            conn,
            key_prefix: "lock".to_string(),
        })
    }

    /// 設定の URL に接続し、設定のキープレフィックスを使う。
    pub async fn from_config(config: &RedisConfig) -> Result<Self, LockError> {
        Ok(Self::new(&config.url)
            .await?
            .with_prefix(config.key_prefix.clone()))
    }

    /// 既存の多重化コネクションから作成する。
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "lock".to_string(),
        }
    }

    /// ロックキーのプレフィックスを設定する。
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn lock_key(&self, key: &str) -> String {
        format_lock_key(&self.key_prefix, key)
    }
}

/// 値がトークンと一致する場合のみキーを削除する。
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// 値がトークンと一致する場合のみ TTL を更新する。
const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// 値がトークンと一致し、かつ TTL が残っていれば 1 を返す。
const HELD_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] and redis.call("pttl", KEYS[1]) > 0 then
    return 1
else
    return 0
end
"#;

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);
        let token = uuid::Uuid::new_v4().to_string();
        let millis = ttl_millis(ttl);

        // SET key value NX PX milliseconds
        let result: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        match result {
            Some(_) => Ok(LockGuard {
                key: key.to_string(),
                token,
            }),
            None => Err(LockError::AlreadyLocked(key.to_string())),
        }
    }

    async fn release(&self, guard: &LockGuard) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(&guard.key);

        let result: i64 = Script::new(RELEASE_SCRIPT)
            .key(&full_key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if result == 1 {
            Ok(())
        } else {
            Err(LockError::TokenMismatch)
        }
    }

    async fn extend(&self, guard: &LockGuard, ttl: Duration) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(&guard.key);

        let result: i64 = Script::new(EXTEND_SCRIPT)
            .key(&full_key)
            .arg(&guard.token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if result == 1 {
            Ok(())
        } else {
            Err(LockError::TokenMismatch)
        }
    }

    async fn is_held(&self, guard: &LockGuard) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(&guard.key);

        let result: i64 = Script::new(HELD_SCRIPT)
            .key(&full_key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(result == 1)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn map_redis_error(err: RedisError) -> LockError {
    LockError::Internal(err.to_string())
}

/// ロックキーを組み立てる (Redis 接続なしでテストできるよう公開)。
pub fn format_lock_key(prefix: &str, key: &str) -> String {
    format!("{prefix}:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_lock_key() {
        assert_eq!(format_lock_key("lock", "job-42"), "lock:job-42");
        assert_eq!(
            format_lock_key("myapp:lock", "resource"),
            "myapp:lock:resource"
        );
    }

    #[test]
    fn test_map_redis_error_to_lock_error() {
        let err = map_redis_error(RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )));
        match err {
            LockError::Internal(msg) => {
                assert!(msg.contains("connection refused"));
            }
            _ => panic!("Expected Internal error"),
        }
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(8)), 8000);
    }

    #[test]
    fn test_scripts_compare_token_before_mutation() {
        assert!(RELEASE_SCRIPT.contains("redis.call(\"get\""));
        assert!(RELEASE_SCRIPT.contains("redis.call(\"del\""));
        assert!(EXTEND_SCRIPT.contains("redis.call(\"pexpire\""));
        assert!(HELD_SCRIPT.contains("redis.call(\"pttl\""));
    }
}
