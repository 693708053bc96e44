use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::{LockBackend, LockGuard};
use crate::LockError;

struct LockEntry {
    token: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// プロセス内で完結するリースストア。
///
/// 期限判定に tokio の時計を使うため、`start_paused` のテストでも TTL が仮想時間で進む。
pub struct InMemoryLockBackend {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 期限切れでないロックがキーに存在するかどうか。
    pub async fn is_locked(&self, key: &str) -> bool {
        let locks = self.locks.lock().await;
        locks.get(key).is_some_and(|e| !e.is_expired())
    }
}

impl Default for InMemoryLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn deadline(ttl: Duration) -> Result<Instant, LockError> {
    Instant::now()
        .checked_add(ttl)
        .ok_or(LockError::InvalidLeaseDuration)
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(key) {
            if !entry.is_expired() {
                return Err(LockError::AlreadyLocked(key.to_string()));
            }
        }
        let expires_at = deadline(ttl)?;
        let token = Uuid::new_v4().to_string();
        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(LockGuard {
            key: key.to_string(),
            token,
        })
    }

    async fn release(&self, guard: &LockGuard) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get(&guard.key) {
            Some(entry) if entry.is_expired() => {
                locks.remove(&guard.key);
                Err(LockError::LockNotFound(guard.key.clone()))
            }
            Some(entry) if entry.token == guard.token => {
                locks.remove(&guard.key);
                Ok(())
            }
            Some(_) => Err(LockError::TokenMismatch),
            None => Err(LockError::LockNotFound(guard.key.clone())),
        }
    }

    async fn extend(&self, guard: &LockGuard, ttl: Duration) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(&guard.key) {
            // 期限切れのエントリは Redis の PEXPIRE と同様に延長できない
            Some(entry) if entry.is_expired() => Err(LockError::LockNotFound(guard.key.clone())),
            Some(entry) if entry.token == guard.token => {
                entry.expires_at = deadline(ttl)?;
                Ok(())
            }
            Some(_) => Err(LockError::TokenMismatch),
            None => Err(LockError::LockNotFound(guard.key.clone())),
        }
    }

    async fn is_held(&self, guard: &LockGuard) -> Result<bool, LockError> {
        let locks = self.locks.lock().await;
        Ok(locks
            .get(&guard.key)
            .is_some_and(|e| e.token == guard.token && !e.is_expired()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let backend = InMemoryLockBackend::new();
        let guard = backend
            .acquire("key1", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(backend.is_locked("key1").await);
        assert!(backend.is_held(&guard).await.unwrap());

        backend.release(&guard).await.unwrap();
        assert!(!backend.is_locked("key1").await);
        assert!(!backend.is_held(&guard).await.unwrap());
    }

    #[tokio::test]
    async fn test_double_acquire_returns_already_locked() {
        let backend = InMemoryLockBackend::new();
        let _guard = backend
            .acquire("key1", Duration::from_secs(10))
            .await
            .unwrap();
        let result = backend.acquire("key1", Duration::from_secs(10)).await;
        assert!(matches!(result, Err(LockError::AlreadyLocked(_))));
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_returns_token_mismatch() {
        let backend = InMemoryLockBackend::new();
        let _guard = backend
            .acquire("key1", Duration::from_secs(10))
            .await
            .unwrap();
        let fake_guard = LockGuard {
            key: "key1".to_string(),
            token: "wrong-token".to_string(),
        };
        let result = backend.release(&fake_guard).await;
        assert!(matches!(result, Err(LockError::TokenMismatch)));
        assert!(!backend.is_held(&fake_guard).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_updates_ttl() {
        let backend = InMemoryLockBackend::new();
        let guard = backend
            .acquire("key1", Duration::from_secs(1))
            .await
            .unwrap();
        backend
            .extend(&guard, Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(backend.is_held(&guard).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_after_expiry_returns_not_found() {
        let backend = InMemoryLockBackend::new();
        let guard = backend
            .acquire("key1", Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let result = backend.extend(&guard, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(LockError::LockNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_after_expiry() {
        let backend = InMemoryLockBackend::new();
        let first = backend
            .acquire("key1", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!backend.is_locked("key1").await);
        let second = backend
            .acquire("key1", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(backend.is_held(&second).await.unwrap());
        assert!(!backend.is_held(&first).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_with_unrepresentable_ttl_is_rejected() {
        let backend = InMemoryLockBackend::new();
        let result = backend.acquire("key1", Duration::MAX).await;
        assert!(matches!(result, Err(LockError::InvalidLeaseDuration)));
        assert!(!backend.is_locked("key1").await);
    }
}
