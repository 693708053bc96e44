use async_trait::async_trait;
use std::time::Duration;

use crate::LockError;

/// ストア上で取得したロックの所有証明。
///
/// `token` は取得ごとに一意で、解放・延長・確認はトークンが一致する場合のみ成功する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

/// TTL 付きロックを保持するリースストア。
#[async_trait]
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait LockBackend: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError>;
    async fn release(&self, guard: &LockGuard) -> Result<(), LockError>;
    async fn extend(&self, guard: &LockGuard, ttl: Duration) -> Result<(), LockError>;
    async fn is_held(&self, guard: &LockGuard) -> Result<bool, LockError>;
}
