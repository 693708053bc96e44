use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::backend::{LockBackend, LockGuard};
use crate::options::{LockOption, LockSettings};
use crate::LockError;

/// 延長の結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    /// リースを元の期間で延長した
    Extended,
    /// 呼び出し前にリースが既に失効していた
    Expired,
}

/// 1 つのキーに対するロック操作。
///
/// 取得したトークンは実装側が保持するため、各操作は引数を取らない。
#[async_trait]
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait LockPrimitive: Send + Sync {
    async fn lock(&self) -> Result<(), LockError>;
    async fn extend(&self) -> Result<ExtendOutcome, LockError>;
    async fn unlock(&self) -> Result<bool, LockError>;
    async fn valid(&self) -> Result<bool, LockError>;
}

struct Held {
    guard: LockGuard,
    valid_until: Instant,
}

/// 単一のリースストアに対する [`LockPrimitive`] 実装。
///
/// 取得のリトライ、ストア呼び出しのタイムアウト、時計のずれを考慮した
/// ローカルの有効期限を管理する。操作は内部の Mutex で直列化される。
pub struct StoreMutex<B: LockBackend + ?Sized> {
    backend: Arc<B>,
    key: String,
    settings: LockSettings,
    held: Mutex<Option<Held>>,
}

impl<B: LockBackend + ?Sized> StoreMutex<B> {
    pub fn new(backend: Arc<B>, key: impl Into<String>, options: &[LockOption]) -> Self {
        Self {
            backend,
            key: key.into(),
            settings: LockSettings::from_options(options),
            held: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// `start` に開始したストア操作が成功した場合の有効期限。
    ///
    /// 期限が既に過ぎている場合は `None` を返す。
    fn valid_until(&self, start: Instant) -> Option<Instant> {
        let until = start.checked_add(self.settings.expiry.checked_sub(self.settings.drift())?)?;
        (Instant::now() < until).then_some(until)
    }

    async fn with_timeout<T>(
        &self,
        op: impl Future<Output = Result<T, LockError>>,
    ) -> Result<T, LockError> {
        tokio::time::timeout(self.settings.call_timeout(), op)
            .await
            .map_err(|_| LockError::Timeout(self.key.clone()))?
    }

    async fn try_acquire(&self) -> Result<Held, LockError> {
        let start = Instant::now();
        let guard = self
            .with_timeout(self.backend.acquire(&self.key, self.settings.expiry))
            .await?;
        match self.valid_until(start) {
            Some(valid_until) => Ok(Held { guard, valid_until }),
            None => {
                // 取得に時間がかかりすぎて有効期間が残っていない
                let _ = self.with_timeout(self.backend.release(&guard)).await;
                Err(LockError::Timeout(self.key.clone()))
            }
        }
    }
}

#[async_trait]
impl<B: LockBackend + ?Sized + 'static> LockPrimitive for StoreMutex<B> {
    async fn lock(&self) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        let mut last_error = None;
        for attempt in 0..self.settings.tries {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_delay()).await;
            }
            match self.try_acquire().await {
                Ok(acquired) => {
                    *held = Some(acquired);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(
                        key = %self.key,
                        attempt = attempt + 1,
                        tries = self.settings.tries,
                        error = %e,
                        "ロック取得に失敗しました"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| LockError::AlreadyLocked(self.key.clone())))
    }

    async fn extend(&self) -> Result<ExtendOutcome, LockError> {
        let mut held = self.held.lock().await;
        let Some(current) = held.as_mut() else {
            return Err(LockError::LockNotFound(self.key.clone()));
        };
        if Instant::now() >= current.valid_until {
            return Ok(ExtendOutcome::Expired);
        }

        let start = Instant::now();
        match self
            .with_timeout(self.backend.extend(&current.guard, self.settings.expiry))
            .await
        {
            Ok(()) => match self.valid_until(start) {
                Some(valid_until) => {
                    current.valid_until = valid_until;
                    Ok(ExtendOutcome::Extended)
                }
                None => Ok(ExtendOutcome::Expired),
            },
            Err(e) if e.is_lease_lost() => Ok(ExtendOutcome::Expired),
            Err(e) => Err(e),
        }
    }

    async fn unlock(&self) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        let Some(current) = held.as_ref() else {
            return Err(LockError::LockNotFound(self.key.clone()));
        };
        // 通信エラーやタイムアウトの場合はトークンを残し、再度 unlock できるようにする
        match self.with_timeout(self.backend.release(&current.guard)).await {
            Ok(()) => {
                *held = None;
                Ok(true)
            }
            Err(e) => {
                if e.is_lease_lost() {
                    *held = None;
                }
                Err(e)
            }
        }
    }

    async fn valid(&self) -> Result<bool, LockError> {
        let held = self.held.lock().await;
        match held.as_ref() {
            Some(current) if Instant::now() < current.valid_until => {
                self.with_timeout(self.backend.is_held(&current.guard)).await
            }
            _ => Ok(false),
        }
    }
}
