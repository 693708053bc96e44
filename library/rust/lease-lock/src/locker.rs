use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::backend::LockBackend;
use crate::lease::{DistributedMutex, RenewingMutex};
use crate::options::LockOption;
use crate::primitive::StoreMutex;
use crate::LockError;

/// 分散ロックを生成するファクトリ。
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait Locker: Send + Sync {
    /// キーに対する未取得のミューテックスを作成する。ストアへのアクセスは行わない。
    ///
    /// 空白のみのキーは `EmptyKey`、0 のリース期間は `InvalidLeaseDuration` で失敗する。
    /// `lease_duration` は `LockOption::Expiry` として `options` の末尾に追加される。
    fn get_mutex(
        &self,
        key: &str,
        lease_duration: Duration,
        options: Vec<LockOption>,
    ) -> Result<Box<dyn DistributedMutex>, LockError>;
}

/// [`LockBackend`] 上に自動延長付きミューテックスを作る [`Locker`]。
#[derive(Clone)]
pub struct BackendLocker {
    backend: Arc<dyn LockBackend>,
}

impl BackendLocker {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }
}

impl Locker for BackendLocker {
    fn get_mutex(
        &self,
        key: &str,
        lease_duration: Duration,
        mut options: Vec<LockOption>,
    ) -> Result<Box<dyn DistributedMutex>, LockError> {
        validate_key(key)?;
        validate_lease_duration(lease_duration)?;

        options.push(LockOption::Expiry(lease_duration));
        let primitive = StoreMutex::new(Arc::clone(&self.backend), key, &options);
        Ok(Box::new(RenewingMutex::new(key, primitive, lease_duration)))
    }
}

pub(crate) fn validate_key(key: &str) -> Result<(), LockError> {
    if key.trim().is_empty() {
        return Err(LockError::EmptyKey);
    }
    Ok(())
}

/// 0 のリース期間や、現在時刻に加えると表現できないリース期間を拒否する。
pub(crate) fn validate_lease_duration(lease_duration: Duration) -> Result<(), LockError> {
    if lease_duration.is_zero() || Instant::now().checked_add(lease_duration).is_none() {
        return Err(LockError::InvalidLeaseDuration);
    }
    Ok(())
}

/// ミューテックスを作成してそのままロックする。
///
/// 取得に失敗した場合ミューテックスは破棄され、エラーのみを返す。
pub async fn get_and_lock(
    locker: &dyn Locker,
    key: &str,
    lease_duration: Duration,
    options: Vec<LockOption>,
) -> Result<Box<dyn DistributedMutex>, LockError> {
    let mutex = locker.get_mutex(key, lease_duration, options)?;
    mutex.lock().await?;
    Ok(mutex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLockBackend;

    fn locker() -> BackendLocker {
        BackendLocker::new(Arc::new(InMemoryLockBackend::new()))
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("job-42").is_ok());
        assert!(validate_key("  job-42 ").is_ok());
        assert!(matches!(validate_key(""), Err(LockError::EmptyKey)));
        assert!(matches!(validate_key(" \t\n"), Err(LockError::EmptyKey)));
    }

    #[test]
    fn test_get_mutex_rejects_empty_key() {
        let result = locker().get_mutex("   ", Duration::from_secs(1), Vec::new());
        assert!(matches!(result, Err(LockError::EmptyKey)));
    }

    #[test]
    fn test_get_mutex_rejects_zero_lease() {
        let result = locker().get_mutex("job-42", Duration::ZERO, Vec::new());
        assert!(matches!(result, Err(LockError::InvalidLeaseDuration)));
    }

    #[test]
    fn test_get_mutex_rejects_unrepresentable_lease() {
        let result = locker().get_mutex("job-42", Duration::MAX, Vec::new());
        assert!(matches!(result, Err(LockError::InvalidLeaseDuration)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_drift_factor_does_not_break_lock() {
        let locker = locker();
        let mutex = locker
            .get_mutex(
                "job-42",
                Duration::from_secs(1),
                vec![LockOption::DriftFactor(1e300)],
            )
            .unwrap();
        mutex.lock().await.unwrap();
        assert!(mutex.valid().await.unwrap());
        mutex.unlock().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_mutex_does_not_touch_store() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let locker = BackendLocker::new(backend.clone());
        let _mutex = locker
            .get_mutex("job-42", Duration::from_secs(1), Vec::new())
            .unwrap();
        assert!(!backend.is_locked("job-42").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_and_lock_holds_lock() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let locker = BackendLocker::new(backend.clone());
        let mutex = get_and_lock(&locker, "job-42", Duration::from_secs(1), Vec::new())
            .await
            .unwrap();
        assert!(backend.is_locked("job-42").await);
        mutex.unlock().await.unwrap();
        assert!(!backend.is_locked("job-42").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_and_lock_propagates_acquisition_failure() {
        let locker = locker();
        let _held = get_and_lock(&locker, "job-42", Duration::from_secs(1), Vec::new())
            .await
            .unwrap();
        let result = get_and_lock(
            &locker,
            "job-42",
            Duration::from_secs(1),
            vec![LockOption::Tries(1)],
        )
        .await;
        assert!(matches!(result, Err(LockError::AlreadyLocked(_))));
    }
}
