use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::primitive::{ExtendOutcome, LockPrimitive};
use crate::LockError;

/// 自動延長付きの分散ロック。
#[async_trait]
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait DistributedMutex: Send + Sync {
    /// ロックを取得し、成功した場合はバックグラウンドでの自動延長を開始する。
    async fn lock(&self) -> Result<(), LockError>;
    /// 自動延長を停止してからロックを解放する。
    async fn unlock(&self) -> Result<(), LockError>;
    /// ストアに問い合わせ、リースがまだ保持されているかを返す。
    async fn valid(&self) -> Result<bool, LockError>;
}

/// 自動延長ループの終了理由。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenewalExit {
    /// 終了シグナルが外部から閉じられた
    Cancelled,
    /// 延長に失敗した。`closed_signal` はこのループがシグナルを閉じたかどうか
    LeaseLost { closed_signal: bool },
}

struct Shared<P> {
    primitive: P,
    /// `Some` の間は延長ループが動作中 (または開始前)。閉じる際に `take` して再度閉じられないようにする
    exit: Mutex<Option<CancellationToken>>,
}

impl<P> Shared<P> {
    fn exit_token(&self) -> Option<CancellationToken> {
        self.exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 終了シグナルを閉じる。このシグナルを閉じたのがこの呼び出しなら `true`。
    fn close_exit(&self) -> bool {
        let token = self
            .exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// [`LockPrimitive`] を包み、保持中のリースを自動で延長するミューテックス。
///
/// `lock` が成功するとリース期間の 9/10 間隔で `extend` を呼ぶタスクを 1 つ起動する。
/// タスクは `unlock` (またはドロップ) で閉じられる終了シグナルか、延長の失敗で停止し、
/// 以後再開しない。延長失敗は呼び出し元へ通知されないため、長いクリティカル
/// セクションでは `valid` で保持を確認すること。
///
/// 1 インスタンスにつき取得は 1 回のみ。再取得には新しいインスタンスを使う。
pub struct RenewingMutex<P: LockPrimitive + 'static> {
    key: String,
    lease_duration: Duration,
    shared: Arc<Shared<P>>,
    renewal: OnceLock<JoinHandle<RenewalExit>>,
}

impl<P: LockPrimitive + 'static> RenewingMutex<P> {
    pub fn new(key: impl Into<String>, primitive: P, lease_duration: Duration) -> Self {
        Self {
            key: key.into(),
            lease_duration,
            shared: Arc::new(Shared {
                primitive,
                exit: Mutex::new(Some(CancellationToken::new())),
            }),
            renewal: OnceLock::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// 延長を試みる間隔。ストア側の失効より前に延長できるようリース期間の 9/10 とする。
    pub fn renewal_interval(&self) -> Duration {
        renewal_interval(self.lease_duration)
    }

    /// 延長タスクが起動済みで、まだ終了していないかどうか。
    pub fn is_renewing(&self) -> bool {
        self.renewal
            .get()
            .is_some_and(|handle| !handle.is_finished())
    }
}

pub(crate) fn renewal_interval(lease_duration: Duration) -> Duration {
    (lease_duration / 10)
        .saturating_mul(9)
        .max(Duration::from_millis(1))
}

#[async_trait]
impl<P: LockPrimitive + 'static> DistributedMutex for RenewingMutex<P> {
    async fn lock(&self) -> Result<(), LockError> {
        let Some(exit) = self.shared.exit_token() else {
            return Err(LockError::MutexClosed(self.key.clone()));
        };
        if self.renewal.get().is_some() {
            return Err(LockError::AlreadyAcquired(self.key.clone()));
        }

        self.shared.primitive.lock().await?;

        let handle = tokio::spawn(renew(
            Arc::clone(&self.shared),
            exit,
            self.renewal_interval(),
            self.key.clone(),
        ));
        if let Err(duplicate) = self.renewal.set(handle) {
            // 同一インスタンスで並行に lock された場合、延長タスクは最初の 1 つだけ残す
            duplicate.abort();
            return Err(LockError::AlreadyAcquired(self.key.clone()));
        }
        tracing::debug!(key = %self.key, lease = ?self.lease_duration, "ロックを取得しました");
        Ok(())
    }

    async fn unlock(&self) -> Result<(), LockError> {
        if self.shared.close_exit() {
            tracing::debug!(key = %self.key, "自動延長を停止しました");
        }
        self.shared.primitive.unlock().await?;
        tracing::debug!(key = %self.key, "ロックを解放しました");
        Ok(())
    }

    async fn valid(&self) -> Result<bool, LockError> {
        self.shared.primitive.valid().await
    }
}

impl<P: LockPrimitive + 'static> Drop for RenewingMutex<P> {
    fn drop(&mut self) {
        // 延長タスクを止める。ストア上のリースは TTL で自然に失効する
        self.shared.close_exit();
    }
}

async fn renew<P: LockPrimitive>(
    shared: Arc<Shared<P>>,
    exit: CancellationToken,
    period: Duration,
    key: String,
) -> RenewalExit {
    let Some(first_tick) = Instant::now().checked_add(period) else {
        // 表現できないほど先の延長は不要
        exit.cancelled().await;
        return RenewalExit::Cancelled;
    };
    let mut ticker = time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = exit.cancelled() => return RenewalExit::Cancelled,
            _ = ticker.tick() => {
                let outcome = shared.primitive.extend().await;
                // 延長中に unlock された場合、延長の失敗は呼び出し元による停止の結果
                if exit.is_cancelled() {
                    return RenewalExit::Cancelled;
                }
                match outcome {
                    Ok(ExtendOutcome::Extended) => {
                        tracing::trace!(key = %key, "リースを延長しました");
                        continue;
                    }
                    Ok(ExtendOutcome::Expired) => {
                        tracing::warn!(key = %key, "リースが失効していたため自動延長を停止します");
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "リースの延長に失敗したため自動延長を停止します");
                    }
                }
                drop(ticker);
                let closed_signal = shared.close_exit();
                return RenewalExit::LeaseLost { closed_signal };
            }
        }
    }
}
