use std::time::Duration;

use rand::Rng;

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(8);
pub const DEFAULT_TRIES: u32 = 32;
pub const DEFAULT_DRIFT_FACTOR: f64 = 0.01;
pub const DEFAULT_TIMEOUT_FACTOR: f64 = 0.05;

const MIN_RETRY_DELAY_MS: u64 = 50;
const MAX_RETRY_DELAY_MS: u64 = 250;

/// ロックプリミティブへそのまま渡される取得オプション。
///
/// 後に指定したものが優先される。ファクトリはリース期間を `Expiry` として末尾に追加する。
#[derive(Debug, Clone, PartialEq)]
pub enum LockOption {
    Expiry(Duration),
    Tries(u32),
    RetryDelay(Duration),
    DriftFactor(f64),
    TimeoutFactor(f64),
}

/// オプションを順に適用した結果。
#[derive(Debug, Clone, PartialEq)]
pub struct LockSettings {
    pub expiry: Duration,
    pub tries: u32,
    /// `None` の場合は試行ごとに 50ms〜250ms のランダムな待機を行う
    pub retry_delay: Option<Duration>,
    pub drift_factor: f64,
    pub timeout_factor: f64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            expiry: DEFAULT_EXPIRY,
            tries: DEFAULT_TRIES,
            retry_delay: None,
            drift_factor: DEFAULT_DRIFT_FACTOR,
            timeout_factor: DEFAULT_TIMEOUT_FACTOR,
        }
    }
}

impl LockSettings {
    pub fn from_options(options: &[LockOption]) -> Self {
        let mut settings = Self::default();
        for option in options {
            settings.apply(option);
        }
        settings
    }

    fn apply(&mut self, option: &LockOption) {
        match option {
            LockOption::Expiry(expiry) => self.expiry = *expiry,
            LockOption::Tries(tries) => self.tries = (*tries).max(1),
            LockOption::RetryDelay(delay) => self.retry_delay = Some(*delay),
            // 範囲外の係数は無視する
            LockOption::DriftFactor(factor) if is_valid_drift_factor(*factor) => {
                self.drift_factor = *factor;
            }
            LockOption::TimeoutFactor(factor) if is_valid_timeout_factor(*factor) => {
                self.timeout_factor = *factor;
            }
            LockOption::DriftFactor(_) | LockOption::TimeoutFactor(_) => {}
        }
    }

    /// 時計のずれとして有効期間から差し引く時間。
    pub fn drift(&self) -> Duration {
        scale(self.expiry, self.drift_factor).saturating_add(Duration::from_millis(2))
    }

    /// ストア呼び出し 1 回あたりのタイムアウト。
    pub fn call_timeout(&self) -> Duration {
        scale(self.expiry, self.timeout_factor).max(Duration::from_millis(1))
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay.unwrap_or_else(|| {
            Duration::from_millis(
                rand::thread_rng().gen_range(MIN_RETRY_DELAY_MS..MAX_RETRY_DELAY_MS),
            )
        })
    }
}

/// `factor` は 0 以上 1 以下であること。結果は `duration` を超えない。
fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor)
        .map_or(duration, |scaled| scaled.min(duration))
}

pub(crate) fn is_valid_drift_factor(factor: f64) -> bool {
    (0.0..1.0).contains(&factor)
}

pub(crate) fn is_valid_timeout_factor(factor: f64) -> bool {
    (0.0..=1.0).contains(&factor)
}
