use std::time::Duration;

use serde::Deserialize;

use crate::locker::validate_lease_duration;
use crate::options::{self, is_valid_drift_factor, is_valid_timeout_factor, LockOption};
use crate::LockError;

/// RedisConfig はリースストアとして使う Redis の接続設定。
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "lock".to_string()
}

/// LockConfig は分散ロックの設定を表す。
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,
    #[serde(default = "default_tries")]
    pub tries: u32,
    /// 未指定の場合は 50ms〜250ms のランダムな待機
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default = "default_drift_factor")]
    pub drift_factor: f64,
    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: f64,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

fn default_lease_duration_ms() -> u64 {
    u64::try_from(options::DEFAULT_EXPIRY.as_millis()).unwrap_or(8000)
}

fn default_tries() -> u32 {
    options::DEFAULT_TRIES
}

fn default_drift_factor() -> f64 {
    options::DEFAULT_DRIFT_FACTOR
}

fn default_timeout_factor() -> f64 {
    options::DEFAULT_TIMEOUT_FACTOR
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: default_lease_duration_ms(),
            tries: default_tries(),
            retry_delay_ms: None,
            drift_factor: default_drift_factor(),
            timeout_factor: default_timeout_factor(),
            redis: None,
        }
    }
}

impl LockConfig {
    /// YAML 文字列から設定を読み込み、検証する。
    pub fn from_yaml(yaml: &str) -> Result<Self, LockError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| LockError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LockError> {
        if self.lease_duration_ms == 0 {
            return Err(LockError::Config(
                "lease_duration_ms は 0 より大きくなければなりません".to_string(),
            ));
        }
        if self.tries == 0 {
            return Err(LockError::Config(
                "tries は 1 以上でなければなりません".to_string(),
            ));
        }
        if validate_lease_duration(self.lease_duration()).is_err() {
            return Err(LockError::Config(format!(
                "lease_duration_ms が大きすぎます: {}",
                self.lease_duration_ms
            )));
        }
        if !is_valid_drift_factor(self.drift_factor) {
            return Err(LockError::Config(
                "drift_factor は 0 以上 1 未満でなければなりません".to_string(),
            ));
        }
        if !is_valid_timeout_factor(self.timeout_factor) {
            return Err(LockError::Config(
                "timeout_factor は 0 以上 1 以下でなければなりません".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// `Locker::get_mutex` に渡すオプション。リース期間はファクトリが追加するため含まない。
    pub fn options(&self) -> Vec<LockOption> {
        let mut options = vec![
            LockOption::Tries(self.tries),
            LockOption::DriftFactor(self.drift_factor),
            LockOption::TimeoutFactor(self.timeout_factor),
        ];
        if let Some(delay) = self.retry_delay_ms {
            options.push(LockOption::RetryDelay(Duration::from_millis(delay)));
        }
        options
    }
}
