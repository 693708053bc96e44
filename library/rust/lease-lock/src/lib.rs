//! k1s0-lease-lock: 自動延長付き分散ロックライブラリ。
//!
//! 取得したロックのリースをバックグラウンドで延長し続け、`unlock` または
//! 延長失敗のどちらか先に起きた方で延長を停止する。

pub mod backend;
pub mod config;
pub mod error;
pub mod lease;
pub mod locker;
pub mod memory;
pub mod options;
pub mod primitive;
#[cfg(feature = "redis")]
pub mod redis;

pub use backend::{LockBackend, LockGuard};
pub use config::{LockConfig, RedisConfig};
pub use error::LockError;
pub use lease::{DistributedMutex, RenewingMutex};
pub use locker::{get_and_lock, BackendLocker, Locker};
pub use memory::InMemoryLockBackend;
pub use options::{LockOption, LockSettings};
pub use primitive::{ExtendOutcome, LockPrimitive, StoreMutex};
#[cfg(feature = "redis")]
pub use self::redis::RedisLockBackend;

#[cfg(feature = "mock")]
pub use backend::MockLockBackend;
#[cfg(feature = "mock")]
pub use lease::MockDistributedMutex;
#[cfg(feature = "mock")]
pub use locker::MockLocker;
#[cfg(feature = "mock")]
pub use primitive::MockLockPrimitive;
