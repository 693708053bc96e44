use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("ロックキーが空です")]
    EmptyKey,
    #[error("リース期間は 0 より大きくなければなりません")]
    InvalidLeaseDuration,
    #[error("既にロック済みです: {0}")]
    AlreadyLocked(String),
    #[error("ロックが見つかりません: {0}")]
    LockNotFound(String),
    #[error("トークンが一致しません")]
    TokenMismatch,
    #[error("このミューテックスは既にロックを取得しています: {0}")]
    AlreadyAcquired(String),
    #[error("このミューテックスは既に解放されています: {0}")]
    MutexClosed(String),
    #[error("ストア操作がタイムアウトしました: {0}")]
    Timeout(String),
    #[error("設定エラー: {0}")]
    Config(String),
    #[error("内部エラー: {0}")]
    Internal(String),
}

impl LockError {
    /// ロックを保持していないことを示すエラーかどうか。
    ///
    /// 延長時にこのエラーが返った場合、リースは既に失われている。
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, LockError::TokenMismatch | LockError::LockNotFound(_))
    }
}
