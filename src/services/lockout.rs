use time::{Duration, OffsetDateTime};

/// 検証失敗ロックアウトポリシー
///
/// 状態機械は2FAレコードに永続化された failed_attempts / locked_until が持つ。
/// 本構造体は閾値判定と残り時間計算のみを担う（スケジュールジョブ不要の遅延判定）
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub cooldown_secs: i64,
}

impl LockoutPolicy {
    pub fn new(max_attempts: u32, cooldown_secs: i64) -> Self {
        Self {
            max_attempts,
            cooldown_secs,
        }
    }

    /// ロックアウト中なら残り時間を返す
    ///
    /// locked_until が過去の場合は Open 状態に暗黙復帰（None）
    pub fn remaining_lockout(
        &self,
        locked_until: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Option<Duration> {
        match locked_until {
            Some(until) if until > now => Some(until - now),
            _ => None,
        }
    }

    /// この失敗回数でロックアウトに入るか
    pub fn should_lock(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }
}
