use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// ユーザーの二要素認証（TOTP）レコード
///
/// シークレットは AES-256-GCM で暗号化されて保存される
/// 平文シークレットはログに出力禁止
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TwoFactorRecord {
    pub user_id: Uuid,
    #[serde(skip)]
    pub secret_encrypted: Vec<u8>,
    /// 有効化確認（初回コード検証）が完了するまで false
    pub enabled: bool,
    /// シークレットを（再）生成した時刻
    pub setup_at: OffsetDateTime,
    /// 連続検証失敗回数（成功で 0 にリセット）
    pub failed_attempts: i32,
    /// この時刻まで検証を拒否（ロックアウト中のみ）
    pub locked_until: Option<OffsetDateTime>,
    /// 最後に検証が成功した時刻
    pub last_used: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}
