use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// 単回使用のバックアップコード
///
/// 平文は発行時に一度だけ返却し、DBにはSHA256ハッシュのみ保存する
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BackupCode {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip)]
    pub code_hash: String,
    pub used: bool,
    pub used_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}
