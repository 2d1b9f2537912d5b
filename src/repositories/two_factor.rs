use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::TwoFactorRecord;

/// ロックアウトカウンター更新後の状態
#[derive(Debug, FromRow)]
pub struct LockoutState {
    pub failed_attempts: i32,
    pub locked_until: Option<OffsetDateTime>,
}

/// 2FAレコード＋バックアップコードの集約ストア
///
/// バックアップコードの消費とロックアウトカウンターは read-modify-write では
/// なく条件付きUPDATE一文で更新する（同時リクエストでの二重消費・更新喪失防止）
#[async_trait]
pub trait TwoFactorRepository: Send + Sync {
    async fn find_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<TwoFactorRecord>, sqlx::Error>;

    /// シークレットを新規作成または上書き
    ///
    /// # Note
    /// 既存レコードがあっても enabled = false に戻し、カウンターと
    /// 既存バックアップコードを破棄する（再セットアップ）
    async fn upsert_secret(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
    ) -> Result<TwoFactorRecord, sqlx::Error>;

    /// 有効化とバックアップコード発行を単一トランザクションで実行
    async fn enable_with_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<(), sqlx::Error>;

    /// バックアップコード一式を差し替え（旧バッチは全て破棄）
    async fn replace_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<(), sqlx::Error>;

    /// 2FAを無効化（シークレットは残す）
    async fn disable(&self, user_id: Uuid) -> Result<(), sqlx::Error>;

    /// レコードとバックアップコードを完全削除
    async fn purge(&self, user_id: Uuid) -> Result<(), sqlx::Error>;

    /// バックアップコードを消費
    ///
    /// # Returns
    /// 未使用の一致コードを used にできた場合のみ true（at-most-once保証）
    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<bool, sqlx::Error>;

    /// 未使用バックアップコード数
    async fn count_unused_codes(&self, user_id: Uuid) -> Result<i64, sqlx::Error>;

    /// 検証成功を記録（カウンターリセット、last_used 更新）
    async fn record_success(&self, user_id: Uuid) -> Result<(), sqlx::Error>;

    /// 検証失敗を記録
    ///
    /// インクリメントと閾値到達時の locked_until 設定を一文で行う
    async fn record_failure(
        &self,
        user_id: Uuid,
        max_attempts: u32,
        cooldown_secs: i64,
    ) -> Result<LockoutState, sqlx::Error>;
}

#[derive(Clone)]
pub struct PgTwoFactorRepository {
    pool: PgPool,
}

impl PgTwoFactorRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TwoFactorRepository for PgTwoFactorRepository {
    async fn find_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<TwoFactorRecord>, sqlx::Error> {
        sqlx::query_as::<_, TwoFactorRecord>(
            r#"
            SELECT user_id, secret_encrypted, enabled, setup_at,
                   failed_attempts, locked_until, last_used, created_at, updated_at
            FROM two_factor_secrets
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn upsert_secret(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
    ) -> Result<TwoFactorRecord, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, TwoFactorRecord>(
            r#"
            INSERT INTO two_factor_secrets (user_id, secret_encrypted)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
            SET secret_encrypted = EXCLUDED.secret_encrypted,
                enabled = FALSE,
                setup_at = NOW(),
                failed_attempts = 0,
                locked_until = NULL,
                updated_at = NOW()
            RETURNING user_id, secret_encrypted, enabled, setup_at,
                      failed_attempts, locked_until, last_used, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(secret_encrypted)
        .fetch_one(&mut *tx)
        .await?;

        // 旧シークレットに紐づくバックアップコードは無効
        sqlx::query(
            r#"
            DELETE FROM two_factor_backup_codes
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(record)
    }

    async fn enable_with_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE two_factor_secrets
            SET enabled = TRUE, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM two_factor_backup_codes
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        for code_hash in code_hashes {
            sqlx::query(
                r#"
                INSERT INTO two_factor_backup_codes (id, user_id, code_hash)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(code_hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn replace_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM two_factor_backup_codes
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        for code_hash in code_hashes {
            sqlx::query(
                r#"
                INSERT INTO two_factor_backup_codes (id, user_id, code_hash)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(code_hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn disable(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE two_factor_secrets
            SET enabled = FALSE, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM two_factor_backup_codes
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM two_factor_secrets
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<bool, sqlx::Error> {
        // used = FALSE 条件付きUPDATE一文で二重消費を防ぐ
        let result = sqlx::query(
            r#"
            UPDATE two_factor_backup_codes
            SET used = TRUE, used_at = NOW()
            WHERE user_id = $1 AND code_hash = $2 AND used = FALSE
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_unused_codes(&self, user_id: Uuid) -> Result<i64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM two_factor_backup_codes
            WHERE user_id = $1 AND used = FALSE
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn record_success(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE two_factor_secrets
            SET failed_attempts = 0, locked_until = NULL,
                last_used = NOW(), updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_failure(
        &self,
        user_id: Uuid,
        max_attempts: u32,
        cooldown_secs: i64,
    ) -> Result<LockoutState, sqlx::Error> {
        sqlx::query_as::<_, LockoutState>(
            r#"
            UPDATE two_factor_secrets
            SET failed_attempts = failed_attempts + 1,
                locked_until = CASE
                    WHEN failed_attempts + 1 >= $2
                        THEN NOW() + make_interval(secs => $3)
                    ELSE locked_until
                END,
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING failed_attempts, locked_until
            "#,
        )
        .bind(user_id)
        .bind(max_attempts as i32)
        .bind(cooldown_secs as f64)
        .fetch_one(&self.pool)
        .await
    }
}
