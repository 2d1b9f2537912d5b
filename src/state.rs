use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::AppError;
use crate::repositories::{PgTwoFactorRepository, PgUserRepository};
use crate::services::{
    BackupCodeService, LockoutPolicy, TotpQrRenderer, TotpService, TwoFactorService,
};

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// PostgreSQL コネクションプール
    pub db_pool: PgPool,
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    /// 二要素認証サービス
    pub two_factor_service: TwoFactorService,
}

impl AppState {
    /// 新しい AppState を作成
    pub fn new(db_pool: PgPool, config: Config) -> Result<Self, AppError> {
        let config = Arc::new(config);

        let user_repo = Arc::new(PgUserRepository::new(db_pool.clone()));
        let record_repo = Arc::new(PgTwoFactorRepository::new(db_pool.clone()));

        let totp_service = TotpService::new(
            config.totp_issuer.clone(),
            config.encryption_key.expose_secret(),
        )?;

        let two_factor_service = TwoFactorService::new(
            user_repo,
            record_repo,
            Arc::new(TotpQrRenderer),
            totp_service,
            BackupCodeService::new(config.backup_code_count, config.backup_code_length),
            LockoutPolicy::new(config.lockout_max_attempts, config.lockout_cooldown_secs),
            config.purge_on_disable,
        );

        Ok(Self {
            db_pool,
            config,
            two_factor_service,
        })
    }
}
