use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// === 2FA Setup ===

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct SetupResponse {
    pub secret: String,
    pub otpauth_uri: String,
    /// QR画像（data URI）。レンダリング失敗時は null（手動入力で継続可能）
    pub qr_code: Option<String>,
}

/// POST /api/2fa/setup
///
/// 2FA設定を開始（シークレット生成、QRコード返却）
///
/// # Security
/// - シークレット平文はこのレスポンス限り。ログ出力禁止
pub async fn setup_2fa(
    State(state): State<AppState>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<SetupResponse>, AppError> {
    let outcome = state.two_factor_service.setup(request.user_id).await?;

    Ok(Json(SetupResponse {
        secret: outcome.secret,
        otpauth_uri: outcome.otpauth_uri,
        qr_code: outcome.qr_code,
    }))
}

// === 2FA Enable ===

#[derive(Debug, Deserialize)]
pub struct EnableRequest {
    pub user_id: Uuid,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct EnableResponse {
    /// 平文バックアップコード。この一度しか返却されない
    pub backup_codes: Vec<String>,
    pub message: String,
}

/// POST /api/2fa/enable
///
/// 初回コード検証で2FAを有効化し、バックアップコードを発行
pub async fn enable_2fa(
    State(state): State<AppState>,
    Json(request): Json<EnableRequest>,
) -> Result<Json<EnableResponse>, AppError> {
    validate_totp_code(&request.code)?;

    let backup_codes = state
        .two_factor_service
        .enable(request.user_id, &request.code)
        .await?;

    Ok(Json(EnableResponse {
        backup_codes,
        message: "二要素認証を有効化しました。バックアップコードを安全に保管してください"
            .to_string(),
    }))
}

// === 2FA Verify ===

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub user_id: Uuid,
    pub code: String,
    #[serde(default)]
    pub is_backup_code: bool,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
}

/// POST /api/2fa/verify
///
/// 定常検証（TOTPコードまたはバックアップコード）
///
/// # Note
/// ロックアウト中は 429 を返す（コードの正誤は評価しない）
pub async fn verify_2fa(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, AppError> {
    validate_verification_code(&request.code, request.is_backup_code)?;

    let valid = state
        .two_factor_service
        .verify(request.user_id, &request.code, request.is_backup_code)
        .await?;

    Ok(Json(VerifyResponse { valid }))
}

// === 2FA Disable ===

#[derive(Debug, Deserialize)]
pub struct DisableRequest {
    pub user_id: Uuid,
    pub password: String,
    /// 任意。指定時はロックアウト込みの定常検証を通す
    pub code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DisableResponse {
    pub message: String,
}

/// POST /api/2fa/disable
///
/// 2FA無効化
///
/// # Security
/// - パスワード確認必須
pub async fn disable_2fa(
    State(state): State<AppState>,
    Json(request): Json<DisableRequest>,
) -> Result<Json<DisableResponse>, AppError> {
    validate_password(&request.password)?;
    if let Some(code) = &request.code {
        validate_totp_code(code)?;
    }

    state
        .two_factor_service
        .disable(request.user_id, &request.password, request.code.as_deref())
        .await?;

    Ok(Json(DisableResponse {
        message: "二要素認証を無効化しました".to_string(),
    }))
}

// === 2FA Status ===

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub enabled: bool,
    pub backup_codes_remaining: i64,
    pub last_used: Option<OffsetDateTime>,
}

/// GET /api/2fa/status
///
/// 状態照会（読み取り専用）。未設定ユーザーは「無効・コード0」を返す
pub async fn two_factor_status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Result<Json<StatusResponse>, AppError> {
    let status = state.two_factor_service.status(params.user_id).await?;

    Ok(Json(StatusResponse {
        enabled: status.enabled,
        backup_codes_remaining: status.backup_codes_remaining,
        last_used: status.last_used,
    }))
}

// === Backup Code Regeneration ===

#[derive(Debug, Deserialize)]
pub struct RegenerateRequest {
    pub user_id: Uuid,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegenerateResponse {
    /// 平文バックアップコード。この一度しか返却されない
    pub backup_codes: Vec<String>,
    pub message: String,
}

/// POST /api/2fa/backup-codes/regenerate
///
/// バックアップコード再発行（旧バッチは全て失効）
///
/// # Security
/// - パスワード確認必須
pub async fn regenerate_backup_codes(
    State(state): State<AppState>,
    Json(request): Json<RegenerateRequest>,
) -> Result<Json<RegenerateResponse>, AppError> {
    validate_password(&request.password)?;

    let backup_codes = state
        .two_factor_service
        .regenerate_backup_codes(request.user_id, &request.password)
        .await?;

    Ok(Json(RegenerateResponse {
        backup_codes,
        message: "バックアップコードを再発行しました。以前のコードは使用できません".to_string(),
    }))
}

// === Token Test ===

#[derive(Debug, Deserialize)]
pub struct TestTokenRequest {
    pub secret: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct TestTokenResponse {
    pub verified: bool,
    pub message: String,
}

/// POST /api/2fa/test
///
/// セットアップ中の動作確認用。任意シークレットに対する純粋なコード検証
/// （永続化・ロックアウトなし）
pub async fn test_token(
    State(state): State<AppState>,
    Json(request): Json<TestTokenRequest>,
) -> Result<Json<TestTokenResponse>, AppError> {
    validate_totp_code(&request.code)?;

    let verified = state
        .two_factor_service
        .test_token(&request.secret, &request.code)?;

    let message = if verified {
        "認証コードを確認しました".to_string()
    } else {
        "認証コードが一致しません".to_string()
    };

    Ok(Json(TestTokenResponse { verified, message }))
}

// === Helper Functions ===

/// パスワードバリデーション
fn validate_password(password: &str) -> Result<(), AppError> {
    if password.is_empty() {
        return Err(AppError::Validation("パスワードは必須です".to_string()));
    }
    if password.len() < 8 {
        return Err(AppError::Validation(
            "パスワードは8文字以上で入力してください".to_string(),
        ));
    }
    Ok(())
}

/// TOTPコードバリデーション
fn validate_totp_code(code: &str) -> Result<(), AppError> {
    if code.is_empty() {
        return Err(AppError::Validation("認証コードは必須です".to_string()));
    }
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Validation(
            "認証コードは6桁の数字で入力してください".to_string(),
        ));
    }
    Ok(())
}

/// 検証コードバリデーション（TOTP・バックアップコード共用）
fn validate_verification_code(code: &str, is_backup_code: bool) -> Result<(), AppError> {
    if is_backup_code {
        if code.trim().is_empty() {
            return Err(AppError::Validation(
                "バックアップコードは必須です".to_string(),
            ));
        }
        if code.len() > 32 {
            return Err(AppError::Validation(
                "バックアップコードが長すぎます".to_string(),
            ));
        }
        Ok(())
    } else {
        validate_totp_code(code)
    }
}
