use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("データベースエラー")]
    Database(#[from] sqlx::Error),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),

    #[error("ユーザーが見つかりません")]
    UserNotFound,

    #[error("パスワードが正しくありません")]
    PasswordInvalid,

    #[error("認証コードが無効です")]
    TotpInvalid,

    #[error("二要素認証は既に有効です")]
    TotpAlreadyEnabled,

    #[error("二要素認証が有効化されていません")]
    TotpNotEnabled,

    #[error("二要素認証の設定が必要です")]
    TotpSetupRequired,

    #[error("試行回数の上限に達しました（あと{retry_after_secs}秒）")]
    TotpLocked { retry_after_secs: i64 },
}

impl From<totp_rs::TotpUrlError> for AppError {
    fn from(e: totp_rs::TotpUrlError) -> Self {
        tracing::error!(error = ?e, "TOTP URL/シークレット形式エラー");
        AppError::Internal(anyhow::anyhow!("totp url error"))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<i64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, retry_after_secs) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            Self::Database(e) => {
                tracing::error!(error = ?e, "データベースエラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                    None,
                )
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                    None,
                )
            }
            Self::UserNotFound => (
                StatusCode::NOT_FOUND,
                "ユーザーが見つかりません".to_string(),
                None,
            ),
            Self::PasswordInvalid => (
                StatusCode::UNAUTHORIZED,
                "パスワードが正しくありません".to_string(),
                None,
            ),
            Self::TotpInvalid => (
                StatusCode::UNAUTHORIZED,
                "認証コードが正しくありません".to_string(),
                None,
            ),
            Self::TotpAlreadyEnabled => (
                StatusCode::CONFLICT,
                "二要素認証は既に有効です".to_string(),
                None,
            ),
            Self::TotpNotEnabled => (
                StatusCode::BAD_REQUEST,
                "二要素認証が有効化されていません".to_string(),
                None,
            ),
            Self::TotpSetupRequired => (
                StatusCode::BAD_REQUEST,
                "二要素認証の設定が必要です".to_string(),
                None,
            ),
            Self::TotpLocked { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "試行回数の上限に達しました。しばらく待ってから再試行してください".to_string(),
                Some(*retry_after_secs),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                retry_after_secs,
            }),
        )
            .into_response()
    }
}
