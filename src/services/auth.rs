use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

use crate::error::AppError;
use crate::models::User;
use crate::repositories::UserRepository;

/// パスワードをargon2idでハッシュ化
///
/// 本サービスはユーザー登録を行わないため実運用では未使用だが、
/// テストでフェイクユーザーを作る際に必要
pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| {
            tracing::error!(error = ?e, "パスワードハッシュ生成エラー");
            AppError::Internal(anyhow::anyhow!("password hash error"))
        })?;
    Ok(hash.to_string())
}

/// パスワード再確認サービス
///
/// 2FAの無効化・バックアップコード再発行の前提となる
/// アカウントパスワード確認を行う
#[derive(Clone)]
pub struct AuthService {
    user_repo: Arc<dyn UserRepository>,
}

impl AuthService {
    /// 新しい AuthService を作成
    pub fn new(user_repo: Arc<dyn UserRepository>) -> Self {
        Self { user_repo }
    }

    /// ユーザーIDとパスワードで本人確認を実行
    ///
    /// タイミング攻撃対策: パスワードハッシュを持たないユーザーにも
    /// ダミーのパスワード検証を実行
    pub async fn verify_user_password(
        &self,
        user_id: uuid::Uuid,
        password: &str,
    ) -> Result<User, AppError> {
        let user = self
            .user_repo
            .find_by_id(user_id)
            .await?
            .ok_or(AppError::UserNotFound)?;

        let password_hash = match &user.password_hash {
            Some(hash) => hash,
            None => {
                // タイミング攻撃対策: パスワード未設定（ソーシャルログイン等）でも
                // ダミーのパスワード検証を実行
                let dummy_hash = "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHQ$RWh6";
                let _ = self.verify_password(password, dummy_hash);
                tracing::warn!(user_id = %user_id, "パスワード確認失敗: パスワード未設定ユーザー");
                return Err(AppError::PasswordInvalid);
            }
        };

        if self.verify_password(password, password_hash)? {
            Ok(user)
        } else {
            tracing::warn!(user_id = %user_id, "パスワード確認失敗: パスワード不一致");
            Err(AppError::PasswordInvalid)
        }
    }

    /// パスワードを検証
    fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AppError> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| {
            tracing::error!(error = ?e, "パスワードハッシュのパースエラー");
            AppError::Internal(anyhow::anyhow!("password hash parse error"))
        })?;

        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_then_verify_roundtrip() {
        let hash = hash_password("correct horse battery").unwrap();
        let parsed = PasswordHash::new(&hash).unwrap();
        assert!(
            Argon2::default()
                .verify_password(b"correct horse battery", &parsed)
                .is_ok()
        );
        assert!(
            Argon2::default()
                .verify_password(b"wrong password", &parsed)
                .is_err()
        );
    }

    #[test]
    fn test_invalid_hash_format() {
        // 無効なハッシュ形式でエラーハンドリングを確認
        let parsed = PasswordHash::new("invalid_hash_format");
        assert!(parsed.is_err());
    }
}
