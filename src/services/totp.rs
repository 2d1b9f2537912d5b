use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, OsRng},
};
use data_encoding::BASE32;
use rand::RngCore;
use totp_rs::{Algorithm, TOTP};

use crate::error::AppError;

/// 検証時に許容する前後ステップ数（±60秒）
const VERIFY_SKEW: u8 = 2;
/// TOTPステップ幅（秒）
const STEP_SECS: u64 = 30;
/// コード桁数
const DIGITS: usize = 6;

/// TOTP (Time-based One-Time Password) エンジン
///
/// # Security
/// - シークレットはAES-256-GCMで暗号化してDB保存
/// - シークレット平文はログに出力しない
#[derive(Clone)]
pub struct TotpService {
    issuer: String,
    encryption_key: [u8; 32],
}

impl TotpService {
    /// 新しい TotpService を作成
    ///
    /// # Arguments
    /// * `issuer` - TOTP発行者名（アプリ名）
    /// * `encryption_key_base64` - Base64エンコードされた32バイトの暗号化キー
    pub fn new(issuer: String, encryption_key_base64: &str) -> Result<Self, AppError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let key_bytes = STANDARD.decode(encryption_key_base64).map_err(|e| {
            tracing::error!(error = ?e, "TOTP暗号化キーのBase64デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid encryption key format"))
        })?;

        if key_bytes.len() != 32 {
            tracing::error!(
                expected = 32,
                actual = key_bytes.len(),
                "TOTP暗号化キーの長さが不正"
            );
            return Err(AppError::Internal(anyhow::anyhow!(
                "encryption key must be 32 bytes"
            )));
        }

        let mut encryption_key = [0u8; 32];
        encryption_key.copy_from_slice(&key_bytes);

        Ok(Self {
            issuer,
            encryption_key,
        })
    }

    /// 20バイトのランダムシークレットを生成し、Base32でエンコード
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        BASE32.encode(&bytes)
    }

    /// シークレットをAES-256-GCMで暗号化
    ///
    /// # Returns
    /// 96ビットnonce (12バイト) + 暗号文
    pub fn encrypt_secret(&self, secret: &str) -> Result<Vec<u8>, AppError> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        // 96ビット (12バイト) のランダムnonce生成
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, secret.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレット暗号化エラー");
            AppError::Internal(anyhow::anyhow!("encryption error"))
        })?;

        // nonce + ciphertext を結合
        let mut result = Vec::with_capacity(12 + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// 暗号化されたシークレットを復号
    pub fn decrypt_secret(&self, encrypted: &[u8]) -> Result<String, AppError> {
        if encrypted.len() < 12 {
            tracing::error!(len = encrypted.len(), "暗号化データが短すぎる");
            return Err(AppError::Internal(anyhow::anyhow!(
                "encrypted data too short"
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        let (nonce_bytes, ciphertext) = encrypted.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|e| {
            tracing::error!(error = ?e, "シークレット復号エラー");
            AppError::Internal(anyhow::anyhow!("decryption error"))
        })?;

        String::from_utf8(plaintext).map_err(|e| {
            tracing::error!(error = ?e, "復号データのUTF-8変換エラー");
            AppError::Internal(anyhow::anyhow!("invalid utf8 after decryption"))
        })
    }

    /// 発行者付きの otpauth:// プロビジョニングURIを構築
    ///
    /// # Arguments
    /// * `account` - ユーザーのメールアドレス（アカウント識別子）
    /// * `secret` - Base32エンコードされたシークレット
    pub fn provisioning_uri(&self, account: &str, secret: &str) -> Result<String, AppError> {
        let totp = self.build_totp(secret, Some(self.issuer.clone()), account.to_string())?;
        Ok(totp.get_url())
    }

    /// 発行者パラメータを省いた短縮URI（QRフォールバック用）
    pub fn provisioning_uri_bare(&self, account: &str, secret: &str) -> Result<String, AppError> {
        let totp = self.build_totp(secret, None, account.to_string())?;
        Ok(totp.get_url())
    }

    /// TOTPコードを検証（現在時刻）
    ///
    /// # Note
    /// 前後2ステップの時間ウィンドウを許容（±60秒）。
    /// シークレット不正・コード形式不正は例外ではなく検証失敗として扱う
    pub fn verify_code(&self, secret: &str, code: &str) -> Result<bool, AppError> {
        let current_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| {
                tracing::error!(error = ?e, "システム時刻取得エラー");
                AppError::Internal(anyhow::anyhow!("system time error"))
            })?
            .as_secs();

        Ok(self.verify_code_at(secret, code, current_time))
    }

    /// TOTPコードを指定時刻で検証
    pub fn verify_code_at(&self, secret: &str, code: &str, timestamp: u64) -> bool {
        // 入力検証: コードは6桁の数字のみ
        if code.len() != DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }

        // check は内部で skew を考慮して検証
        match self.build_totp(secret, None, String::new()) {
            Ok(totp) => totp.check(code, timestamp),
            Err(_) => {
                tracing::warn!("シークレット形式不正のため検証失敗として扱う");
                false
            }
        }
    }

    /// 指定時刻のコードを生成（テスト・動作確認用）
    pub fn generate_code_at(&self, secret: &str, timestamp: u64) -> Result<String, AppError> {
        let totp = self.build_totp(secret, None, String::new()).map_err(|e| {
            tracing::error!(error = ?e, "TOTP作成エラー");
            AppError::Internal(anyhow::anyhow!("totp creation error"))
        })?;
        Ok(totp.generate(timestamp))
    }

    /// TOTP オブジェクトを作成
    fn build_totp(
        &self,
        secret: &str,
        issuer: Option<String>,
        account: String,
    ) -> Result<TOTP, totp_rs::TotpUrlError> {
        let secret_bytes = BASE32
            .decode(secret.as_bytes())
            .map_err(|_| totp_rs::TotpUrlError::Secret(secret.len().to_string()))?;

        TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            VERIFY_SKEW,
            STEP_SECS,
            secret_bytes,
            issuer,
            account,
        )
    }
}
