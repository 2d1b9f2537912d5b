use totp_rs::TOTP;

/// QRコードレンダラー
///
/// otpauth:// URI を受け取りQR画像（Base64エンコードPNG）を返す。
/// 失敗してもセットアップ全体は失敗させない（呼び出し側でフォールバック）
pub trait QrRenderer: Send + Sync {
    fn render(&self, otpauth_uri: &str) -> Result<String, String>;
}

/// totp-rs 同梱のQR生成を使う標準実装
#[derive(Clone, Default)]
pub struct TotpQrRenderer;

impl QrRenderer for TotpQrRenderer {
    fn render(&self, otpauth_uri: &str) -> Result<String, String> {
        let totp = TOTP::from_url(otpauth_uri).map_err(|e| format!("invalid otpauth url: {e}"))?;
        totp.get_qr_base64()
    }
}
