use secrecy::SecretBox;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: SecretBox<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // 2FA (TOTP) 設定
    /// TOTP発行者名（認証アプリに表示される）
    pub totp_issuer: String,
    /// AES-256暗号化キー（Base64エンコード、32バイト）
    pub encryption_key: SecretBox<String>,

    // ロックアウト設定
    /// 連続失敗回数の閾値（到達でロックアウト）
    #[serde(default = "default_lockout_max_attempts")]
    pub lockout_max_attempts: u32,
    /// ロックアウト期間（秒）
    #[serde(default = "default_lockout_cooldown_secs")]
    pub lockout_cooldown_secs: i64,

    // バックアップコード設定
    #[serde(default = "default_backup_code_count")]
    pub backup_code_count: usize,
    #[serde(default = "default_backup_code_length")]
    pub backup_code_length: usize,

    /// 無効化時にシークレットとバックアップコードを完全削除するか
    ///
    /// false の場合はシークレットを残し、再有効化時のQR再スキャンを不要にする
    #[serde(default)]
    pub purge_on_disable: bool,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_LOCKOUT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_LOCKOUT_COOLDOWN_SECS: i64 = 900;
const DEFAULT_BACKUP_CODE_COUNT: usize = 10;
const DEFAULT_BACKUP_CODE_LENGTH: usize = 8;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_lockout_max_attempts() -> u32 {
    DEFAULT_LOCKOUT_MAX_ATTEMPTS
}

fn default_lockout_cooldown_secs() -> i64 {
    DEFAULT_LOCKOUT_COOLDOWN_SECS
}

fn default_backup_code_count() -> usize {
    DEFAULT_BACKUP_CODE_COUNT
}

fn default_backup_code_length() -> usize {
    DEFAULT_BACKUP_CODE_LENGTH
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }
}
