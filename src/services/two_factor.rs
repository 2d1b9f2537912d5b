use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::repositories::{TwoFactorRepository, UserRepository};
use crate::services::auth::AuthService;
use crate::services::backup_codes::BackupCodeService;
use crate::services::lockout::LockoutPolicy;
use crate::services::provisioning::QrRenderer;
use crate::services::totp::TotpService;

/// setup の結果
///
/// secret と otpauth URI はこのレスポンスでのみ平文返却される。
/// 以降のどの読み取り経路からも取得できない
#[derive(Debug)]
pub struct SetupOutcome {
    pub secret: String,
    pub otpauth_uri: String,
    /// QR画像（data URI）。レンダリング縮退時は None
    pub qr_code: Option<String>,
}

/// status の結果
#[derive(Debug)]
pub struct TwoFactorStatus {
    pub enabled: bool,
    /// 未使用バックアップコード数
    pub backup_codes_remaining: i64,
    pub last_used: Option<OffsetDateTime>,
}

/// 二要素認証オーケストレーター
///
/// 呼び出し側が触るのはこのサービスのみ。TOTPエンジン・バックアップコード・
/// ロックアウトポリシー・QRレンダラーを合成する。
/// コラボレーターは注入（フェイク差し替えでテスト可能）
#[derive(Clone)]
pub struct TwoFactorService {
    record_repo: Arc<dyn TwoFactorRepository>,
    user_repo: Arc<dyn UserRepository>,
    qr_renderer: Arc<dyn QrRenderer>,
    totp: TotpService,
    backup_codes: BackupCodeService,
    lockout: LockoutPolicy,
    auth: AuthService,
    purge_on_disable: bool,
}

impl TwoFactorService {
    /// 新しい TwoFactorService を作成
    pub fn new(
        user_repo: Arc<dyn UserRepository>,
        record_repo: Arc<dyn TwoFactorRepository>,
        qr_renderer: Arc<dyn QrRenderer>,
        totp: TotpService,
        backup_codes: BackupCodeService,
        lockout: LockoutPolicy,
        purge_on_disable: bool,
    ) -> Self {
        let auth = AuthService::new(user_repo.clone());
        Self {
            record_repo,
            user_repo,
            qr_renderer,
            totp,
            backup_codes,
            lockout,
            auth,
            purge_on_disable,
        }
    }

    /// 2FA設定を開始
    ///
    /// 既存レコードの有無にかかわらず新しいシークレットで上書きし、
    /// enabled = false に戻す。バックアップコードは有効化時まで発行しない
    ///
    /// # Security
    /// - シークレット平文はレスポンスにのみ含め、ログには出力しない
    pub async fn setup(&self, user_id: Uuid) -> Result<SetupOutcome, AppError> {
        let user = self
            .user_repo
            .find_by_id(user_id)
            .await?
            .ok_or(AppError::UserNotFound)?;

        let secret = TotpService::generate_secret();
        let encrypted = self.totp.encrypt_secret(&secret)?;

        self.record_repo.upsert_secret(user_id, &encrypted).await?;

        let otpauth_uri = self.totp.provisioning_uri(&user.email, &secret)?;
        let qr_code = self.render_qr_with_fallback(&user.email, &secret, &otpauth_uri);

        tracing::info!(user_id = %user_id, "2FA設定開始");

        Ok(SetupOutcome {
            secret,
            otpauth_uri,
            qr_code,
        })
    }

    /// QRレンダリングのフォールバックチェーン
    ///
    /// 発行者付きURI → 発行者省略の短縮URI の順に試行し、
    /// 全滅してもセットアップは縮退継続（手動入力用にシークレットは返る）
    fn render_qr_with_fallback(
        &self,
        account: &str,
        secret: &str,
        full_uri: &str,
    ) -> Option<String> {
        let mut attempts: Vec<String> = vec![full_uri.to_string()];
        if let Ok(bare) = self.totp.provisioning_uri_bare(account, secret) {
            attempts.push(bare);
        }

        for uri in &attempts {
            match self.qr_renderer.render(uri) {
                Ok(png_base64) => {
                    return Some(format!("data:image/png;base64,{}", png_base64));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "QRコード生成失敗、フォールバックを試行");
                }
            }
        }

        tracing::warn!(account = %account, "QRコード生成に全て失敗（手動入力のみで継続）");
        None
    }

    /// 有効化確認
    ///
    /// セットアップ済みシークレットに対する初回コード検証。
    /// 成功時のみバックアップコードを発行し、有効化と同一トランザクションで保存。
    /// 平文コードはこの戻り値の一度しか返却されない
    pub async fn enable(&self, user_id: Uuid, code: &str) -> Result<Vec<String>, AppError> {
        let record = self
            .record_repo
            .find_by_user_id(user_id)
            .await?
            .ok_or(AppError::TotpSetupRequired)?;

        if record.enabled {
            return Err(AppError::TotpAlreadyEnabled);
        }

        let secret = self.totp.decrypt_secret(&record.secret_encrypted)?;

        if !self.totp.verify_code(&secret, code)? {
            return Err(AppError::TotpInvalid);
        }

        let (codes, hashes) = self.backup_codes.generate();
        self.record_repo.enable_with_codes(user_id, &hashes).await?;

        tracing::info!(user_id = %user_id, codes = codes.len(), "2FA有効化完了");

        Ok(codes)
    }

    /// ログイン時などの定常検証
    ///
    /// # Returns
    /// - レコード無し・無効状態: `Ok(false)`（2FA未使用はエラーではない）
    /// - ロックアウト中: `Err(TotpLocked)`（コードの正誤は評価しない）
    /// - それ以外: コード照合結果
    ///
    /// 成功でカウンターリセット＋last_used更新、失敗でカウンター加算
    /// （閾値到達で locked_until 設定）。TOTP・バックアップコードの
    /// どちらの失敗も同じカウンターに計上する
    pub async fn verify(
        &self,
        user_id: Uuid,
        code: &str,
        is_backup_code: bool,
    ) -> Result<bool, AppError> {
        let record = match self.record_repo.find_by_user_id(user_id).await? {
            Some(record) if record.enabled => record,
            _ => return Ok(false),
        };

        let now = OffsetDateTime::now_utc();
        if let Some(remaining) = self.lockout.remaining_lockout(record.locked_until, now) {
            tracing::warn!(user_id = %user_id, "ロックアウト中の検証試行を拒否");
            return Err(AppError::TotpLocked {
                retry_after_secs: remaining.whole_seconds().max(1),
            });
        }

        let verified = if is_backup_code {
            let candidate_hash = BackupCodeService::hash_code(code);
            self.record_repo
                .consume_backup_code(user_id, &candidate_hash)
                .await?
        } else {
            let secret = self.totp.decrypt_secret(&record.secret_encrypted)?;
            self.totp.verify_code(&secret, code)?
        };

        if verified {
            self.record_repo.record_success(user_id).await?;
            tracing::debug!(user_id = %user_id, "2FA検証成功");
            Ok(true)
        } else {
            let state = self
                .record_repo
                .record_failure(
                    user_id,
                    self.lockout.max_attempts,
                    self.lockout.cooldown_secs,
                )
                .await?;

            if self.lockout.should_lock(state.failed_attempts.max(0) as u32) {
                tracing::warn!(
                    user_id = %user_id,
                    failed_attempts = state.failed_attempts,
                    "連続失敗によりロックアウト発動"
                );
            }

            Ok(false)
        }
    }

    /// 2FA無効化
    ///
    /// アカウントパスワードの再確認が必須。コードが渡された場合は
    /// ロックアウト込みの定常検証を通す（失敗時は状態変更なしで中断）
    pub async fn disable(
        &self,
        user_id: Uuid,
        password: &str,
        code: Option<&str>,
    ) -> Result<(), AppError> {
        self.auth.verify_user_password(user_id, password).await?;

        let record = self
            .record_repo
            .find_by_user_id(user_id)
            .await?
            .ok_or(AppError::TotpNotEnabled)?;

        if !record.enabled {
            return Err(AppError::TotpNotEnabled);
        }

        if let Some(code) = code {
            if !self.verify(user_id, code, false).await? {
                return Err(AppError::TotpInvalid);
            }
        }

        if self.purge_on_disable {
            self.record_repo.purge(user_id).await?;
            tracing::info!(user_id = %user_id, "2FA無効化完了（シークレット削除）");
        } else {
            self.record_repo.disable(user_id).await?;
            tracing::info!(user_id = %user_id, "2FA無効化完了");
        }

        Ok(())
    }

    /// 状態照会（読み取り専用）
    ///
    /// レコードが無い場合もエラーにせず「無効・コード0」を返す
    pub async fn status(&self, user_id: Uuid) -> Result<TwoFactorStatus, AppError> {
        let record = match self.record_repo.find_by_user_id(user_id).await? {
            Some(record) => record,
            None => {
                return Ok(TwoFactorStatus {
                    enabled: false,
                    backup_codes_remaining: 0,
                    last_used: None,
                });
            }
        };

        let backup_codes_remaining = self.record_repo.count_unused_codes(user_id).await?;

        Ok(TwoFactorStatus {
            enabled: record.enabled,
            backup_codes_remaining,
            last_used: record.last_used,
        })
    }

    /// バックアップコード再発行
    ///
    /// パスワード再確認必須。旧バッチは全て無効化され、新しい平文コードは
    /// この戻り値の一度しか返却されない
    pub async fn regenerate_backup_codes(
        &self,
        user_id: Uuid,
        password: &str,
    ) -> Result<Vec<String>, AppError> {
        self.auth.verify_user_password(user_id, password).await?;

        let record = self
            .record_repo
            .find_by_user_id(user_id)
            .await?
            .ok_or(AppError::TotpNotEnabled)?;

        if !record.enabled {
            return Err(AppError::TotpNotEnabled);
        }

        let (codes, hashes) = self.backup_codes.generate();
        self.record_repo.replace_codes(user_id, &hashes).await?;

        tracing::info!(user_id = %user_id, codes = codes.len(), "バックアップコード再発行");

        Ok(codes)
    }

    /// 任意シークレットに対するコード検証（セットアップ中の動作確認用）
    ///
    /// 永続化もロックアウトも関与しない純粋なエンジン呼び出し
    pub fn test_token(&self, secret: &str, code: &str) -> Result<bool, AppError> {
        self.totp.verify_code(secret, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{HashMap, HashSet};
    use std::sync::{Mutex, OnceLock};

    use async_trait::async_trait;

    use crate::models::{BackupCode, TwoFactorRecord, User};
    use crate::repositories::LockoutState;
    use crate::services::auth::hash_password;

    const TEST_PASSWORD: &str = "password123";

    /// argon2は遅いのでテスト全体でハッシュを1回だけ計算する
    fn test_password_hash() -> String {
        static HASH: OnceLock<String> = OnceLock::new();
        HASH.get_or_init(|| hash_password(TEST_PASSWORD).unwrap())
            .clone()
    }

    fn unix_now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    // === インメモリフェイク ===

    struct FakeUserRepository {
        users: Mutex<HashMap<Uuid, User>>,
    }

    #[async_trait]
    impl crate::repositories::UserRepository for FakeUserRepository {
        async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
            Ok(self.users.lock().unwrap().get(&user_id).cloned())
        }
    }

    #[derive(Default)]
    struct FakeTwoFactorRepository {
        records: Mutex<HashMap<Uuid, TwoFactorRecord>>,
        codes: Mutex<Vec<BackupCode>>,
    }

    impl FakeTwoFactorRepository {
        fn set_locked_until(&self, user_id: Uuid, locked_until: Option<OffsetDateTime>) {
            let mut records = self.records.lock().unwrap();
            records.get_mut(&user_id).unwrap().locked_until = locked_until;
        }

        fn failed_attempts(&self, user_id: Uuid) -> i32 {
            self.records.lock().unwrap()[&user_id].failed_attempts
        }
    }

    #[async_trait]
    impl TwoFactorRepository for FakeTwoFactorRepository {
        async fn find_by_user_id(
            &self,
            user_id: Uuid,
        ) -> Result<Option<TwoFactorRecord>, sqlx::Error> {
            Ok(self.records.lock().unwrap().get(&user_id).cloned())
        }

        async fn upsert_secret(
            &self,
            user_id: Uuid,
            secret_encrypted: &[u8],
        ) -> Result<TwoFactorRecord, sqlx::Error> {
            let now = OffsetDateTime::now_utc();
            let mut records = self.records.lock().unwrap();
            let record = records
                .entry(user_id)
                .and_modify(|r| {
                    r.secret_encrypted = secret_encrypted.to_vec();
                    r.enabled = false;
                    r.setup_at = now;
                    r.failed_attempts = 0;
                    r.locked_until = None;
                    r.updated_at = now;
                })
                .or_insert_with(|| TwoFactorRecord {
                    user_id,
                    secret_encrypted: secret_encrypted.to_vec(),
                    enabled: false,
                    setup_at: now,
                    failed_attempts: 0,
                    locked_until: None,
                    last_used: None,
                    created_at: now,
                    updated_at: now,
                });
            let record = record.clone();
            drop(records);

            self.codes.lock().unwrap().retain(|c| c.user_id != user_id);
            Ok(record)
        }

        async fn enable_with_codes(
            &self,
            user_id: Uuid,
            code_hashes: &[String],
        ) -> Result<(), sqlx::Error> {
            {
                let mut records = self.records.lock().unwrap();
                records.get_mut(&user_id).ok_or(sqlx::Error::RowNotFound)?.enabled = true;
            }

            self.replace_codes(user_id, code_hashes).await
        }

        async fn replace_codes(
            &self,
            user_id: Uuid,
            code_hashes: &[String],
        ) -> Result<(), sqlx::Error> {
            let now = OffsetDateTime::now_utc();
            let mut codes = self.codes.lock().unwrap();
            codes.retain(|c| c.user_id != user_id);
            for code_hash in code_hashes {
                codes.push(BackupCode {
                    id: Uuid::new_v4(),
                    user_id,
                    code_hash: code_hash.clone(),
                    used: false,
                    used_at: None,
                    created_at: now,
                });
            }
            Ok(())
        }

        async fn disable(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
            if let Some(record) = self.records.lock().unwrap().get_mut(&user_id) {
                record.enabled = false;
            }
            Ok(())
        }

        async fn purge(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
            self.records.lock().unwrap().remove(&user_id);
            self.codes.lock().unwrap().retain(|c| c.user_id != user_id);
            Ok(())
        }

        async fn consume_backup_code(
            &self,
            user_id: Uuid,
            code_hash: &str,
        ) -> Result<bool, sqlx::Error> {
            let mut codes = self.codes.lock().unwrap();
            match codes
                .iter_mut()
                .find(|c| c.user_id == user_id && c.code_hash == code_hash && !c.used)
            {
                Some(code) => {
                    code.used = true;
                    code.used_at = Some(OffsetDateTime::now_utc());
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn count_unused_codes(&self, user_id: Uuid) -> Result<i64, sqlx::Error> {
            let codes = self.codes.lock().unwrap();
            Ok(codes.iter().filter(|c| c.user_id == user_id && !c.used).count() as i64)
        }

        async fn record_success(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(&user_id).ok_or(sqlx::Error::RowNotFound)?;
            record.failed_attempts = 0;
            record.locked_until = None;
            record.last_used = Some(OffsetDateTime::now_utc());
            Ok(())
        }

        async fn record_failure(
            &self,
            user_id: Uuid,
            max_attempts: u32,
            cooldown_secs: i64,
        ) -> Result<LockoutState, sqlx::Error> {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(&user_id).ok_or(sqlx::Error::RowNotFound)?;
            record.failed_attempts += 1;
            if record.failed_attempts >= max_attempts as i32 {
                record.locked_until =
                    Some(OffsetDateTime::now_utc() + time::Duration::seconds(cooldown_secs));
            }
            Ok(LockoutState {
                failed_attempts: record.failed_attempts,
                locked_until: record.locked_until,
            })
        }
    }

    /// 常に固定PNGを返すレンダラー
    struct StubQrRenderer;

    impl QrRenderer for StubQrRenderer {
        fn render(&self, _otpauth_uri: &str) -> Result<String, String> {
            Ok("cGlwZQ==".to_string())
        }
    }

    /// 常に失敗するレンダラー（縮退動作の検証用）
    struct FailingQrRenderer;

    impl QrRenderer for FailingQrRenderer {
        fn render(&self, _otpauth_uri: &str) -> Result<String, String> {
            Err("renderer down".to_string())
        }
    }

    // === テストハーネス ===

    struct Harness {
        service: TwoFactorService,
        repo: Arc<FakeTwoFactorRepository>,
        totp: TotpService,
        user_id: Uuid,
    }

    fn build_harness(qr_renderer: Arc<dyn QrRenderer>, purge_on_disable: bool) -> Harness {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let mut users = HashMap::new();
        users.insert(
            user_id,
            User {
                id: user_id,
                email: "tester@example.com".to_string(),
                password_hash: Some(test_password_hash()),
                created_at: now,
                updated_at: now,
            },
        );

        let user_repo = Arc::new(FakeUserRepository {
            users: Mutex::new(users),
        });
        let repo = Arc::new(FakeTwoFactorRepository::default());
        let key_base64 = STANDARD.encode([7u8; 32]);
        let totp = TotpService::new("TestApp".to_string(), &key_base64).unwrap();

        let service = TwoFactorService::new(
            user_repo,
            repo.clone(),
            qr_renderer,
            totp.clone(),
            BackupCodeService::new(10, 8),
            LockoutPolicy::new(5, 900),
            purge_on_disable,
        );

        Harness {
            service,
            repo,
            totp,
            user_id,
        }
    }

    fn harness() -> Harness {
        build_harness(Arc::new(StubQrRenderer), false)
    }

    impl Harness {
        fn current_code(&self, secret: &str) -> String {
            self.totp.generate_code_at(secret, unix_now()).unwrap()
        }

        /// 現在の許容ウィンドウ（±2ステップ）のどれとも一致しない6桁コード
        fn wrong_code(&self, secret: &str) -> String {
            let now = unix_now() as i64;
            let valid: HashSet<String> = (-2..=2)
                .map(|i| {
                    self.totp
                        .generate_code_at(secret, (now + i * 30) as u64)
                        .unwrap()
                })
                .collect();
            (0..1_000_000)
                .map(|n| format!("{:06}", n))
                .find(|c| !valid.contains(c))
                .unwrap()
        }

        async fn setup_and_enable(&self) -> (String, Vec<String>) {
            let outcome = self.service.setup(self.user_id).await.unwrap();
            let code = self.current_code(&outcome.secret);
            let backup_codes = self.service.enable(self.user_id, &code).await.unwrap();
            (outcome.secret, backup_codes)
        }
    }

    // === setup ===

    #[tokio::test]
    async fn setup_creates_disabled_record_with_qr() {
        let h = harness();

        let outcome = h.service.setup(h.user_id).await.unwrap();
        assert!(outcome.otpauth_uri.starts_with("otpauth://totp/"));
        assert_eq!(
            outcome.qr_code.as_deref(),
            Some("data:image/png;base64,cGlwZQ==")
        );

        let record = h.repo.find_by_user_id(h.user_id).await.unwrap().unwrap();
        assert!(!record.enabled);
        assert_eq!(record.failed_attempts, 0);

        // 有効化前は検証ゲートの対象外
        let code = h.current_code(&outcome.secret);
        assert!(!h.service.verify(h.user_id, &code, false).await.unwrap());
    }

    #[tokio::test]
    async fn setup_unknown_user_is_not_found() {
        let h = harness();
        let result = h.service.setup(Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::UserNotFound)));
    }

    #[tokio::test]
    async fn setup_succeeds_when_qr_rendering_fails() {
        let h = build_harness(Arc::new(FailingQrRenderer), false);

        // レンダラー全滅でもセットアップ自体は成功（手動入力用にシークレットは返る）
        let outcome = h.service.setup(h.user_id).await.unwrap();
        assert!(outcome.qr_code.is_none());
        assert!(!outcome.secret.is_empty());
    }

    #[tokio::test]
    async fn setup_overwrites_enabled_record() {
        let h = harness();
        let (old_secret, _) = h.setup_and_enable().await;

        // 再セットアップで新シークレット・無効状態に戻り、旧コードは破棄
        let outcome = h.service.setup(h.user_id).await.unwrap();
        assert_ne!(outcome.secret, old_secret);

        let record = h.repo.find_by_user_id(h.user_id).await.unwrap().unwrap();
        assert!(!record.enabled);
        assert_eq!(h.repo.count_unused_codes(h.user_id).await.unwrap(), 0);
    }

    // === enable ===

    #[tokio::test]
    async fn enable_without_setup_is_rejected() {
        let h = harness();
        let result = h.service.enable(h.user_id, "123456").await;
        assert!(matches!(result, Err(AppError::TotpSetupRequired)));
    }

    #[tokio::test]
    async fn enable_with_wrong_code_changes_nothing() {
        let h = harness();
        let outcome = h.service.setup(h.user_id).await.unwrap();

        let wrong = h.wrong_code(&outcome.secret);
        let result = h.service.enable(h.user_id, &wrong).await;
        assert!(matches!(result, Err(AppError::TotpInvalid)));

        // 失敗時はバックアップコード未発行・無効のまま
        let record = h.repo.find_by_user_id(h.user_id).await.unwrap().unwrap();
        assert!(!record.enabled);
        assert_eq!(h.repo.count_unused_codes(h.user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn enable_issues_backup_codes_once() {
        let h = harness();
        let (_, backup_codes) = h.setup_and_enable().await;

        assert_eq!(backup_codes.len(), 10);

        let record = h.repo.find_by_user_id(h.user_id).await.unwrap().unwrap();
        assert!(record.enabled);

        let status = h.service.status(h.user_id).await.unwrap();
        assert!(status.enabled);
        assert_eq!(status.backup_codes_remaining, 10);
    }

    #[tokio::test]
    async fn enable_twice_is_rejected() {
        let h = harness();
        let (secret, _) = h.setup_and_enable().await;

        let code = h.current_code(&secret);
        let result = h.service.enable(h.user_id, &code).await;
        assert!(matches!(result, Err(AppError::TotpAlreadyEnabled)));
    }

    // === verify ===

    #[tokio::test]
    async fn verify_without_record_is_false_not_error() {
        let h = harness();
        assert!(!h.service.verify(h.user_id, "123456", false).await.unwrap());
        assert!(!h.service.verify(h.user_id, "ABCD2345", true).await.unwrap());
    }

    #[tokio::test]
    async fn verify_correct_code_resets_counter() {
        let h = harness();
        let (secret, _) = h.setup_and_enable().await;

        let wrong = h.wrong_code(&secret);
        for _ in 0..3 {
            assert!(!h.service.verify(h.user_id, &wrong, false).await.unwrap());
        }
        assert_eq!(h.repo.failed_attempts(h.user_id), 3);

        let code = h.current_code(&secret);
        assert!(h.service.verify(h.user_id, &code, false).await.unwrap());

        let record = h.repo.find_by_user_id(h.user_id).await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 0);
        assert!(record.last_used.is_some());
    }

    #[tokio::test]
    async fn backup_code_verifies_exactly_once() {
        let h = harness();
        let (_, backup_codes) = h.setup_and_enable().await;

        let code_a = &backup_codes[0];
        let code_b = &backup_codes[1];

        assert!(h.service.verify(h.user_id, code_a, true).await.unwrap());
        // 同一コードの再使用は直後でも失敗
        assert!(!h.service.verify(h.user_id, code_a, true).await.unwrap());
        // 別コードは使用可能
        assert!(h.service.verify(h.user_id, code_b, true).await.unwrap());

        let status = h.service.status(h.user_id).await.unwrap();
        assert_eq!(status.backup_codes_remaining, 8);
    }

    #[tokio::test]
    async fn backup_code_accepts_lowercase_and_separator() {
        let h = harness();
        let (_, backup_codes) = h.setup_and_enable().await;

        let sloppy = format!(" {} ", backup_codes[0].to_lowercase());
        assert!(h.service.verify(h.user_id, &sloppy, true).await.unwrap());
    }

    #[tokio::test]
    async fn sixth_attempt_after_five_failures_is_locked_out() {
        let h = harness();
        let (secret, _) = h.setup_and_enable().await;

        let wrong = h.wrong_code(&secret);
        for _ in 0..5 {
            assert!(!h.service.verify(h.user_id, &wrong, false).await.unwrap());
        }

        // 6回目は正しいコードでも正誤評価せずロックアウトエラー
        let code = h.current_code(&secret);
        match h.service.verify(h.user_id, &code, false).await {
            Err(AppError::TotpLocked { retry_after_secs }) => {
                assert!(retry_after_secs > 0);
                assert!(retry_after_secs <= 900);
            }
            other => panic!("expected TotpLocked, got {:?}", other.map(|_| ())),
        }

        // ロックアウト中の試行はカウンターを消費しない
        assert_eq!(h.repo.failed_attempts(h.user_id), 5);
    }

    #[tokio::test]
    async fn lockout_expires_lazily_and_counter_resets() {
        let h = harness();
        let (secret, _) = h.setup_and_enable().await;

        let wrong = h.wrong_code(&secret);
        for _ in 0..5 {
            h.service.verify(h.user_id, &wrong, false).await.unwrap();
        }

        // クールダウン経過を模擬
        h.repo.set_locked_until(
            h.user_id,
            Some(OffsetDateTime::now_utc() - time::Duration::seconds(1)),
        );

        let code = h.current_code(&secret);
        assert!(h.service.verify(h.user_id, &code, false).await.unwrap());
        assert_eq!(h.repo.failed_attempts(h.user_id), 0);
    }

    #[tokio::test]
    async fn backup_code_failure_counts_toward_lockout() {
        let h = harness();
        h.setup_and_enable().await;

        for _ in 0..5 {
            assert!(!h.service.verify(h.user_id, "WRONGCODE", true).await.unwrap());
        }

        let result = h.service.verify(h.user_id, "WRONGCODE", true).await;
        assert!(matches!(result, Err(AppError::TotpLocked { .. })));
    }

    // === disable ===

    #[tokio::test]
    async fn disable_with_wrong_password_changes_nothing() {
        let h = harness();
        let (secret, _) = h.setup_and_enable().await;

        // 正しいコード付きでもパスワード不一致なら拒否
        let code = h.current_code(&secret);
        let result = h
            .service
            .disable(h.user_id, "wrong-password", Some(&code))
            .await;
        assert!(matches!(result, Err(AppError::PasswordInvalid)));

        let record = h.repo.find_by_user_id(h.user_id).await.unwrap().unwrap();
        assert!(record.enabled);
    }

    #[tokio::test]
    async fn disable_with_invalid_code_aborts() {
        let h = harness();
        let (secret, _) = h.setup_and_enable().await;

        let wrong = h.wrong_code(&secret);
        let result = h
            .service
            .disable(h.user_id, TEST_PASSWORD, Some(&wrong))
            .await;
        assert!(matches!(result, Err(AppError::TotpInvalid)));

        let record = h.repo.find_by_user_id(h.user_id).await.unwrap().unwrap();
        assert!(record.enabled);
    }

    #[tokio::test]
    async fn disable_keeps_secret_by_default() {
        let h = harness();
        let (secret, _) = h.setup_and_enable().await;

        let code = h.current_code(&secret);
        h.service
            .disable(h.user_id, TEST_PASSWORD, Some(&code))
            .await
            .unwrap();

        // シークレットは残り、enabled のみ落ちる
        let record = h.repo.find_by_user_id(h.user_id).await.unwrap().unwrap();
        assert!(!record.enabled);
        assert!(!record.secret_encrypted.is_empty());

        // 無効化後の検証は false（エラーではない）
        let code = h.current_code(&secret);
        assert!(!h.service.verify(h.user_id, &code, false).await.unwrap());
    }

    #[tokio::test]
    async fn disable_purges_record_when_configured() {
        let h = build_harness(Arc::new(StubQrRenderer), true);
        h.setup_and_enable().await;

        h.service.disable(h.user_id, TEST_PASSWORD, None).await.unwrap();

        assert!(h.repo.find_by_user_id(h.user_id).await.unwrap().is_none());
        let status = h.service.status(h.user_id).await.unwrap();
        assert!(!status.enabled);
        assert_eq!(status.backup_codes_remaining, 0);
    }

    #[tokio::test]
    async fn disable_when_not_enabled_is_rejected() {
        let h = harness();
        h.service.setup(h.user_id).await.unwrap();

        let result = h.service.disable(h.user_id, TEST_PASSWORD, None).await;
        assert!(matches!(result, Err(AppError::TotpNotEnabled)));
    }

    // === regenerate ===

    #[tokio::test]
    async fn regenerate_invalidates_previous_batch() {
        let h = harness();
        let (_, old_codes) = h.setup_and_enable().await;

        let new_codes = h
            .service
            .regenerate_backup_codes(h.user_id, TEST_PASSWORD)
            .await
            .unwrap();
        assert_eq!(new_codes.len(), 10);

        // 旧コードは失効、新コードは有効
        assert!(!h.service.verify(h.user_id, &old_codes[0], true).await.unwrap());
        assert!(h.service.verify(h.user_id, &new_codes[0], true).await.unwrap());
    }

    #[tokio::test]
    async fn regenerate_requires_enabled_record() {
        let h = harness();
        h.service.setup(h.user_id).await.unwrap();

        let result = h
            .service
            .regenerate_backup_codes(h.user_id, TEST_PASSWORD)
            .await;
        assert!(matches!(result, Err(AppError::TotpNotEnabled)));
    }

    #[tokio::test]
    async fn regenerate_with_wrong_password_is_rejected() {
        let h = harness();
        h.setup_and_enable().await;

        let result = h
            .service
            .regenerate_backup_codes(h.user_id, "wrong-password")
            .await;
        assert!(matches!(result, Err(AppError::PasswordInvalid)));

        // 既存バッチはそのまま
        assert_eq!(h.repo.count_unused_codes(h.user_id).await.unwrap(), 10);
    }

    // === status / test_token ===

    #[tokio::test]
    async fn status_defaults_for_absent_record() {
        let h = harness();

        let status = h.service.status(h.user_id).await.unwrap();
        assert!(!status.enabled);
        assert_eq!(status.backup_codes_remaining, 0);
        assert!(status.last_used.is_none());
    }

    #[tokio::test]
    async fn test_token_is_pure_passthrough() {
        let h = harness();
        let secret = TotpService::generate_secret();

        let code = h.current_code(&secret);
        assert!(h.service.test_token(&secret, &code).unwrap());

        let wrong = h.wrong_code(&secret);
        assert!(!h.service.test_token(&secret, &wrong).unwrap());

        // 永続化は発生しない
        assert!(h.repo.find_by_user_id(h.user_id).await.unwrap().is_none());
    }
}
