pub mod auth;
pub mod backup_codes;
pub mod lockout;
pub mod provisioning;
pub mod totp;
pub mod two_factor;

pub use auth::AuthService;
pub use backup_codes::BackupCodeService;
pub use lockout::LockoutPolicy;
pub use provisioning::{QrRenderer, TotpQrRenderer};
pub use totp::TotpService;
pub use two_factor::{SetupOutcome, TwoFactorService, TwoFactorStatus};
