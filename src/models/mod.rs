pub mod backup_code;
pub mod two_factor;
pub mod user;

pub use backup_code::BackupCode;
pub use two_factor::TwoFactorRecord;
pub use user::User;
