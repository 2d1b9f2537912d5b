pub mod health;
pub mod two_factor;

pub use health::health_check;
pub use two_factor::{
    disable_2fa, enable_2fa, regenerate_backup_codes, setup_2fa, test_token, two_factor_status,
    verify_2fa,
};
