pub mod two_factor;
pub mod user;

pub use two_factor::{LockoutState, PgTwoFactorRepository, TwoFactorRepository};
pub use user::{PgUserRepository, UserRepository};
