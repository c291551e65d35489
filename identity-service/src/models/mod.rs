pub mod identity;
pub mod oauth_link;
pub mod one_time_code;
pub mod totp;

pub use identity::{Identity, Tenant};
pub use oauth_link::{LinkedProvider, OAuthLink};
pub use one_time_code::{CodePurpose, OtpChannel};
pub use totp::TotpSecret;
