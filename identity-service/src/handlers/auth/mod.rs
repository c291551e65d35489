pub mod password;
pub mod session;
pub mod two_factor;

pub use password::{change_password, confirm_password_reset, request_password_reset};
pub use session::{login, logout, refresh, register, session};
pub use two_factor::{send_login_code, verify_login};
