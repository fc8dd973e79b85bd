mod auth;
mod credentials;
mod health_check;
mod tokens;

pub use auth::{forgot_password, login, refresh, register, reset_password, verify_email};
pub use credentials::{delete_account, get_credentials, logout, logout_all};
pub use health_check::health_check;
pub use tokens::{auth_verify_token, request_token, verify_token};
