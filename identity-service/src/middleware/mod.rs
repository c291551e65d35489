pub mod auth;
pub mod metrics;
pub mod rate_limit;

pub use auth::{auth_middleware, is_public_path, AuthUser};
pub use metrics::metrics_middleware;
pub use rate_limit::rate_limit_middleware;
