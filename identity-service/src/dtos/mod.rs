pub mod auth;
pub mod mfa;
pub mod oauth;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Shape of every error body.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(example = "invalid_credentials")]
    pub error: String,
    #[schema(example = "Invalid email or password")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
