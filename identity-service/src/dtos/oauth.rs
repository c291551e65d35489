use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::models::LinkedProvider;

#[derive(Debug, Deserialize, IntoParams)]
pub struct OAuthLoginQuery {
    /// Relative path or URL under an allowed origin.
    #[param(example = "/dashboard")]
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProvidersResponse {
    pub providers: Vec<LinkedProvider>,
}
