use crate::{services::Jwks, AppState};
use service_core::axum::{extract::State, http::header, response::IntoResponse, Json};

/// Public signing keys
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses(
        (status = 200, description = "RS256 verification keys", body = Jwks)
    ),
    tag = "Well-Known"
)]
pub async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(state.jwt.get_jwks().clone()),
    )
}
