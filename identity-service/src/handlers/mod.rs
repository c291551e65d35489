//! HTTP handlers for identity-service.

pub mod auth;
pub mod metrics;
pub mod mfa;
pub mod oauth;
pub mod well_known;
