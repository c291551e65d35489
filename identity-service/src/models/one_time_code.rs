//! Out-of-band one-time code types. Codes themselves live in the cache only.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Delivery channel for a one-time code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OtpChannel {
    Email,
    Sms,
}

impl OtpChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpChannel::Email => "email",
            OtpChannel::Sms => "sms",
        }
    }
}

/// Purpose of a cached single-use secret; determines its key namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePurpose {
    Otp,
    Reset,
}

impl CodePurpose {
    /// Cache key for the code owned by `owner` (user id for OTP, the token
    /// itself for resets).
    pub fn key(&self, owner: &str) -> String {
        match self {
            CodePurpose::Otp => format!("otp:{}", owner),
            CodePurpose::Reset => format!("reset_token:{}", owner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_keys_are_namespaced() {
        assert_eq!(CodePurpose::Otp.key("u1"), "otp:u1");
        assert_eq!(CodePurpose::Reset.key("tok"), "reset_token:tok");
    }
}
