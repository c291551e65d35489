use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

use super::auth::validate_phone_for_channel;
use crate::models::OtpChannel;
use crate::services::Enrollment;

#[derive(Debug, Serialize, ToSchema)]
pub struct EnrollResponse {
    #[schema(example = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP")]
    pub secret: String,
    #[schema(example = "otpauth://totp/Identity:user%40example.com?secret=JBSW...&issuer=Identity")]
    pub otpauth_url: String,
    #[schema(example = "JBSW Y3DP EHPK 3PXP JBSW Y3DP EHPK 3PXP")]
    pub recovery_key: String,
}

impl From<Enrollment> for EnrollResponse {
    fn from(e: Enrollment) -> Self {
        Self {
            secret: e.secret,
            otpauth_url: e.otpauth_url,
            recovery_key: e.recovery_key,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CodeRequest {
    #[validate(length(min = 6, max = 16, message = "Code must be 6 to 16 characters"))]
    #[schema(example = "123456")]
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BackupCodesResponse {
    #[schema(example = json!(["ABCD-EFGH", "JKLM-NPQR"]))]
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[validate(schema(function = "validate_otp_destination"))]
pub struct OtpRequest {
    pub channel: OtpChannel,

    #[validate(length(min = 6, max = 20, message = "Invalid phone number"))]
    #[schema(example = "+15550100")]
    pub phone: Option<String>,
}

fn validate_otp_destination(req: &OtpRequest) -> Result<(), ValidationError> {
    validate_phone_for_channel(req.channel, req.phone.as_deref())
}
