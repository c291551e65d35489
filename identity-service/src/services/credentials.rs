use std::sync::Arc;

use super::database::CredentialStore;
use super::error::ServiceError;
use crate::models::Identity;
use crate::utils::{dummy_verify, verify_password, Password, PasswordHashString};

/// Email/password check against the stored Argon2 hash.
#[derive(Clone)]
pub struct CredentialVerifier {
    store: Arc<dyn CredentialStore>,
}

impl CredentialVerifier {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Unknown, deleted and password-less identities all fail the same way,
    /// and an unknown email still pays for one Argon2 verification.
    #[tracing::instrument(skip(self, password))]
    pub async fn verify(&self, email: &str, password: &Password) -> Result<Identity, ServiceError> {
        let identity = self.store.find_identity_by_email(email).await?;

        let Some(identity) = identity else {
            dummy_verify(password);
            return Err(ServiceError::InvalidCredentials);
        };

        let Some(hash) = identity.password_hash.clone() else {
            dummy_verify(password);
            return Err(ServiceError::InvalidCredentials);
        };

        verify_password(password, &PasswordHashString::new(hash))
            .map_err(|_| ServiceError::InvalidCredentials)?;

        Ok(identity)
    }

    /// Re-check the password of an already known identity.
    pub fn verify_identity(
        &self,
        identity: &Identity,
        password: &Password,
    ) -> Result<(), ServiceError> {
        match &identity.password_hash {
            Some(hash) => verify_password(password, &PasswordHashString::new(hash.clone()))
                .map_err(|_| ServiceError::InvalidCredentials),
            None => {
                dummy_verify(password);
                Err(ServiceError::InvalidCredentials)
            }
        }
    }
}
