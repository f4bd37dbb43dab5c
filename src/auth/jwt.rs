//! JWT issue and validation (HS256, shared secret).

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::TokenVerifier;
use crate::{
    config::JwtConfig,
    core::{GatewayError, GatewayResult},
};

/// Claims carried in gateway-issued tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    pub exp: i64,
}

/// HS256 token service; issues and verifies with the configured secret.
pub struct JwtService {
    secret: String,
    expiration_secs: u64,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            secret: config.secret.clone(),
            expiration_secs: config.expiration_secs,
        }
    }

    /// Issue a signed token for `username`.
    pub fn create_token(&self, username: &str) -> GatewayResult<String> {
        let claims = Claims {
            username: username.to_string(),
            exp: Utc::now().timestamp() + self.expiration_secs as i64,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| GatewayError::Internal(format!("failed to sign token: {}", e)))
    }
}

impl TokenVerifier for JwtService {
    fn verify(&self, token: &str) -> GatewayResult<()> {
        // Algorithm is pinned to HS256; expiration is validated by default.
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|_| ())
        .map_err(|e| GatewayError::AuthInvalid(e.to_string()))
    }
}
