//! Bearer-token authentication.
//!
//! The gateway only ever sees tokens through the [`TokenVerifier`] seam;
//! [`JwtService`] is the production implementation (HS256, shared secret).

use axum::http::{header::AUTHORIZATION, HeaderMap};

pub mod jwt;

pub use jwt::{Claims, JwtService};

use crate::core::{GatewayError, GatewayResult};

/// Pluggable token verification.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> GatewayResult<()>;
}

/// Validate the `Authorization: Bearer <token>` header of a request.
///
/// Distinguishes a missing header, a malformed scheme, and a failed
/// verification; all three map to 401 at the boundary.
pub fn check_bearer(headers: &HeaderMap, verifier: &dyn TokenVerifier) -> GatewayResult<()> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(GatewayError::AuthMissing)?;
    let value = header.to_str().map_err(|_| GatewayError::AuthMalformed)?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or(GatewayError::AuthMalformed)?;
    verifier.verify(token)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    struct AcceptAll;
    impl TokenVerifier for AcceptAll {
        fn verify(&self, _token: &str) -> GatewayResult<()> {
            Ok(())
        }
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_missing_header() {
        let result = check_bearer(&HeaderMap::new(), &AcceptAll);
        assert!(matches!(result, Err(GatewayError::AuthMissing)));
    }

    #[test]
    fn test_malformed_scheme() {
        let result = check_bearer(&headers_with("Basic dXNlcjpwYXNz"), &AcceptAll);
        assert!(matches!(result, Err(GatewayError::AuthMalformed)));
    }

    #[test]
    fn test_bearer_token_accepted() {
        assert!(check_bearer(&headers_with("Bearer some-token"), &AcceptAll).is_ok());
    }
}
