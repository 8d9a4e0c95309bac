//! Bearer token validation (HS256 JWT) and the auth middleware.

use crate::crypto::CryptoEngine;
use crate::error::{GatewayError, GatewayResult};
use crate::ratelimit::{peer_identity, RateLimiter, RouteClass};
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const TOKEN_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Owner id of everything the caller touches.
    pub sub: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
}

/// Authenticated caller, inserted into request extensions by [`require_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

#[derive(Clone)]
pub struct TokenVerifier {
    crypto: CryptoEngine,
}

impl TokenVerifier {
    pub fn new(crypto: CryptoEngine) -> Self {
        Self { crypto }
    }

    /// Mint a token for `sub`. Issuance belongs to the identity provider; this
    /// exists for local tooling and tests.
    pub fn issue(&self, sub: &str, ttl: chrono::Duration) -> GatewayResult<String> {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };
        let payload = serde_json::to_vec(&claims).map_err(GatewayError::internal)?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(TOKEN_HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = URL_SAFE_NO_PAD.encode(self.crypto.sign(signing_input.as_bytes()));
        Ok(format!("{}.{}", signing_input, signature))
    }

    pub fn verify(&self, token: &str) -> GatewayResult<Claims> {
        let mut parts = token.split('.');
        let (Some(head), Some(body), Some(sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(GatewayError::Unauthorized("malformed token".into()));
        };

        let header: TokenHeader = decode_segment(head)?;
        if header.alg != "HS256" {
            return Err(GatewayError::Unauthorized(format!("unsupported algorithm {}", header.alg)));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| GatewayError::Unauthorized("malformed token".into()))?;
        let signing_input = &token[..head.len() + 1 + body.len()];
        if !self.crypto.verify(signing_input.as_bytes(), &signature) {
            return Err(GatewayError::Unauthorized("invalid token signature".into()));
        }

        let claims: Claims = decode_segment(body)?;
        if claims.sub.is_empty() {
            return Err(GatewayError::Unauthorized("token has no subject".into()));
        }
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(GatewayError::Unauthorized("token expired".into()));
        }
        Ok(claims)
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> GatewayResult<T> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| GatewayError::Unauthorized("malformed token".into()))?;
    serde_json::from_slice(&raw).map_err(|_| GatewayError::Unauthorized("malformed token".into()))
}

/// `Authorization: Bearer <token>`, scheme matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
        .filter(|t| !t.is_empty())
}

#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<TokenVerifier>,
    pub limiter: Arc<RateLimiter>,
}

/// Rejects requests without a valid bearer token. Failed attempts count
/// against the `auth` class for the caller's address.
pub async fn require_auth(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let outcome = match bearer_token(req.headers()) {
        Some(token) => state.verifier.verify(token),
        None => Err(GatewayError::Unauthorized("missing bearer token".into())),
    };

    match outcome {
        Ok(claims) => {
            req.extensions_mut().insert(AuthUser(claims.sub));
            Ok(next.run(req).await)
        }
        Err(e) => {
            let identity = peer_identity(&req);
            debug!("Rejected credentials from {}: {}", identity, e);
            state.limiter.check(&identity, RouteClass::Auth)?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(CryptoEngine::with_secret(b"test-secret"))
    }

    #[test]
    fn test_issue_and_verify() {
        let v = verifier();
        let token = v.issue("alice", chrono::Duration::hours(1)).unwrap();
        assert_eq!(v.verify(&token).unwrap().sub, "alice");
    }

    #[test]
    fn test_rejects_tampered_and_foreign_tokens() {
        let v = verifier();
        let token = v.issue("alice", chrono::Duration::hours(1)).unwrap();

        let forged_claims = URL_SAFE_NO_PAD.encode(r#"{"sub":"bob","exp":9999999999}"#);
        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);
        assert!(matches!(v.verify(&forged), Err(GatewayError::Unauthorized(_))));

        let other = TokenVerifier::new(CryptoEngine::with_secret(b"other"));
        assert!(other.verify(&token).is_err());
        assert!(v.verify("not-a-token").is_err());
    }

    #[test]
    fn test_rejects_expired() {
        let v = verifier();
        let token = v.issue("alice", chrono::Duration::seconds(-5)).unwrap();
        let err = v.verify(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(header::AUTHORIZATION, "Basic Zm9vOmJhcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
