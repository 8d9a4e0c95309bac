use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::env;
use subtle::ConstantTimeEq;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const SECRET_KEY_ENV: &str = "STUDYGATE_SECRET_KEY";

/// HMAC-SHA256 signer for bearer tokens.
#[derive(Clone)]
pub struct CryptoEngine {
    secret: Vec<u8>,
}

impl Default for CryptoEngine {
    fn default() -> Self {
        Self::from_env()
    }
}

impl CryptoEngine {
    pub fn from_env() -> Self {
        match env::var(SECRET_KEY_ENV) {
            Ok(secret) if !secret.trim().is_empty() => Self::with_secret(secret.trim().as_bytes()),
            _ => {
                warn!("⚠️  {} not set, using an ephemeral development secret", SECRET_KEY_ENV);
                Self::with_secret(b"default_ephemeral_secret_change_me")
            }
        }
    }

    pub fn with_secret(secret: &[u8]) -> Self {
        Self { secret: secret.to_vec() }
    }

    pub fn sign(&self, content: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(content);
        mac.finalize().into_bytes().to_vec()
    }

    pub fn verify(&self, content: &[u8], signature: &[u8]) -> bool {
        let expected = self.sign(content);
        // Constant-time comparison to prevent timing attacks
        expected.as_slice().ct_eq(signature).into()
    }
}
