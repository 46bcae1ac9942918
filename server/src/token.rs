//! Session tokens and the admin gate.
//!
//! A session token is a compact JWT binding {subdomain, issued_at}; the
//! `kid` header selects the signing key so keys can rotate without
//! invalidating old tokens. Verification is stateless.

use std::collections::HashMap;

use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{Config, SigningConfig};
use trapline_shared::{Error, Result};

const SUBDOMAIN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Subdomain the token is bound to.
    sub: String,
    /// Issued-at, seconds since epoch.
    iat: i64,
}

pub struct TokenService {
    active_kid: String,
    encoding: EncodingKey,
    decoding: HashMap<String, DecodingKey>,
}

impl TokenService {
    pub fn new(signing: &SigningConfig) -> Result<Self> {
        let active = signing
            .keys
            .get(&signing.active)
            .ok_or_else(|| Error::Config("active signing key missing".to_string()))?;

        let decoding = signing
            .keys
            .iter()
            .map(|(kid, secret)| (kid.clone(), DecodingKey::from_secret(secret.as_bytes())))
            .collect();

        Ok(Self {
            active_kid: signing.active.clone(),
            encoding: EncodingKey::from_secret(active.as_bytes()),
            decoding,
        })
    }

    /// Produce a signed token for `subdomain`.
    pub fn issue(&self, subdomain: &str) -> Result<String> {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.active_kid.clone());
        let claims = Claims {
            sub: subdomain.to_string(),
            iat: chrono::Utc::now().timestamp(),
        };
        encode(&header, &claims, &self.encoding).map_err(|_| Error::InvalidToken)
    }

    /// Stateless verification; returns the bound subdomain.
    pub fn verify(&self, token: &str) -> Result<String> {
        let header = decode_header(token).map_err(|_| Error::InvalidToken)?;
        let kid = header.kid.as_deref().unwrap_or(&self.active_kid);
        let key = self.decoding.get(kid).ok_or(Error::InvalidToken)?;

        // Tokens carry no exp; they outlive nothing but the signing key.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        let data =
            decode::<Claims>(token, key, &validation).map_err(|_| Error::InvalidToken)?;
        Ok(data.claims.sub)
    }
}

/// Check the admin gate for session creation. `provided` is the secret
/// from the request body or the `admin_token` cookie.
pub fn check_admin_gate(cfg: &Config, provided: Option<&str>) -> Result<()> {
    match (&cfg.admin_token, provided) {
        (None, _) => Ok(()),
        (Some(_), None) => Err(Error::AdminRequired),
        (Some(expected), Some(got)) => {
            if constant_time_eq(expected.as_bytes(), got.as_bytes()) {
                Ok(())
            } else {
                Err(Error::InvalidAdminToken)
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Generate a lower-case alphanumeric subdomain label.
pub fn random_subdomain(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SUBDOMAIN_ALPHABET[rng.gen_range(0..SUBDOMAIN_ALPHABET.len())] as char)
        .collect()
}

/// Opaque share-token material.
pub fn random_share_token() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| SUBDOMAIN_ALPHABET[rng.gen_range(0..SUBDOMAIN_ALPHABET.len())] as char)
        .collect()
}

/// Ephemeral signing secret for configs that carry none.
pub fn random_secret() -> String {
    let mut rng = rand::thread_rng();
    (0..48)
        .map(|_| SUBDOMAIN_ALPHABET[rng.gen_range(0..SUBDOMAIN_ALPHABET.len())] as char)
        .collect()
}

/// Is `label` a well-formed subdomain of the configured length?
pub fn is_valid_subdomain(label: &str, len: usize) -> bool {
    label.len() == len && label.bytes().all(|b| SUBDOMAIN_ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing() -> SigningConfig {
        let mut keys = HashMap::new();
        keys.insert("k1".to_string(), "first-secret".to_string());
        keys.insert("k2".to_string(), "second-secret".to_string());
        SigningConfig {
            active: "k2".to_string(),
            keys,
        }
    }

    #[test]
    fn test_issue_verify_roundtrip() {
        let svc = TokenService::new(&signing()).unwrap();
        let token = svc.issue("abc123").unwrap();
        assert_eq!(svc.verify(&token).unwrap(), "abc123");
    }

    #[test]
    fn test_rotation_keeps_old_tokens_valid() {
        let mut old = signing();
        old.active = "k1".to_string();
        let old_svc = TokenService::new(&old).unwrap();
        let token = old_svc.issue("abc123").unwrap();

        // New service signs with k2 but still verifies k1 tokens.
        let new_svc = TokenService::new(&signing()).unwrap();
        assert_eq!(new_svc.verify(&token).unwrap(), "abc123");
    }

    #[test]
    fn test_tampered_token_rejected() {
        let svc = TokenService::new(&signing()).unwrap();
        let mut token = svc.issue("abc123").unwrap();
        token.push('x');
        assert!(matches!(svc.verify(&token), Err(Error::InvalidToken)));
        assert!(matches!(svc.verify("not-a-jwt"), Err(Error::InvalidToken)));
    }

    #[test]
    fn test_admin_gate() {
        let mut cfg = crate::config::Config::default();
        assert!(check_admin_gate(&cfg, None).is_ok());

        cfg.admin_token = Some("secret".to_string());
        assert!(matches!(
            check_admin_gate(&cfg, None),
            Err(Error::AdminRequired)
        ));
        assert!(matches!(
            check_admin_gate(&cfg, Some("wrong")),
            Err(Error::InvalidAdminToken)
        ));
        assert!(check_admin_gate(&cfg, Some("secret")).is_ok());
    }

    #[test]
    fn test_random_subdomain_shape() {
        for _ in 0..50 {
            let s = random_subdomain(6);
            assert!(is_valid_subdomain(&s, 6), "bad label {s}");
        }
        assert!(!is_valid_subdomain("UPPER1", 6));
        assert!(!is_valid_subdomain("ab-123", 6));
        assert!(!is_valid_subdomain("abc12", 6));
    }
}
