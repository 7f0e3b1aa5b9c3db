//! Runtime token service: short-lived bearer access tokens for registered runtimes and
//! one-shot registration token material.
//!
//! Access tokens are symmetric JWTs with claims
//! `{sub: "runtime_access", tenant_id, ep_id, jti, iat, nbf, exp}`. Registration tokens
//! are 32 random bytes, base64url-encoded; only their SHA-256 hash is persisted.

use crate::{Error, Result};
use anyhow::Context;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const RUNTIME_TOKEN_SUBJECT: &str = "runtime_access";

const MIN_ACCESS_TOKEN_TTL_SECONDS: i64 = 60;

#[derive(Clone)]
pub struct RuntimeTokenConfig {
    pub secret: String,
    /// JWT algorithm identifier; only the HMAC family is accepted.
    pub algorithm: String,
    pub access_token_ttl_seconds: i64,
}

impl std::fmt::Debug for RuntimeTokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeTokenConfig")
            .field("secret", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("access_token_ttl_seconds", &self.access_token_ttl_seconds)
            .finish()
    }
}

/// Authenticated caller identity extracted from a verified access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimePrincipal {
    pub tenant_id: Uuid,
    pub ep_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct RuntimeAccessClaims {
    sub: String,
    tenant_id: String,
    ep_id: String,
    jti: String,
    iat: i64,
    nbf: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct RuntimeTokenService {
    algorithm: Algorithm,
    access_token_ttl: Duration,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl std::fmt::Debug for RuntimeTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeTokenService")
            .field("algorithm", &self.algorithm)
            .field("access_token_ttl", &self.access_token_ttl)
            .field("encoding_key", &"<redacted>")
            .field("decoding_key", &"<redacted>")
            .finish()
    }
}

impl RuntimeTokenService {
    pub fn new(cfg: RuntimeTokenConfig) -> Result<Self> {
        let algorithm = cfg
            .algorithm
            .parse::<Algorithm>()
            .ok()
            .filter(|alg| matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512))
            .ok_or_else(|| {
                Error::Internal(anyhow::anyhow!(
                    "unsupported jwt algorithm `{}` (HS256/HS384/HS512)",
                    cfg.algorithm
                ))
            })?;

        let ttl_seconds = cfg.access_token_ttl_seconds.max(MIN_ACCESS_TOKEN_TTL_SECONDS);
        let secret = cfg.secret.as_bytes();
        Ok(Self {
            algorithm,
            access_token_ttl: Duration::seconds(ttl_seconds),
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        })
    }

    pub fn issue_access_token(
        &self,
        tenant_id: Uuid,
        ep_id: Uuid,
    ) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now + self.access_token_ttl;
        let claims = RuntimeAccessClaims {
            sub: RUNTIME_TOKEN_SUBJECT.to_string(),
            tenant_id: tenant_id.to_string(),
            ep_id: ep_id.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .context("encode runtime access token")?;
        Ok((token, expires_at))
    }

    pub fn verify_access_token(&self, token: &str) -> Result<RuntimePrincipal> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_nbf = true;

        let data = decode::<RuntimeAccessClaims>(token, &self.decoding_key, &validation)
            .map_err(|_| Error::unauthorized("Invalid runtime token."))?;

        if data.claims.sub != RUNTIME_TOKEN_SUBJECT {
            return Err(Error::unauthorized("Invalid runtime token subject."));
        }

        let tenant_id = data.claims.tenant_id.parse::<Uuid>();
        let ep_id = data.claims.ep_id.parse::<Uuid>();
        match (tenant_id, ep_id) {
            (Ok(tenant_id), Ok(ep_id)) => Ok(RuntimePrincipal { tenant_id, ep_id }),
            _ => Err(Error::unauthorized("Runtime token claims are invalid.")),
        }
    }

    /// Mint a one-shot registration token. Returns `(raw, hash)`; only the hash may be
    /// stored.
    pub fn mint_registration_token() -> (String, String) {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let raw = URL_SAFE_NO_PAD.encode(bytes);
        let hash = Self::hash_registration_token(&raw);
        (raw, hash)
    }

    pub fn hash_registration_token(raw: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        hex_lower(&hasher.finalize())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}
