//! Password hashing and bearer tokens.
//!
//! Passwords are stored as PBKDF2-HMAC-SHA256 with a per-user random salt:
//!
//! ```text
//! pbkdf2-sha256$<iterations>$<salt_hex>$<hash_hex>
//! ```
//!
//! Access tokens are HS256 JWTs (`header.claims.signature`, base64url without
//! padding) signed with `auth.jwt_secret`. Verification distinguishes an
//! expired token ([`KbError::TokenExpired`]) from a bad one
//! ([`KbError::Unauthorized`]) so clients know whether to log in again.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{KbError, KbResult};

type HmacSha256 = Hmac<Sha256>;

const SCHEME: &str = "pbkdf2-sha256";
const PBKDF2_ITERATIONS: u32 = 50_000;
const HASH_LEN: usize = 32;

/// Hash a password for storage.
pub fn hash_password(password: &str) -> String {
    hash_password_with(password, PBKDF2_ITERATIONS)
}

fn hash_password_with(password: &str, iterations: u32) -> String {
    let salt = Uuid::new_v4();
    let derived = pbkdf2_sha256(password.as_bytes(), salt.as_bytes(), iterations);
    format!(
        "{}${}${}${}",
        SCHEME,
        iterations,
        hex::encode(salt.as_bytes()),
        hex::encode(derived)
    )
}

/// Check a password against an encoded hash. Malformed encodings never verify.
pub fn verify_password(password: &str, encoded: &str) -> bool {
    let parts: Vec<&str> = encoded.split('$').collect();
    if parts.len() != 4 || parts[0] != SCHEME {
        return false;
    }
    let iterations: u32 = match parts[1].parse() {
        Ok(n) if n > 0 => n,
        _ => return false,
    };
    let (salt, expected) = match (hex::decode(parts[2]), hex::decode(parts[3])) {
        (Ok(s), Ok(h)) => (s, h),
        _ => return false,
    };
    if expected.len() != HASH_LEN {
        return false;
    }
    let derived = pbkdf2_sha256(password.as_bytes(), &salt, iterations);
    constant_time_eq(&derived, &expected)
}

/// Single-block PBKDF2 (RFC 8018) with HMAC-SHA256; output is 32 bytes.
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; HASH_LEN] {
    let keyed = HmacSha256::new_from_slice(password).expect("HMAC can take key of any size");

    let mut mac = keyed.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u = [0u8; HASH_LEN];
    u.copy_from_slice(&mac.finalize().into_bytes());
    let mut out = u;

    for _ in 1..iterations {
        let mut mac = keyed.clone();
        mac.update(&u);
        u.copy_from_slice(&mac.finalize().into_bytes());
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ============ Tokens ============

/// Claims carried in an access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Issue a token for `user_id` valid for `ttl_minutes` from now.
pub fn issue_token(secret: &str, user_id: &str, email: &str, ttl_minutes: i64) -> String {
    issue_token_at(
        secret,
        user_id,
        email,
        chrono::Utc::now().timestamp(),
        ttl_minutes,
    )
}

pub fn issue_token_at(
    secret: &str,
    user_id: &str,
    email: &str,
    now: i64,
    ttl_minutes: i64,
) -> String {
    let header = Header {
        alg: "HS256".to_string(),
        typ: "JWT".to_string(),
    };
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        iat: now,
        exp: now + ttl_minutes * 60,
    };
    // Serializing plain structs of strings and integers cannot fail.
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap_or_default());
    let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
    let signing_input = format!("{}.{}", header_b64, claims_b64);
    let signature = URL_SAFE_NO_PAD.encode(sign(secret, signing_input.as_bytes()));
    format!("{}.{}", signing_input, signature)
}

/// Verify signature and expiry of a token against the current time.
pub fn verify_token(secret: &str, token: &str) -> KbResult<Claims> {
    verify_token_at(secret, token, chrono::Utc::now().timestamp())
}

pub fn verify_token_at(secret: &str, token: &str, now: i64) -> KbResult<Claims> {
    let invalid = || KbError::Unauthorized("invalid token".to_string());

    let mut parts = token.split('.');
    let (header_b64, claims_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(c), Some(s)) if parts.next().is_none() => (h, c, s),
        _ => return Err(invalid()),
    };

    let header_bytes = URL_SAFE_NO_PAD.decode(header_b64).map_err(|_| invalid())?;
    let header: Header = serde_json::from_slice(&header_bytes).map_err(|_| invalid())?;
    if header.alg != "HS256" {
        return Err(invalid());
    }

    let signature = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| invalid())?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| invalid())?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(claims_b64.as_bytes());
    mac.verify_slice(&signature).map_err(|_| invalid())?;

    let claims_bytes = URL_SAFE_NO_PAD.decode(claims_b64).map_err(|_| invalid())?;
    let claims: Claims = serde_json::from_slice(&claims_bytes).map_err(|_| invalid())?;
    if claims.exp <= now {
        return Err(KbError::TokenExpired);
    }
    Ok(claims)
}

fn sign(secret: &str, data: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
