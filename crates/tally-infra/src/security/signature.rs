//! HMAC-SHA256 request signing for the product -> gateway hop.
//!
//! The canonical string is the newline-joined
//! `METHOD`, `PATH?QUERY`, `TIMESTAMP`, `NONCE`, `BODY_SHA256_HEX`.
//! The signature is the lowercase hex HMAC-SHA256 of that string under the
//! shared secret.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tally_core::security::replay::NonceStore;
use tally_types::error::SignatureError;
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_NONCE: &str = "X-Nonce";
pub const HEADER_BODY_SHA256: &str = "X-Body-SHA256";

/// Lowercase hex SHA-256 of a request body.
pub fn body_sha256_hex(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

pub fn canonical_string(method: &str, path_and_query: &str, timestamp: &str, nonce: &str, body_hash: &str) -> String {
    [method, path_and_query, timestamp, nonce, body_hash].join("\n")
}

fn mac_for(secret: &str, canonical: &str) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSignature)?;
    mac.update(canonical.as_bytes());
    Ok(mac)
}

/// Sign the canonical string for one request.
pub fn sign(
    secret: &str,
    method: &str,
    path_and_query: &str,
    timestamp: &str,
    nonce: &str,
    body_hash: &str,
) -> Result<String, SignatureError> {
    let canonical = canonical_string(method, path_and_query, timestamp, nonce, body_hash);
    Ok(hex_encode(&mac_for(secret, &canonical)?.finalize().into_bytes()))
}

/// The four header values a signed request carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
    pub body_sha256: String,
}

impl SignedHeaders {
    /// Sign `body` for `method path_and_query` at unix time `now` with a fresh nonce.
    pub fn build(
        secret: &SecretString,
        method: &str,
        path_and_query: &str,
        body: &[u8],
        now: i64,
    ) -> Result<Self, SignatureError> {
        let timestamp = now.to_string();
        let nonce = Uuid::new_v4().simple().to_string();
        let body_sha256 = body_sha256_hex(body);
        let signature = sign(
            secret.expose_secret(),
            method,
            path_and_query,
            &timestamp,
            &nonce,
            &body_sha256,
        )?;
        Ok(Self {
            signature,
            timestamp,
            nonce,
            body_sha256,
        })
    }

    /// `(header name, value)` pairs in send order.
    pub fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            (HEADER_SIGNATURE, self.signature.as_str()),
            (HEADER_TIMESTAMP, self.timestamp.as_str()),
            (HEADER_NONCE, self.nonce.as_str()),
            (HEADER_BODY_SHA256, self.body_sha256.as_str()),
        ]
    }
}

/// Header values as received; any may be absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureHeaders<'a> {
    pub signature: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub body_sha256: Option<&'a str>,
}

/// Verifies signed requests and records their nonces.
pub struct RequestVerifier {
    secret: SecretString,
    clock_skew_secs: i64,
    nonces: Arc<dyn NonceStore>,
}

impl RequestVerifier {
    pub fn new(secret: SecretString, clock_skew_secs: i64, nonces: Arc<dyn NonceStore>) -> Self {
        Self {
            secret,
            clock_skew_secs,
            nonces,
        }
    }

    pub fn verify(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &SignatureHeaders<'_>,
        body: &[u8],
    ) -> Result<(), SignatureError> {
        self.verify_at(method, path_and_query, headers, body, chrono::Utc::now().timestamp())
    }

    /// Verification in fixed order: headers, timestamp, body hash, signature,
    /// then nonce. Only a verified request can consume a nonce.
    pub fn verify_at(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &SignatureHeaders<'_>,
        body: &[u8],
        now: i64,
    ) -> Result<(), SignatureError> {
        let (Some(signature), Some(timestamp), Some(nonce)) = (headers.signature, headers.timestamp, headers.nonce)
        else {
            return Err(SignatureError::MissingHeaders);
        };

        let ts: i64 = timestamp.trim().parse().map_err(|_| SignatureError::InvalidTimestamp)?;
        if (now - ts).abs() > self.clock_skew_secs {
            debug!(ts, now, skew = self.clock_skew_secs, "signed request outside clock skew");
            return Err(SignatureError::TimestampSkew);
        }

        let body_hash = body_sha256_hex(body);
        if let Some(claimed) = headers.body_sha256 {
            if !claimed.trim().eq_ignore_ascii_case(&body_hash) {
                return Err(SignatureError::BodyHashMismatch);
            }
        }

        let expected = hex_decode(signature.trim()).map_err(|_| SignatureError::InvalidSignature)?;
        let canonical = canonical_string(method, path_and_query, timestamp, nonce, &body_hash);
        mac_for(self.secret.expose_secret(), &canonical)?
            .verify_slice(&expected)
            .map_err(|_| SignatureError::InvalidSignature)?;

        if !self.nonces.check_and_store(nonce, now) {
            return Err(SignatureError::Replay);
        }
        Ok(())
    }
}

/// Encode bytes to a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decode a hex string to bytes.
fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}
