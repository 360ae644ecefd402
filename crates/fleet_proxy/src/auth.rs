//! Bearer-token authentication shared with the storage backends.
//!
//! Two token formats are accepted:
//! * v1: the shared secret encoded as base64;
//! * v2: `v2.<hex hmac-sha256(secret, unix_seconds)>.<unix_seconds>`, valid
//!   while the timestamp is within [`TIMESTAMP_SKEW`] of the verifier's clock.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tonic::metadata::MetadataMap;
use tonic::Status;

type HmacSha256 = Hmac<Sha256>;

/// How far a v2 token's timestamp may drift from the local clock.
pub const TIMESTAMP_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    Missing,
    #[error("malformed authorization header")]
    Malformed,
    #[error("authentication failed")]
    Denied,
    #[error("invalid signing key")]
    InvalidKey,
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Missing | AuthError::Malformed => Status::unauthenticated(err.to_string()),
            AuthError::Denied => Status::permission_denied(err.to_string()),
            AuthError::InvalidKey => Status::internal(err.to_string()),
        }
    }
}

fn unix_seconds(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn signature(secret: &str, message: &str) -> Result<HmacSha256, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidKey)?;
    mac.update(message.as_bytes());
    Ok(mac)
}

/// Generate a v2 token for `secret` at `now`.
pub fn v2_token(secret: &str, now: SystemTime) -> Result<String, AuthError> {
    let timestamp = unix_seconds(now).to_string();
    let digest = signature(secret, &timestamp)?.finalize().into_bytes();
    Ok(format!("v2.{}.{timestamp}", hex::encode(digest)))
}

/// Verify a bearer token (without the `Bearer ` prefix) against `secret`.
pub fn verify_token(secret: &str, token: &str, now: SystemTime) -> Result<(), AuthError> {
    if let Some(rest) = token.strip_prefix("v2.") {
        let (hex_mac, timestamp) = rest.split_once('.').ok_or(AuthError::Malformed)?;
        let issued: u64 = timestamp.parse().map_err(|_| AuthError::Malformed)?;
        let expected_mac = hex::decode(hex_mac).map_err(|_| AuthError::Malformed)?;

        let now = unix_seconds(now);
        if now.abs_diff(issued) > TIMESTAMP_SKEW.as_secs() {
            return Err(AuthError::Denied);
        }
        return signature(secret, timestamp)?
            .verify_slice(&expected_mac)
            .map_err(|_| AuthError::Denied);
    }

    let decoded = STANDARD.decode(token).map_err(|_| AuthError::Malformed)?;
    if decoded == secret.as_bytes() {
        Ok(())
    } else {
        Err(AuthError::Denied)
    }
}

/// Checks the `authorization` header of incoming calls.
#[derive(Debug, Clone)]
pub struct Authenticator {
    token: String,
    transitioning: bool,
}

impl Authenticator {
    pub fn new(token: impl Into<String>, transitioning: bool) -> Self {
        Self {
            token: token.into(),
            transitioning,
        }
    }

    pub fn check(&self, metadata: &MetadataMap) -> Result<(), AuthError> {
        if self.token.is_empty() {
            return Ok(());
        }
        let result = Self::extract(metadata)
            .and_then(|token| verify_token(&self.token, token, SystemTime::now()));
        match result {
            Err(err) if self.transitioning => {
                tracing::warn!(error = %err, "authentication failed, allowed while transitioning");
                Ok(())
            }
            other => other,
        }
    }

    fn extract(metadata: &MetadataMap) -> Result<&str, AuthError> {
        let header = metadata.get("authorization").ok_or(AuthError::Missing)?;
        let header = header.to_str().map_err(|_| AuthError::Malformed)?;
        let (scheme, token) = header.split_once(' ').ok_or(AuthError::Malformed)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::Malformed);
        }
        Ok(token.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(value: &str) -> MetadataMap {
        let mut md = MetadataMap::new();
        md.insert("authorization", value.parse().unwrap());
        md
    }

    #[test]
    fn v2_token_roundtrip_and_skew() {
        let now = SystemTime::now();
        let token = v2_token("secret", now).unwrap();
        assert!(token.starts_with("v2."));
        assert_eq!(verify_token("secret", &token, now), Ok(()));
        assert_eq!(
            verify_token("other", &token, now),
            Err(AuthError::Denied)
        );
        let later = now + Duration::from_secs(31);
        assert_eq!(verify_token("secret", &token, later), Err(AuthError::Denied));
        let slightly_later = now + Duration::from_secs(29);
        assert_eq!(verify_token("secret", &token, slightly_later), Ok(()));
    }

    #[test]
    fn v1_token_is_base64_secret() {
        let now = SystemTime::now();
        let token = STANDARD.encode("secret");
        assert_eq!(verify_token("secret", &token, now), Ok(()));
        assert_eq!(verify_token("nope", &token, now), Err(AuthError::Denied));
        assert_eq!(
            verify_token("secret", "%%%", now),
            Err(AuthError::Malformed)
        );
        assert_eq!(
            verify_token("secret", "v2.zz.123", now),
            Err(AuthError::Malformed)
        );
    }

    #[test]
    fn authenticator_checks_header() {
        let auth = Authenticator::new("secret", false);
        assert_eq!(auth.check(&MetadataMap::new()), Err(AuthError::Missing));
        assert_eq!(
            auth.check(&metadata("Basic abc")),
            Err(AuthError::Malformed)
        );
        let token = v2_token("secret", SystemTime::now()).unwrap();
        assert_eq!(auth.check(&metadata(&format!("Bearer {token}"))), Ok(()));
        assert_eq!(
            auth.check(&metadata("Bearer d3Jvbmc=")),
            Err(AuthError::Denied)
        );

        let status = Status::from(AuthError::Denied);
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        assert_eq!(
            Status::from(AuthError::Missing).code(),
            tonic::Code::Unauthenticated
        );
    }

    #[test]
    fn empty_token_or_transitioning_allows_everything() {
        assert_eq!(Authenticator::new("", false).check(&MetadataMap::new()), Ok(()));
        assert_eq!(
            Authenticator::new("secret", true).check(&metadata("Bearer d3Jvbmc=")),
            Ok(())
        );
    }
}
