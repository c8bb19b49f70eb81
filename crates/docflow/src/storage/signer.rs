//! HMAC-SHA256 presigned URLs.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::StorageError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    base_url: String,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn sign(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<PresignedUrl, StorageError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StorageError::InvalidSignature(format!("invalid ttl: {}", e)))?;
        let expires_at = now + ttl;
        let expires = expires_at.timestamp();
        let signature = hex::encode(self.mac(key, expires)?.finalize().into_bytes());

        Ok(PresignedUrl {
            url: format!(
                "{}/{}?expires={}&signature={}",
                self.base_url, key, expires, signature
            ),
            expires_at: Utc
                .timestamp_opt(expires, 0)
                .single()
                .unwrap_or(expires_at),
        })
    }

    /// Checks a URL produced by [`UrlSigner::sign`] and returns its key.
    pub fn verify(&self, url: &str, now: DateTime<Utc>) -> Result<String, StorageError> {
        let rest = url
            .strip_prefix(&self.base_url)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| StorageError::InvalidSignature("foreign URL".to_string()))?;
        let (key, query) = rest
            .split_once('?')
            .ok_or_else(|| StorageError::InvalidSignature("missing query".to_string()))?;

        let mut expires = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", v)) => expires = v.parse::<i64>().ok(),
                Some(("signature", v)) => signature = hex::decode(v).ok(),
                _ => {}
            }
        }
        let expires =
            expires.ok_or_else(|| StorageError::InvalidSignature("bad expiry".to_string()))?;
        let signature = signature
            .ok_or_else(|| StorageError::InvalidSignature("bad signature".to_string()))?;

        if now.timestamp() > expires {
            return Err(StorageError::InvalidSignature("URL expired".to_string()));
        }
        self.mac(key, expires)?
            .verify_slice(&signature)
            .map_err(|_| StorageError::InvalidSignature("signature mismatch".to_string()))?;
        Ok(key.to_string())
    }

    fn mac(&self, key: &str, expires: i64) -> Result<HmacSha256, StorageError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| StorageError::InvalidSignature(e.to_string()))?;
        mac.update(b"GET\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UrlSigner {
        UrlSigner::new("s3cret", "docflow://objects/")
    }

    #[test]
    fn test_sign_and_verify() {
        let now = Utc::now();
        let url = signer()
            .sign("uploads/a.txt", Duration::from_secs(60), now)
            .unwrap();
        assert!(url.url.starts_with("docflow://objects/uploads/a.txt?expires="));
        assert_eq!(signer().verify(&url.url, now).unwrap(), "uploads/a.txt");
    }

    #[test]
    fn test_expired_url_rejected() {
        let now = Utc::now();
        let url = signer().sign("k", Duration::from_secs(1), now).unwrap();
        let later = now + chrono::Duration::seconds(5);
        assert!(matches!(
            signer().verify(&url.url, later),
            Err(StorageError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_tampered_key_rejected() {
        let now = Utc::now();
        let url = signer().sign("a", Duration::from_secs(60), now).unwrap();
        let forged = url.url.replacen("/a?", "/b?", 1);
        assert!(signer().verify(&forged, now).is_err());

        let other = UrlSigner::new("other", "docflow://objects");
        assert!(other.verify(&url.url, now).is_err());
    }
}
