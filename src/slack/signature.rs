//! Slack 请求签名校验（v0 HMAC-SHA256）
//!
//! 签名串为 `v0:{timestamp}:{raw_body}`，header 中为 `v0=<hex>`

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::common::auth::constant_time_eq_bytes;
use crate::common::unix_now_secs;

pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

type HmacSha256 = Hmac<Sha256>;

/// 签名校验失败原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature headers")]
    MissingHeaders,
    #[error("invalid request timestamp")]
    InvalidTimestamp,
    #[error("request timestamp outside tolerance window")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

/// 签名校验器
#[derive(Clone)]
pub struct SignatureVerifier {
    signing_secret: String,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(signing_secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            signing_secret: signing_secret.into(),
            tolerance,
        }
    }

    /// 校验请求
    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<(), SignatureError> {
        self.verify_at(timestamp, signature, body, unix_now_secs())
    }

    pub(crate) fn verify_at(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<(), SignatureError> {
        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            return Err(SignatureError::MissingHeaders);
        };

        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp)?;
        // 防重放
        if now.abs_diff(ts) > self.tolerance.as_secs() {
            return Err(SignatureError::Expired);
        }

        let expected = self.sign(timestamp.trim(), body);
        if constant_time_eq_bytes(expected.as_bytes(), signature.trim().as_bytes()) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// 计算 `v0=<hex>` 签名
    pub fn sign(&self, timestamp: &str, body: &[u8]) -> String {
        // HMAC 接受任意长度的密钥，new_from_slice 不会失败
        let mut mac = match HmacSha256::new_from_slice(self.signing_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
    const BODY: &[u8] = b"token=xyzz0WbapA4vBCDEFasx0q6G&team_id=T1DC2JH3J&command=%2Fweather";

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SECRET, Duration::from_secs(300))
    }

    #[test]
    fn test_valid_signature() {
        let v = verifier();
        let now = 1_531_420_618;
        let sig = v.sign("1531420618", BODY);
        assert!(sig.starts_with("v0="));
        assert_eq!(sig.len(), 3 + 64);
        assert!(v.verify_at(Some("1531420618"), Some(&sig), BODY, now).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let v = verifier();
        let sig = v.sign("1000", BODY);
        assert_eq!(
            v.verify_at(Some("1000"), Some(&sig), b"token=other", 1000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let sig = SignatureVerifier::new("other", Duration::from_secs(300)).sign("1000", BODY);
        assert_eq!(
            verifier().verify_at(Some("1000"), Some(&sig), BODY, 1000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let v = verifier();
        let sig = v.sign("1000", BODY);
        assert_eq!(
            v.verify_at(Some("1000"), Some(&sig), BODY, 1000 + 301),
            Err(SignatureError::Expired)
        );
        // 未来时间同样拒绝
        assert_eq!(
            v.verify_at(Some("1000"), Some(&sig), BODY, 1000 - 301),
            Err(SignatureError::Expired)
        );
        assert!(v.verify_at(Some("1000"), Some(&sig), BODY, 1300).is_ok());
    }

    #[test]
    fn test_missing_or_malformed_headers() {
        let v = verifier();
        assert_eq!(
            v.verify_at(None, Some("v0=abc"), BODY, 0),
            Err(SignatureError::MissingHeaders)
        );
        assert_eq!(
            v.verify_at(Some("1000"), None, BODY, 1000),
            Err(SignatureError::MissingHeaders)
        );
        assert_eq!(
            v.verify_at(Some("yesterday"), Some("v0=abc"), BODY, 1000),
            Err(SignatureError::InvalidTimestamp)
        );
    }
}
