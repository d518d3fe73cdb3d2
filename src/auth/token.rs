// Bearer token claim decoding
//
// Tokens are treated as opaque except for the payload segment, which is read
// for the expiry and identity claims. Signatures are not verified here.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Token decoding failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("token is not in header.payload.signature form")]
    Malformed,

    #[error("token payload is not valid base64url: {0}")]
    Base64(String),

    #[error("token payload is not valid JSON: {0}")]
    Json(String),
}

/// Claims read from the token payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    /// Expiry, epoch seconds
    #[serde(default)]
    pub exp: Option<i64>,

    /// Standard subject claim (string or number)
    #[serde(default)]
    pub sub: Option<Value>,

    /// Service-specific identity claim
    #[serde(default, rename = "userId")]
    pub user_id: Option<Value>,
}

impl Claims {
    /// Numeric identity of the token holder.
    ///
    /// `sub` wins when it is numeric and non-zero, then `userId`. `0` means
    /// "unknown identity" and must never be treated as a real user.
    pub fn subject_id(&self) -> u64 {
        self.sub
            .as_ref()
            .and_then(numeric_claim)
            .or_else(|| self.user_id.as_ref().and_then(numeric_claim))
            .unwrap_or(0)
    }
}

fn numeric_claim(value: &Value) -> Option<u64> {
    let id = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    (id != 0).then_some(id)
}

/// Decode the payload segment of a bearer token
pub fn decode_claims(token: &str) -> Result<Claims, DecodeError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(header), Some(payload)) if !header.is_empty() && !payload.is_empty() => payload,
        _ => return Err(DecodeError::Malformed),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    serde_json::from_slice(&bytes).map_err(|e| DecodeError::Json(e.to_string()))
}

/// Short, log-safe prefix of a token
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}

/// Build an unsigned token carrying the given claims (tests and fixtures)
#[cfg(any(test, feature = "test-utils"))]
pub fn encode_unsigned(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_decode_claims() {
        let token = encode_unsigned(&json!({"exp": 1_700_000_000, "sub": "42"}));
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.exp, Some(1_700_000_000));
        assert_eq!(claims.subject_id(), 42);
    }

    #[test]
    fn test_decode_tolerates_padding() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"exp":1}"#);
        let token = format!("h.{}.s", payload);
        assert_eq!(decode_claims(&token).unwrap().exp, Some(1));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_claims("not-a-token").unwrap_err(), DecodeError::Malformed);
        assert_eq!(decode_claims(".payload.sig").unwrap_err(), DecodeError::Malformed);
        assert!(matches!(decode_claims("h.!!!.s"), Err(DecodeError::Base64(_))));

        let not_json = URL_SAFE_NO_PAD.encode("hello");
        assert!(matches!(
            decode_claims(&format!("h.{}.s", not_json)),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_missing_exp_decodes_as_none() {
        let token = encode_unsigned(&json!({"sub": 7}));
        assert_eq!(decode_claims(&token).unwrap().exp, None);
    }

    #[test]
    fn test_subject_id_fallbacks() {
        let claims = |v: Value| serde_json::from_value::<Claims>(v).unwrap();

        assert_eq!(claims(json!({"sub": 12, "userId": 99})).subject_id(), 12);
        assert_eq!(claims(json!({"sub": "abc", "userId": 99})).subject_id(), 99);
        assert_eq!(claims(json!({"sub": "0", "userId": "5"})).subject_id(), 5);
        assert_eq!(claims(json!({"userId": 3})).subject_id(), 3);
        assert_eq!(claims(json!({"sub": "user@example.com"})).subject_id(), 0);
        assert_eq!(claims(json!({})).subject_id(), 0);
    }

    #[test]
    fn test_redact_never_exposes_full_token() {
        let token = "abcdefghijklmnopqrstuvwxyz";
        assert_eq!(redact(token), "abcdefgh...");
        assert_eq!(redact("abc"), "abc...");
    }

    proptest! {
        #[test]
        fn prop_numeric_sub_always_wins(sub in 1u64..u64::MAX, user_id in any::<u64>()) {
            let token = encode_unsigned(&json!({"exp": 1, "sub": sub.to_string(), "userId": user_id}));
            prop_assert_eq!(decode_claims(&token).unwrap().subject_id(), sub);
        }

        #[test]
        fn prop_decode_never_panics(input in ".*") {
            let _ = decode_claims(&input);
        }
    }
}
