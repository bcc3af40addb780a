//! Token encoding and tamper-detection signatures.
//!
//! Tokens use the format `base64url(json(record))` without padding, so they
//! survive copy/paste through chat clients and terminals. The JSON carries
//! every record field including `signature`.
//!
//! The signature is HMAC-SHA256 keyed with the shared secret over the
//! canonical JSON encoding of all other fields. Canonical means object keys
//! are sorted recursively, so signing does not depend on field order.

use crate::error::{LicenseError, LicenseResult};
use crate::record::LicenseRecord;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Embedded signing secret shared by the issuer and every verifier build.
const LICENSE_SIGNING_SECRET: &[u8] = b"keyward-license-signing-secret-v1";

/// Encodes, decodes, signs and verifies license tokens.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl Default for TokenCodec {
    fn default() -> Self {
        Self::with_secret(LICENSE_SIGNING_SECRET)
    }
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Creates a codec using a custom secret.
    /// Used for testing and for private deployments with their own secret.
    #[must_use]
    pub fn with_secret(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    /// Signs the record and serializes it into a token string.
    pub fn encode(&self, record: &mut LicenseRecord) -> LicenseResult<String> {
        self.sign(record)?;
        let json = serde_json::to_vec(record)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Parses a token string into a record. Does not verify the signature.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::InvalidFormat`] if the string is not base64 or
    /// does not contain a well-formed record.
    pub fn decode(&self, token: &str) -> LicenseResult<LicenseRecord> {
        let token = token.trim();
        if token.is_empty() {
            return Err(LicenseError::InvalidFormat("token is empty".to_string()));
        }

        let json = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| LicenseError::InvalidFormat(format!("invalid base64: {e}")))?;

        let value: Value = serde_json::from_slice(&json)
            .map_err(|e| LicenseError::InvalidFormat(format!("invalid record JSON: {e}")))?;
        let record: LicenseRecord = serde_json::from_value(value.clone())
            .map_err(|e| LicenseError::InvalidFormat(format!("invalid record: {e}")))?;

        // The signature covers the re-serialized record, so anything that
        // does not survive a round trip unchanged is rejected here.
        if serde_json::to_value(&record)? != value {
            return Err(LicenseError::InvalidFormat(
                "record is not in canonical form".to_string(),
            ));
        }
        Ok(record)
    }

    /// Recomputes and stores the record's signature.
    pub fn sign(&self, record: &mut LicenseRecord) -> LicenseResult<()> {
        let signature = self.compute_signature(record)?;
        record.set_signature(signature);
        Ok(())
    }

    /// Returns true if the embedded signature matches a fresh recomputation.
    #[must_use]
    pub fn verify_signature(&self, record: &LicenseRecord) -> bool {
        let Ok(expected) = hex::decode(record.signature()) else {
            return false;
        };
        let (Ok(message), Ok(mut mac)) = (signing_payload(record), self.mac()) else {
            return false;
        };
        mac.update(message.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    /// Decodes a token and verifies its signature in one step.
    pub fn decode_verified(&self, token: &str) -> LicenseResult<LicenseRecord> {
        let record = self.decode(token)?;
        if !self.verify_signature(&record) {
            return Err(LicenseError::IntegrityMismatch);
        }
        Ok(record)
    }

    fn compute_signature(&self, record: &LicenseRecord) -> LicenseResult<String> {
        let message = signing_payload(record)?;
        let mut mac = self.mac()?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn mac(&self) -> LicenseResult<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|e| LicenseError::InvalidFormat(format!("signing secret rejected: {e}")))
    }
}

/// Canonical JSON of every field except `signature`.
fn signing_payload(record: &LicenseRecord) -> LicenseResult<String> {
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut value {
        map.remove("signature");
    }
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

/// Writes `value` as compact JSON with object keys in sorted order,
/// independent of how the underlying map orders them.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DurationClass;
    use chrono::{TimeZone, Utc};

    fn record() -> LicenseRecord {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        LicenseRecord::new("0123456789ab", DurationClass::OneDay, true, at)
    }

    #[test]
    fn canonical_encoding_sorts_keys() {
        let value: Value = serde_json::from_str(r#"{"b":1,"a":{"d":[1,{"z":0,"y":1}],"c":null}}"#)
            .unwrap();
        let mut out = String::new();
        write_canonical(&value, &mut out);
        assert_eq!(out, r#"{"a":{"c":null,"d":[1,{"y":1,"z":0}]},"b":1}"#);
    }

    #[test]
    fn signature_excludes_itself() {
        let codec = TokenCodec::with_secret(b"unit");
        let mut rec = record();
        codec.sign(&mut rec).unwrap();
        let first = rec.signature().to_string();
        codec.sign(&mut rec).unwrap();
        assert_eq!(first, rec.signature());
    }

    #[test]
    fn every_mutation_changes_signature() {
        let codec = TokenCodec::with_secret(b"unit");
        let mut original = record();
        codec.sign(&mut original).unwrap();

        let at = original.created_at();
        let mutations: Vec<Box<dyn Fn(&mut LicenseRecord)>> = vec![
            Box::new(|r: &mut LicenseRecord| r.bind_to("device-x")),
            Box::new(|r: &mut LicenseRecord| r.revoke()),
            Box::new(move |r: &mut LicenseRecord| r.mark_used(at)),
        ];

        for mutate in mutations {
            let mut changed = original.clone();
            mutate(&mut changed);
            assert!(!codec.verify_signature(&changed));
            codec.sign(&mut changed).unwrap();
            assert_ne!(changed.signature(), original.signature());
            assert!(codec.verify_signature(&changed));
        }
    }

    #[test]
    fn different_secret_rejects() {
        let mut rec = record();
        TokenCodec::with_secret(b"issuer").sign(&mut rec).unwrap();
        assert!(!TokenCodec::with_secret(b"other").verify_signature(&rec));
    }

    #[test]
    fn empty_and_long_secrets_sign() {
        for secret in [&b""[..], &[7u8; 200][..]] {
            let codec = TokenCodec::with_secret(secret);
            let mut rec = record();
            codec.sign(&mut rec).unwrap();
            assert!(codec.verify_signature(&rec));
        }
    }

    #[test]
    fn equivalent_timestamp_spelling_rejected() {
        let codec = TokenCodec::with_secret(b"unit");
        let mut rec = record();
        let token = codec.encode(&mut rec).unwrap();
        let json = String::from_utf8(URL_SAFE_NO_PAD.decode(&token).unwrap()).unwrap();
        let altered = json.replacen("12:00:00Z", "12:00:00z", 1);
        assert_ne!(json, altered);

        let err = codec.decode(&URL_SAFE_NO_PAD.encode(altered)).unwrap_err();
        assert!(matches!(err, LicenseError::InvalidFormat(_)));
    }

    #[test]
    fn non_hex_signature_rejected() {
        let mut rec = record();
        rec.set_signature("not-hex".to_string());
        assert!(!TokenCodec::default().verify_signature(&rec));
    }
}
