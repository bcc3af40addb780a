mod common;

use common::{epoch, json_token, test_codec, token_json};
use keyward_license::{DurationClass, LicenseError, LicenseRecord, LicenseStatus, TokenCodec};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const BASE64URL: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

fn signed_token(class: DurationClass, binding: bool) -> (LicenseRecord, String) {
    let mut record = LicenseRecord::new("a1b2c3d4e5f6", class, binding, epoch());
    let token = test_codec().encode(&mut record).unwrap();
    (record, token)
}

#[test]
fn encode_decode_roundtrip() {
    let (record, token) = signed_token(DurationClass::ThirtyDays, true);
    let decoded = test_codec().decode_verified(&token).unwrap();
    assert_eq!(decoded, record);
    assert_eq!(decoded.status(), LicenseStatus::Active);
    assert_eq!(decoded.bound_device_id(), None);
}

#[test]
fn token_is_unpadded_base64url() {
    let (_, token) = signed_token(DurationClass::Perpetual, false);
    assert!(!token.contains('='));
    assert!(token.bytes().all(|b| BASE64URL.contains(&b)));
}

#[test]
fn surrounding_whitespace_is_ignored() {
    let (record, token) = signed_token(DurationClass::OneHour, false);
    let decoded = test_codec()
        .decode_verified(&format!("  {token}\n"))
        .unwrap();
    assert_eq!(decoded, record);
}

#[test]
fn empty_token_is_invalid_format() {
    let err = test_codec().decode("   ").unwrap_err();
    assert!(matches!(err, LicenseError::InvalidFormat(_)));
}

#[test]
fn non_base64_is_invalid_format() {
    let err = test_codec().decode("not a token!").unwrap_err();
    assert!(matches!(err, LicenseError::InvalidFormat(_)));
}

#[test]
fn base64_of_garbage_is_invalid_format() {
    let token = json_token(&serde_json::json!({"hello": "world"}));
    let err = test_codec().decode(&token).unwrap_err();
    assert!(matches!(err, LicenseError::InvalidFormat(_)));
}

#[test]
fn edited_expiry_is_integrity_mismatch() {
    let (_, token) = signed_token(DurationClass::OneMinute, false);
    let mut json = token_json(&token);
    json["expires_at"] = serde_json::json!("2099-01-01T00:00:00Z");

    let err = test_codec().decode_verified(&json_token(&json)).unwrap_err();
    assert!(matches!(err, LicenseError::IntegrityMismatch));
}

#[test]
fn edited_duration_is_integrity_mismatch() {
    let mut record = LicenseRecord::new("a1b2c3d4e5f6", DurationClass::OneDay, false, epoch());
    let token = test_codec().encode(&mut record).unwrap();
    let mut json = token_json(&token);
    json["duration_class"] = serde_json::json!("perpetual");
    json["expires_at"] = serde_json::Value::Null;

    let err = test_codec().decode_verified(&json_token(&json)).unwrap_err();
    assert!(matches!(err, LicenseError::IntegrityMismatch));
}

#[test]
fn unknown_field_is_rejected() {
    let (_, token) = signed_token(DurationClass::OneDay, false);
    let mut json = token_json(&token);
    json["extra"] = serde_json::json!(true);

    assert!(test_codec().decode_verified(&json_token(&json)).is_err());
}

#[test]
fn other_secret_cannot_verify() {
    let (_, token) = signed_token(DurationClass::OneDay, false);
    let err = TokenCodec::with_secret(b"someone-else")
        .decode_verified(&token)
        .unwrap_err();
    assert!(matches!(err, LicenseError::IntegrityMismatch));
}

#[test]
fn decode_does_not_check_signature() {
    let (_, token) = signed_token(DurationClass::OneDay, false);
    let mut json = token_json(&token);
    json["signature"] = serde_json::json!("00");

    let record = test_codec().decode(&json_token(&json)).unwrap();
    assert!(!test_codec().verify_signature(&record));
}

proptest! {
    #[test]
    fn any_single_char_corruption_is_rejected(
        class_idx in 0usize..DurationClass::ALL.len(),
        binding in any::<bool>(),
        position in any::<prop::sample::Index>(),
        replacement in any::<prop::sample::Index>(),
    ) {
        let (_, token) = signed_token(DurationClass::ALL[class_idx], binding);
        let mut bytes = token.into_bytes();
        let at = position.index(bytes.len());
        let mut new = BASE64URL[replacement.index(BASE64URL.len())];
        if new == bytes[at] {
            new = if new == b'A' { b'B' } else { b'A' };
        }
        bytes[at] = new;
        let corrupted = String::from_utf8(bytes).unwrap();

        let err = test_codec().decode_verified(&corrupted).unwrap_err();
        prop_assert!(
            matches!(err, LicenseError::InvalidFormat(_) | LicenseError::IntegrityMismatch),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn roundtrip_preserves_every_class(
        class_idx in 0usize..DurationClass::ALL.len(),
        binding in any::<bool>(),
        offset_secs in 0i64..10_000_000,
    ) {
        let created = epoch() + chrono::Duration::seconds(offset_secs);
        let mut record = LicenseRecord::new(
            LicenseRecord::generate_short_id(),
            DurationClass::ALL[class_idx],
            binding,
            created,
        );
        let token = test_codec().encode(&mut record).unwrap();
        prop_assert_eq!(test_codec().decode_verified(&token).unwrap(), record);
    }
}
