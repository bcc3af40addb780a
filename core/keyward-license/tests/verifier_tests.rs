mod common;

use chrono::Duration;
use common::{ClientFixture, epoch, issuer_fixture, json_token, test_codec, token_json};
use keyward_license::{
    Disposition, DurationClass, LicenseError, LookupStrategy, TamperKind, VerificationState,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[test]
fn missing_token_prompts_for_one() {
    let fx = issuer_fixture();
    let client = ClientFixture::new();
    let outcome = client.verifier("device-a", &fx.clock).check_valid(false);

    assert!(!outcome.valid);
    assert_eq!(outcome.state, VerificationState::Unverified);
    assert_eq!(outcome.trail, vec![VerificationState::Unverified]);
    assert_eq!(outcome.disposition, Disposition::PromptForToken);
    assert!(outcome.reason.contains("no license token"));
}

#[test]
fn fresh_token_binds_on_first_use() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::ThirtyDays, true).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);
    let verifier = client.verifier("device-a", &fx.clock);

    let outcome = verifier.check_valid(false);
    assert!(outcome.valid, "{}", outcome.reason);
    assert_eq!(outcome.state, VerificationState::Valid);
    assert_eq!(
        outcome.trail,
        vec![VerificationState::Unverified, VerificationState::Valid]
    );
    assert_eq!(outcome.disposition, Disposition::Proceed);
    assert_eq!(outcome.short_id.as_deref(), Some(issued.short_id.as_str()));
    assert!(!outcome.rebound());

    let stored = test_codec().decode_verified(&client.stored_token()).unwrap();
    assert_eq!(stored.bound_device_id(), Some(verifier.device_id()));
    assert!(stored.is_used());
    assert_eq!(stored.used_at(), Some(epoch()));
}

#[test]
fn unbound_token_stays_unbound() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::OneDay, false).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);

    assert!(client.verifier("device-a", &fx.clock).check_valid(false).valid);
    assert!(client.verifier("device-b", &fx.clock).check_valid(false).valid);

    let stored = test_codec().decode_verified(&client.stored_token()).unwrap();
    assert_eq!(stored.bound_device_id(), None);
}

#[test]
fn short_license_expires_after_its_window() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::OneMinute, true).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);
    let verifier = client.verifier("device-a", &fx.clock);

    fx.clock.advance(Duration::seconds(30));
    assert!(verifier.check_valid(false).valid);

    fx.clock.advance(Duration::seconds(31));
    let outcome = verifier.check_valid(false);
    assert!(!outcome.valid);
    assert_eq!(outcome.state, VerificationState::Expired);
    assert_eq!(outcome.disposition, Disposition::PromptForToken);
    assert!(outcome.reason.contains("expired"));
}

#[test]
fn perpetual_license_never_expires() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::Perpetual, true).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);
    let verifier = client.verifier("device-a", &fx.clock);

    fx.clock.advance(Duration::days(365 * 20));
    assert!(verifier.check_valid(false).valid);
}

#[test]
fn token_follows_operator_to_new_machine() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::SevenDays, true).unwrap();
    let laptop = ClientFixture::new();
    laptop.install(&issued.token);
    let laptop_verifier = laptop.verifier("laptop", &fx.clock);
    assert!(laptop_verifier.check_valid(false).valid);

    // Copy the bound token to a second machine.
    let desktop = ClientFixture::new();
    desktop.install(&laptop.stored_token());
    let desktop_verifier = desktop.verifier("desktop", &fx.clock);

    let outcome = desktop_verifier.check_valid(false);
    assert!(outcome.valid, "{}", outcome.reason);
    assert!(outcome.rebound());
    assert_eq!(
        outcome.trail,
        vec![
            VerificationState::Unverified,
            VerificationState::MachineRebound,
            VerificationState::Valid,
        ]
    );
    assert!(outcome.reason.contains("transferred"));

    let moved = test_codec().decode_verified(&desktop.stored_token()).unwrap();
    assert_eq!(moved.bound_device_id(), Some(desktop_verifier.device_id()));

    // A second pass on the new machine is a plain success.
    let again = desktop_verifier.check_valid(false);
    assert!(again.valid);
    assert!(!again.rebound());
}

#[test]
fn rebinding_keeps_first_use_time() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::SevenDays, true).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);
    client.verifier("laptop", &fx.clock).verify(false).unwrap();

    fx.clock.advance(Duration::hours(2));
    let verified = client.verifier("desktop", &fx.clock).verify(false).unwrap();
    assert!(verified.rebound);
    assert_eq!(verified.record.used_at(), Some(epoch()));
}

#[test]
fn revoked_in_registry_terminates_and_sticks_offline() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::ThirtyDays, true).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);
    let online = client
        .verifier("device-a", &fx.clock)
        .with_registry(Arc::clone(&fx.registry));

    assert!(online.check_valid(true).valid);
    assert!(fx.registry.revoke(&issued.short_id).unwrap());

    let outcome = online.check_valid(true);
    assert!(!outcome.valid);
    assert_eq!(outcome.state, VerificationState::Revoked);
    assert_eq!(outcome.disposition, Disposition::Terminate);

    // The local token now carries the revocation and still verifies as
    // authentic, so a fully offline pass reports revoked, not tampered.
    let stored = test_codec().decode_verified(&client.stored_token()).unwrap();
    assert!(stored.is_revoked());

    let offline = client.verifier("device-a", &fx.clock).check_valid(false);
    assert_eq!(offline.state, VerificationState::Revoked);
    assert_eq!(offline.disposition, Disposition::Terminate);
}

#[test]
fn registry_consultation_records_usage() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::OneDay, true).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);
    let verifier = client
        .verifier("device-a", &fx.clock)
        .with_registry(Arc::clone(&fx.registry));

    fx.clock.advance(Duration::minutes(10));
    let verified = verifier.verify(true).unwrap();
    assert_eq!(verified.registry_match, Some(LookupStrategy::ShortId));

    let entry = fx.registry.get(&issued.registry_id).unwrap().unwrap();
    assert!(entry.record.is_used());
    assert_eq!(entry.record.used_at(), Some(epoch() + Duration::minutes(10)));
    assert_eq!(entry.last_device_id.as_deref(), Some(verifier.device_id()));
}

#[test]
fn offline_pass_ignores_registry() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::OneDay, false).unwrap();
    fx.registry.revoke(&issued.short_id).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);
    let verifier = client
        .verifier("device-a", &fx.clock)
        .with_registry(Arc::clone(&fx.registry));

    let verified = verifier.verify(false).unwrap();
    assert_eq!(verified.registry_match, None);
}

#[test]
fn unknown_to_registry_falls_back_to_token() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::OneDay, false).unwrap();
    fx.registry.delete(&issued.registry_id).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);
    let verifier = client
        .verifier("device-a", &fx.clock)
        .with_registry(Arc::clone(&fx.registry));

    let verified = verifier.verify(true).unwrap();
    assert_eq!(verified.registry_match, None);
}

#[test]
fn garbage_token_is_tampered_format() {
    let fx = issuer_fixture();
    let client = ClientFixture::new();
    client.install("this is not a license");

    let outcome = client.verifier("device-a", &fx.clock).check_valid(false);
    assert_eq!(outcome.state, VerificationState::Tampered(TamperKind::Format));
    assert_eq!(outcome.disposition, Disposition::Terminate);
}

#[test]
fn edited_token_is_tampered_integrity() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::OneMinute, false).unwrap();
    let mut json = token_json(&issued.token);
    json["duration_class"] = serde_json::json!("perpetual");
    json["expires_at"] = serde_json::Value::Null;

    let client = ClientFixture::new();
    client.install(&json_token(&json));
    let outcome = client.verifier("device-a", &fx.clock).check_valid(false);
    assert_eq!(
        outcome.state,
        VerificationState::Tampered(TamperKind::Integrity)
    );
    assert_eq!(outcome.disposition, Disposition::Terminate);
    assert!(outcome.reason.contains("tampered"));
}

#[test]
fn failed_pass_leaves_token_untouched() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::OneMinute, true).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);

    fx.clock.advance(Duration::minutes(5));
    let outcome = client.verifier("device-a", &fx.clock).check_valid(false);
    assert_eq!(outcome.state, VerificationState::Expired);
    assert_eq!(client.stored_token(), issued.token);
}

#[test]
fn activate_installs_and_verifies() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::OneDay, true).unwrap();
    let client = ClientFixture::new();
    let verifier = client.verifier("device-a", &fx.clock);

    let outcome = verifier.activate(&format!("{}\n", issued.token), false);
    assert!(outcome.valid, "{}", outcome.reason);
    let stored = test_codec().decode_verified(&client.stored_token()).unwrap();
    assert_eq!(stored.short_id(), issued.short_id);
    assert_eq!(stored.bound_device_id(), Some(verifier.device_id()));
}

#[test]
fn activate_rejects_tampered_token_without_replacing() {
    let fx = issuer_fixture();
    let good = fx.issuer.issue(DurationClass::OneDay, false).unwrap();
    let client = ClientFixture::new();
    let verifier = client.verifier("device-a", &fx.clock);
    assert!(verifier.activate(&good.token, false).valid);
    let installed = client.stored_token();

    let mut json = token_json(&good.token);
    json["binding_requested"] = serde_json::json!(true);
    let outcome = verifier.activate(&json_token(&json), false);
    assert!(!outcome.valid);
    assert_eq!(
        outcome.state,
        VerificationState::Tampered(TamperKind::Integrity)
    );
    assert_eq!(client.stored_token(), installed);
}

#[test]
fn activation_replaces_expired_token() {
    let fx = issuer_fixture();
    let old = fx.issuer.issue(DurationClass::OneMinute, false).unwrap();
    let client = ClientFixture::new();
    client.install(&old.token);
    let verifier = client.verifier("device-a", &fx.clock);

    fx.clock.advance(Duration::minutes(2));
    assert_eq!(
        verifier.check_valid(false).disposition,
        Disposition::PromptForToken
    );

    let fresh = fx.issuer.issue(DurationClass::OneDay, false).unwrap();
    let outcome = verifier.activate(&fresh.token, false);
    assert!(outcome.valid);
    assert_eq!(outcome.short_id.as_deref(), Some(fresh.short_id.as_str()));
}

#[test]
fn remote_revocation_is_persisted() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::OneDay, false).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);
    let verifier = client.verifier("device-a", &fx.clock);

    verifier.apply_remote_revocation().unwrap();
    // Applying twice is harmless.
    verifier.apply_remote_revocation().unwrap();

    let record = verifier.current_record().unwrap().unwrap();
    assert!(record.is_revoked());
    assert!(matches!(verifier.verify(false), Err(LicenseError::Revoked)));
}

#[test]
fn current_record_reports_missing_token() {
    let fx = issuer_fixture();
    let client = ClientFixture::new();
    let verifier = client.verifier("device-a", &fx.clock);
    assert!(verifier.current_record().unwrap().is_none());
    assert!(matches!(
        verifier.apply_remote_revocation(),
        Err(LicenseError::NoToken)
    ));
}

#[test]
fn concurrent_passes_do_not_corrupt_token() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::OneDay, true).unwrap();
    let client = ClientFixture::new();
    client.install(&issued.token);
    let verifier = Arc::new(client.verifier("device-a", &fx.clock));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let verifier = Arc::clone(&verifier);
            std::thread::spawn(move || verifier.check_valid(false).valid)
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }
    assert!(test_codec().decode_verified(&client.stored_token()).is_ok());
}

#[test]
fn revocation_is_not_lost_to_a_pass_from_another_verifier() {
    let fx = issuer_fixture();
    for _ in 0..10 {
        let issued = fx.issuer.issue(DurationClass::ThirtyDays, true).unwrap();
        let client = ClientFixture::new();
        client.install(&issued.token);
        // Separate verifiers, each with its own store on the same file.
        let checker = client.verifier("device-a", &fx.clock);
        let revoker = client.verifier("device-a", &fx.clock);
        let barrier = std::sync::Barrier::new(2);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..20 {
                    checker.check_valid(false);
                }
            });
            scope.spawn(|| {
                barrier.wait();
                revoker.apply_remote_revocation().unwrap();
            });
        });

        let stored = test_codec().decode_verified(&client.stored_token()).unwrap();
        assert!(stored.is_revoked(), "revocation was overwritten");
        let outcome = checker.check_valid(false);
        assert_eq!(outcome.state, VerificationState::Revoked);
    }
}

#[test]
fn reactivating_a_revoked_license_is_refused() {
    let fx = issuer_fixture();
    let issued = fx.issuer.issue(DurationClass::ThirtyDays, false).unwrap();
    let client = ClientFixture::new();
    let verifier = client.verifier("device-a", &fx.clock);
    assert!(verifier.activate(&issued.token, false).valid);
    verifier.apply_remote_revocation().unwrap();
    let revoked_token = client.stored_token();

    let outcome = verifier.activate(&issued.token, false);
    assert!(!outcome.valid);
    assert_eq!(outcome.state, VerificationState::Revoked);
    assert_eq!(client.stored_token(), revoked_token);

    // A different license may still replace it.
    let fresh = fx.issuer.issue(DurationClass::ThirtyDays, false).unwrap();
    assert!(verifier.activate(&fresh.token, false).valid);
}
