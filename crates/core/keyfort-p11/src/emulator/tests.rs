use std::sync::Arc;

use assert_matches::assert_matches;
use rsa::traits::PublicKeyParts;

use crate::config::P11ModuleConf;
use crate::emulator::open_slots;
use crate::error::TokenError;
use crate::mech;
use crate::password::PassThroughResolver;
use crate::slot::P11Slot;
use crate::types::KeyParams;
use crate::types::NewKeyControl;
use crate::types::EcCurve;

const PASSWORD: &str = "test-1234";
const RSA_F4: [u8; 3] = [0x01, 0x00, 0x01];

fn conf(dir: &str, extra: &str) -> P11ModuleConf {
    // top-level keys in `extra` must precede the table sections
    let document = format!(
        r#"
name = "emu1"
type = "emulator"
{extra}

[[native_libraries]]
path = "{dir}"

[[password_sets]]
passwords = ["THRU:{PASSWORD}"]
"#
    );
    P11ModuleConf::from_toml(&document, Arc::new(PassThroughResolver)).unwrap()
}

fn open(dir: &str, extra: &str) -> Vec<P11Slot> {
    open_slots(&conf(dir, extra)).unwrap()
}

#[test]
fn fresh_directory_gets_two_default_slots() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let slots = open(dir.to_str().unwrap(), "");
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].slot_id().index, 0);
    assert_eq!(slots[0].slot_id().id, 800_000);
    assert_eq!(slots[1].slot_id().index, 1);
    assert_eq!(slots[1].slot_id().id, 800_001);
}

#[test]
fn malformed_slot_directories_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_str().unwrap().to_string();
    std::fs::create_dir(tmp.path().join("0-800000")).unwrap();
    std::fs::create_dir(tmp.path().join("not-a-slot-dir")).unwrap();
    std::fs::create_dir(tmp.path().join("junk")).unwrap();
    let slots = open(&dir, "");
    assert_eq!(slots.len(), 1);
}

#[test]
fn rsa_keypair_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let dir = dir.to_str().unwrap();
    let slots = open(dir, "");
    let slot = &slots[0];

    let control = NewKeyControl::new("rsa-a");
    let key_id = slot.generate_rsa_keypair(2048, &RSA_F4, &control).unwrap();
    let hex_id = key_id.hex_id();

    // both halves are on disk
    let slot_dir = std::path::Path::new(dir).join("0-800000");
    assert!(slot_dir.join(format!("privkey/{hex_id}.info")).is_file());
    assert!(slot_dir.join(format!("privkey/{hex_id}.value")).is_file());
    assert!(slot_dir.join(format!("pubkey/{hex_id}.info")).is_file());
    assert_eq!(key_id.public_key_handle, Some(key_id.handle + 1));

    // lookup yields a usable signer with RSA parameters
    let key = slot.get_key_by_id_label(Some(key_id.id.as_slice()), Some("rsa-a")).unwrap();
    let KeyParams::Rsa {
        modulus,
        public_exponent,
    } = key.params.clone().unwrap()
    else {
        panic!("expected RSA parameters, got {:?}", key.params);
    };
    assert_eq!(public_exponent, RSA_F4);

    let content = b"to be signed";
    let signature = slot
        .sign(mech::CKM_SHA256_RSA_PKCS, None, key_id.handle, content)
        .unwrap();
    let public_key = rsa::RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(&modulus),
        rsa::BigUint::from_bytes_be(&public_exponent),
    )
    .unwrap();
    assert_eq!(public_key.size() * 8, 2048);
    let digest = keyfort_security::hash(keyfort_security::HashAlgo::Sha256, &[content]).unwrap();
    public_key
        .verify(rsa::Pkcs1v15Sign::new::<sha2::Sha256>(), &digest, &signature)
        .unwrap();

    // an ECDSA mechanism over an RSA key is refused
    assert_matches!(
        slot.sign(mech::CKM_ECDSA, None, key_id.handle, content),
        Err(TokenError::UnsupportedMechanism(_))
    );
}

#[test]
fn handles_are_stable_across_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let dir = dir.to_str().unwrap();

    let key_id = {
        let slots = open(dir, "");
        slots[0]
            .generate_ec_keypair(EcCurve::P256_OID, &NewKeyControl::new("ec-a"))
            .unwrap()
    };

    let slots = open(dir, "");
    let reopened = slots[0]
        .get_key_id(Some(key_id.id.as_slice()), None)
        .unwrap()
        .expect("key survives reopen");
    assert_eq!(reopened.handle, key_id.handle);
    assert_eq!(reopened, key_id);
}

#[test]
fn read_only_module_rejects_mutation_before_touching_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let dir = dir.to_str().unwrap();
    // populate first, then reopen read-only
    open(dir, "");
    let slots = open(dir, "readonly = true");

    let listing_before = list_files(dir);
    assert_matches!(
        slots[0].generate_secret_key(mech::CKK_AES, Some(256), &NewKeyControl::new("aes-a")),
        Err(TokenError::ReadOnly)
    );
    assert_matches!(
        slots[0].destroy_objects_by_id_label(None, Some("anything")),
        Err(TokenError::ReadOnly)
    );
    assert_eq!(list_files(dir), listing_before);
}

#[test]
fn duplicate_caller_supplied_id_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let slots = open(dir.to_str().unwrap(), "");
    let slot = &slots[0];

    let control = NewKeyControl::new("aes-1").with_id(vec![0xAA, 0xBB]);
    slot.generate_secret_key(mech::CKK_AES, Some(128), &control).unwrap();

    let clash = NewKeyControl::new("aes-2").with_id(vec![0xAA, 0xBB]);
    assert_matches!(
        slot.generate_secret_key(mech::CKK_AES, Some(128), &clash),
        Err(TokenError::DuplicateId(id)) if id == "aabb"
    );

    // without a caller-supplied id a fresh one is drawn instead
    let auto = slot
        .generate_secret_key(mech::CKK_AES, Some(128), &NewKeyControl::new("aes-3"))
        .unwrap();
    assert_ne!(auto.id, vec![0xAA, 0xBB]);
    assert_eq!(auto.id.len(), 8);
}

#[test]
fn duplicate_labels_are_uniquified() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let slots = open(dir.to_str().unwrap(), "");
    let slot = &slots[0];

    let first = slot
        .generate_secret_key(mech::CKK_AES, Some(128), &NewKeyControl::new("aes"))
        .unwrap();
    let second = slot
        .generate_secret_key(mech::CKK_AES, Some(128), &NewKeyControl::new("aes"))
        .unwrap();
    assert_eq!(first.label, "aes");
    assert_eq!(second.label, "aes-1");
}

#[test]
fn destroy_by_id_label_removes_the_pair() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let slots = open(dir.to_str().unwrap(), "");
    let slot = &slots[0];

    let key_id = slot
        .generate_ec_keypair(EcCurve::P256_OID, &NewKeyControl::new("ec-gone"))
        .unwrap();
    assert!(slot.object_exists_by_id_label(Some(key_id.id.as_slice()), None).unwrap());

    // private and public halves both count
    let destroyed = slot.destroy_objects_by_id_label(Some(key_id.id.as_slice()), None).unwrap();
    assert_eq!(destroyed, 2);
    assert!(!slot.object_exists_by_id_label(Some(key_id.id.as_slice()), None).unwrap());

    // destroying again finds nothing and is not an error
    assert_eq!(
        slot.destroy_objects_by_id_label(Some(key_id.id.as_slice()), None).unwrap(),
        0
    );
}

#[test]
fn bulk_destroys_are_unsupported() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let slots = open(dir.to_str().unwrap(), "");
    assert_matches!(
        slots[0].destroy_all_objects(),
        Err(TokenError::Unsupported(_))
    );
    assert_matches!(
        slots[0].destroy_objects_by_handle(&[1, 2]),
        Err(TokenError::Unsupported(_))
    );
}

#[test]
fn hmac_secret_key_signs_and_digests() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let slots = open(dir.to_str().unwrap(), "");
    let slot = &slots[0];

    let secret = b"0123456789abcdef0123456789abcdef";
    let key_id = slot
        .import_secret_key(mech::CKK_SHA256_HMAC, secret, &NewKeyControl::new("mac-1"))
        .unwrap();

    let signature = slot
        .sign(mech::CKM_SHA256_HMAC, None, key_id.handle, b"payload")
        .unwrap();
    let expected = {
        use hmac::Mac;
        let mut engine = <hmac::Hmac<sha2::Sha256>>::new_from_slice(secret).unwrap();
        engine.update(b"payload");
        engine.finalize().into_bytes().to_vec()
    };
    assert_eq!(signature, expected);

    let digest = slot.digest_secret_key(mech::CKM_SHA256, key_id.handle).unwrap();
    let direct = keyfort_security::hash(keyfort_security::HashAlgo::Sha256, &[secret]).unwrap();
    assert_eq!(digest, direct);
}

#[test]
fn mechanism_filter_rejects_before_the_backend_sees_the_call() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let extra = r#"
[[mechanism_sets]]
name = "basic"
include = ["ALL"]
exclude = ["CKM_RSA_X_509"]

[[mechanism_filters]]
slots = [{ index = 0 }]
mechanism_set = "basic"
"#;
    let slots = open(dir.to_str().unwrap(), extra);

    // slot 0: filtered out before key lookup, even for a bogus handle
    assert_matches!(
        slots[0].sign(mech::CKM_RSA_X_509, None, 0xDEAD, b"x"),
        Err(TokenError::UnsupportedMechanism(_))
    );
    // slot 1: the filter permits it, so the failure is the unknown handle
    assert_matches!(
        slots[1].sign(mech::CKM_RSA_X_509, None, 0xDEAD, b"x"),
        Err(TokenError::UnknownKey(_))
    );
}

#[test]
fn otf_generation_stores_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let dir = dir.to_str().unwrap();
    let slots = open(dir, "");

    let private_key_info = slots[0].generate_rsa_keypair_otf(1024, &RSA_F4).unwrap();
    use pkcs8::DecodePrivateKey;
    let key = rsa::RsaPrivateKey::from_pkcs8_der(&private_key_info).unwrap();
    assert_eq!(key.size() * 8, 1024);

    let privkeys = std::fs::read_dir(std::path::Path::new(dir).join("0-800000/privkey"))
        .unwrap()
        .count();
    assert_eq!(privkeys, 0);
}

#[test]
fn show_details_lists_objects_and_mechanisms() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("hsm");
    let slots = open(dir.to_str().unwrap(), "");
    let slot = &slots[0];

    slot.generate_secret_key(mech::CKK_AES, Some(256), &NewKeyControl::new("aes-shown"))
        .unwrap();

    let mut plain = Vec::new();
    slot.show_details(&mut plain, None, false).unwrap();
    let plain = String::from_utf8(plain).unwrap();
    assert!(plain.contains("aes-shown"));
    assert!(!plain.contains("Supported mechanisms"));

    let mut verbose = Vec::new();
    slot.show_details(&mut verbose, None, true).unwrap();
    let verbose = String::from_utf8(verbose).unwrap();
    assert!(verbose.contains("Supported mechanisms"));
    assert!(verbose.contains("CKM_RSA_PKCS"));
}

fn list_files(dir: &str) -> Vec<String> {
    let mut files = Vec::new();
    let mut pending = vec![std::path::PathBuf::from(dir)];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                pending.push(entry.path());
            } else {
                files.push(format!(
                    "{} {}",
                    entry.path().display(),
                    entry.metadata().unwrap().len()
                ));
            }
        }
    }
    files.sort();
    files
}
