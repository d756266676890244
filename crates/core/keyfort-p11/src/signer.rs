//! Bridges slots into the concurrent signer pool: each engine holds a slot
//! reference, a key handle and a fixed mechanism, and the pool bounds how
//! many of them sign at once.

use std::sync::Arc;

use keyfort_security::ConcurrentSigner;
use keyfort_security::SecurityError;
use keyfort_security::SignEngine;

use crate::error::TokenError;
use crate::mech;
use crate::slot::P11Slot;
use crate::types::ObjectClass;
use crate::types::P11Key;
use crate::types::P11Params;

/// One single-threaded signing engine over a slot-resident key.
pub struct P11SignEngine {
    slot: Arc<P11Slot>,
    key_handle: u64,
    mechanism: u64,
    params: Option<P11Params>,
}

impl P11SignEngine {
    pub fn new(
        slot: Arc<P11Slot>,
        key_handle: u64,
        mechanism: u64,
        params: Option<P11Params>,
    ) -> Self {
        Self {
            slot,
            key_handle,
            mechanism,
            params,
        }
    }
}

impl SignEngine for P11SignEngine {
    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        self.slot
            .sign(self.mechanism, self.params.as_ref(), self.key_handle, data)
            .map_err(|err| SecurityError::SignFailed(err.to_string()))
    }
}

/// Builds a pool of `parallelism` engines over one key. MAC keys come out as
/// a MAC signer carrying the SHA-1 fingerprint of the key value, when the
/// backend can digest it.
pub fn concurrent_signer(
    slot: Arc<P11Slot>,
    key: &P11Key,
    mechanism: u64,
    params: Option<P11Params>,
    parallelism: usize,
) -> Result<ConcurrentSigner, TokenError> {
    let parallelism = parallelism.max(1);
    let engines: Vec<Box<dyn SignEngine>> = (0..parallelism)
        .map(|_| {
            Box::new(P11SignEngine::new(
                Arc::clone(&slot),
                key.key_id.handle,
                mechanism,
                params.clone(),
            )) as Box<dyn SignEngine>
        })
        .collect();

    let name = format!("{}#{}", slot.module_name(), key.key_id);
    if key.key_id.object_class == ObjectClass::SecretKey {
        let signer = ConcurrentSigner::new_mac(name, engines);
        match slot.digest_secret_key(mech::CKM_SHA_1, key.key_id.handle) {
            Ok(digest) => signer
                .set_sha1_of_mac_key(&digest)
                .map_err(|err| TokenError::other(err.to_string()))?,
            // sensitive keys cannot be fingerprinted; the signer still works
            Err(err) => tracing::debug!(%err, "cannot compute SHA-1 of MAC key"),
        }
        Ok(signer)
    } else {
        Ok(ConcurrentSigner::new(name, engines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::P11ModuleConf;
    use crate::password::PassThroughResolver;
    use crate::types::NewKeyControl;

    fn emulator_slot() -> (tempfile::TempDir, Arc<P11Slot>) {
        let tmp = tempfile::tempdir().unwrap();
        let document = format!(
            r#"
name = "signer-test"
type = "emulator"

[[native_libraries]]
path = "{}"

[[password_sets]]
passwords = ["THRU:test-1234"]
"#,
            tmp.path().join("hsm").to_str().unwrap()
        );
        let conf =
            P11ModuleConf::from_toml(&document, std::sync::Arc::new(PassThroughResolver)).unwrap();
        let mut slots = crate::emulator::open_slots(&conf).unwrap();
        (tmp, Arc::new(slots.remove(0)))
    }

    #[test]
    fn pool_signs_concurrently_over_one_key() {
        let (_tmp, slot) = emulator_slot();
        let key_id = slot
            .generate_ec_keypair(crate::types::EcCurve::P256_OID, &NewKeyControl::new("pool"))
            .unwrap();
        let key = slot.get_key(&key_id).unwrap();

        let signer = Arc::new(
            concurrent_signer(
                Arc::clone(&slot),
                &key,
                mech::CKM_ECDSA_SHA256,
                None,
                2,
            )
            .unwrap(),
        );
        assert!(signer.is_healthy());

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let signer = Arc::clone(&signer);
                std::thread::spawn(move || {
                    let signature = signer.sign(format!("message {i}").as_bytes()).unwrap();
                    assert_eq!(signature.len(), 64);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(signer.engine_count(), 2);
    }

    #[test]
    fn mac_signer_carries_the_key_fingerprint() {
        let (_tmp, slot) = emulator_slot();
        let secret = b"a-32-byte-long-hmac-secret-key!!";
        let key_id = slot
            .import_secret_key(mech::CKK_SHA256_HMAC, secret, &NewKeyControl::new("mac"))
            .unwrap();
        let key = slot.get_key(&key_id).unwrap();

        let signer =
            concurrent_signer(Arc::clone(&slot), &key, mech::CKM_SHA256_HMAC, None, 1).unwrap();
        assert!(signer.is_mac());
        let expected =
            keyfort_security::hash(keyfort_security::HashAlgo::Sha1, &[secret]).unwrap();
        assert_eq!(signer.sha1_of_mac_key().unwrap().to_vec(), expected);
        assert!(signer.is_healthy());
    }
}
