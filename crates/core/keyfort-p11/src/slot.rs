//! The slot base: policy enforcement shared by every backend.
//!
//! A [`P11Slot`] owns one backend (native, emulator or proxy) behind the
//! [`SlotBackend`] seam and enforces everything the backends must agree on
//! before any of them is reached: mechanism filtering, read-only rejection,
//! id/label uniqueness and key-type allow-lists. Object-set mutations are
//! serialized by a per-slot mutex so the uniqueness checks cannot race.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;

use rand::RngCore;
use tracing::debug;

use crate::config::P11ModuleConf;
use crate::error::TokenError;
use crate::filter::P11MechFilter;
use crate::mech;
use crate::types::NewKeyControl;
use crate::types::NewObjectConf;
use crate::types::P11Key;
use crate::types::P11KeyId;
use crate::types::P11SlotId;
use crate::types::P11Params;

/// The primitives a backend supplies. Everything here runs after the slot
/// base has applied its policies.
pub(crate) trait SlotBackend: Send + Sync {
    fn object_exists(&self, id: Option<&[u8]>, label: Option<&str>) -> Result<bool, TokenError>;

    fn key_id(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<Option<P11KeyId>, TokenError>;

    fn key(&self, key_id: &P11KeyId) -> Result<Option<P11Key>, TokenError>;

    fn mechanisms(&self) -> Result<Vec<u64>, TokenError>;

    fn generate_secret_key(
        &self,
        key_type: u64,
        key_len_bits: Option<u32>,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError>;

    fn import_secret_key(
        &self,
        key_type: u64,
        value: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError>;

    fn generate_rsa_keypair(
        &self,
        keysize: u32,
        public_exponent: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError>;

    fn generate_rsa_keypair_otf(
        &self,
        keysize: u32,
        public_exponent: &[u8],
    ) -> Result<Vec<u8>, TokenError>;

    fn generate_dsa_keypair(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError>;

    fn generate_dsa_keypair_by_size(
        &self,
        p_bits: u32,
        q_bits: u32,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError>;

    fn generate_dsa_keypair_otf(&self, p: &[u8], q: &[u8], g: &[u8])
        -> Result<Vec<u8>, TokenError>;

    fn generate_ec_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError>;

    fn generate_ec_keypair_otf(&self, curve_oid: &str) -> Result<Vec<u8>, TokenError>;

    fn generate_edwards_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError>;

    fn generate_edwards_keypair_otf(&self, curve_oid: &str) -> Result<Vec<u8>, TokenError>;

    fn generate_montgomery_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError>;

    fn generate_montgomery_keypair_otf(&self, curve_oid: &str) -> Result<Vec<u8>, TokenError>;

    fn generate_sm2_keypair(&self, control: &NewKeyControl) -> Result<P11KeyId, TokenError>;

    fn generate_sm2_keypair_otf(&self) -> Result<Vec<u8>, TokenError>;

    fn sign(
        &self,
        mechanism: u64,
        params: Option<&P11Params>,
        key_handle: u64,
        content: &[u8],
    ) -> Result<Vec<u8>, TokenError>;

    fn digest_secret_key(&self, mechanism: u64, key_handle: u64) -> Result<Vec<u8>, TokenError>;

    fn destroy_all_objects(&self) -> Result<u32, TokenError>;

    fn destroy_objects_by_handle(&self, handles: &[u64]) -> Result<Vec<u64>, TokenError>;

    fn destroy_objects_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<u32, TokenError>;

    fn show_details(
        &self,
        out: &mut dyn io::Write,
        handle: Option<u64>,
        verbose: bool,
    ) -> io::Result<()>;
}

/// One slot of a module, any backend.
pub struct P11Slot {
    module_name: String,
    slot_id: P11SlotId,
    read_only: bool,
    mech_filter: Arc<P11MechFilter>,
    new_object_conf: NewObjectConf,
    secret_key_types: Vec<u64>,
    key_pair_types: Vec<u64>,
    backend: Box<dyn SlotBackend>,
    op_lock: Mutex<()>,
    key_cache: Mutex<HashMap<u64, Arc<P11Key>>>,
}

impl std::fmt::Debug for P11Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P11Slot")
            .field("module_name", &self.module_name)
            .field("slot_id", &self.slot_id)
            .field("read_only", &self.read_only)
            .field("new_object_conf", &self.new_object_conf)
            .field("secret_key_types", &self.secret_key_types)
            .field("key_pair_types", &self.key_pair_types)
            .finish_non_exhaustive()
    }
}

impl P11Slot {
    pub(crate) fn new(conf: &P11ModuleConf, slot_id: P11SlotId, backend: Box<dyn SlotBackend>) -> Self {
        Self {
            module_name: conf.name.clone(),
            slot_id,
            read_only: conf.read_only,
            mech_filter: Arc::clone(&conf.mech_filter),
            new_object_conf: conf.new_object_conf,
            secret_key_types: conf.secret_key_types.clone(),
            key_pair_types: conf.key_pair_types.clone(),
            backend,
            op_lock: Mutex::new(()),
            key_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn slot_id(&self) -> P11SlotId {
        self.slot_id
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Mechanisms the backend advertises, before filtering.
    pub fn mechanisms(&self) -> Result<Vec<u64>, TokenError> {
        self.backend.mechanisms()
    }

    pub fn supports_mechanism(&self, mechanism: u64) -> bool {
        self.mech_filter
            .is_permitted(&self.module_name, &self.slot_id, mechanism)
    }

    // ---- lookups ---------------------------------------------------------

    pub fn get_key(&self, key_id: &P11KeyId) -> Result<P11Key, TokenError> {
        if let Some(cached) = self.key_cache.lock().unwrap().get(&key_id.handle) {
            return Ok((**cached).clone());
        }
        let key = self
            .backend
            .key(key_id)?
            .ok_or_else(|| TokenError::UnknownKey(key_id.to_string()))?;
        self.key_cache
            .lock()
            .unwrap()
            .insert(key.key_id.handle, Arc::new(key.clone()));
        Ok(key)
    }

    pub fn get_key_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<P11Key, TokenError> {
        let key_id = self
            .get_key_id(id, label)?
            .ok_or_else(|| TokenError::UnknownKey(describe_id_label(id, label)))?;
        self.get_key(&key_id)
    }

    /// Resolves the canonical key id; `None` when nothing matches or both
    /// arguments are absent.
    pub fn get_key_id(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<Option<P11KeyId>, TokenError> {
        if id.is_none() && label.is_none() {
            return Ok(None);
        }
        self.backend.key_id(id, label)
    }

    pub fn object_exists_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<bool, TokenError> {
        if id.is_none() && label.is_none() {
            return Err(TokenError::other("at least one of id and label must be set"));
        }
        self.backend.object_exists(id, label)
    }

    // ---- generation ------------------------------------------------------

    pub fn generate_secret_key(
        &self,
        key_type: u64,
        key_len_bits: Option<u32>,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.assert_writable()?;
        self.assert_secret_key_type(key_type)?;
        let mechanism = if key_type == mech::CKK_AES {
            mech::CKM_AES_KEY_GEN
        } else {
            mech::CKM_GENERIC_SECRET_KEY_GEN
        };
        self.assert_mechanism(mechanism)?;
        let _guard = self.op_lock.lock().unwrap();
        let control = self.prepare_control(control)?;
        let key_id = self
            .backend
            .generate_secret_key(key_type, key_len_bits, &control)?;
        debug!(slot = %self.slot_id, key = %key_id, "generated secret key");
        Ok(key_id)
    }

    pub fn import_secret_key(
        &self,
        key_type: u64,
        value: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.assert_writable()?;
        self.assert_secret_key_type(key_type)?;
        let _guard = self.op_lock.lock().unwrap();
        let control = self.prepare_control(control)?;
        let key_id = self.backend.import_secret_key(key_type, value, &control)?;
        debug!(slot = %self.slot_id, key = %key_id, "imported secret key");
        Ok(key_id)
    }

    pub fn generate_rsa_keypair(
        &self,
        keysize: u32,
        public_exponent: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.assert_writable()?;
        self.assert_keypair_type(mech::CKK_RSA)?;
        self.assert_mechanism(mech::CKM_RSA_PKCS_KEY_PAIR_GEN)?;
        let _guard = self.op_lock.lock().unwrap();
        let control = self.prepare_control(control)?;
        let key_id = self
            .backend
            .generate_rsa_keypair(keysize, public_exponent, &control)?;
        debug!(slot = %self.slot_id, key = %key_id, keysize, "generated RSA keypair");
        Ok(key_id)
    }

    pub fn generate_rsa_keypair_otf(
        &self,
        keysize: u32,
        public_exponent: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        self.assert_keypair_type(mech::CKK_RSA)?;
        self.assert_mechanism(mech::CKM_RSA_PKCS_KEY_PAIR_GEN)?;
        self.backend.generate_rsa_keypair_otf(keysize, public_exponent)
    }

    pub fn generate_dsa_keypair(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.assert_writable()?;
        self.assert_keypair_type(mech::CKK_DSA)?;
        self.assert_mechanism(mech::CKM_DSA_KEY_PAIR_GEN)?;
        let _guard = self.op_lock.lock().unwrap();
        let control = self.prepare_control(control)?;
        let key_id = self.backend.generate_dsa_keypair(p, q, g, &control)?;
        debug!(slot = %self.slot_id, key = %key_id, "generated DSA keypair");
        Ok(key_id)
    }

    pub fn generate_dsa_keypair_by_size(
        &self,
        p_bits: u32,
        q_bits: u32,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.assert_writable()?;
        self.assert_keypair_type(mech::CKK_DSA)?;
        self.assert_mechanism(mech::CKM_DSA_KEY_PAIR_GEN)?;
        let _guard = self.op_lock.lock().unwrap();
        let control = self.prepare_control(control)?;
        let key_id = self
            .backend
            .generate_dsa_keypair_by_size(p_bits, q_bits, &control)?;
        debug!(slot = %self.slot_id, key = %key_id, "generated DSA keypair");
        Ok(key_id)
    }

    pub fn generate_dsa_keypair_otf(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        self.assert_keypair_type(mech::CKK_DSA)?;
        self.assert_mechanism(mech::CKM_DSA_KEY_PAIR_GEN)?;
        self.backend.generate_dsa_keypair_otf(p, q, g)
    }

    pub fn generate_ec_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.assert_writable()?;
        self.assert_keypair_type(mech::CKK_EC)?;
        self.assert_mechanism(mech::CKM_EC_KEY_PAIR_GEN)?;
        let _guard = self.op_lock.lock().unwrap();
        let control = self.prepare_control(control)?;
        let key_id = self.backend.generate_ec_keypair(curve_oid, &control)?;
        debug!(slot = %self.slot_id, key = %key_id, curve = curve_oid, "generated EC keypair");
        Ok(key_id)
    }

    pub fn generate_ec_keypair_otf(&self, curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        self.assert_keypair_type(mech::CKK_EC)?;
        self.assert_mechanism(mech::CKM_EC_KEY_PAIR_GEN)?;
        self.backend.generate_ec_keypair_otf(curve_oid)
    }

    pub fn generate_edwards_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.assert_writable()?;
        self.assert_keypair_type(mech::CKK_EC_EDWARDS)?;
        self.assert_mechanism(mech::CKM_EC_EDWARDS_KEY_PAIR_GEN)?;
        let _guard = self.op_lock.lock().unwrap();
        let control = self.prepare_control(control)?;
        let key_id = self.backend.generate_edwards_keypair(curve_oid, &control)?;
        debug!(slot = %self.slot_id, key = %key_id, curve = curve_oid, "generated Edwards keypair");
        Ok(key_id)
    }

    pub fn generate_edwards_keypair_otf(&self, curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        self.assert_keypair_type(mech::CKK_EC_EDWARDS)?;
        self.assert_mechanism(mech::CKM_EC_EDWARDS_KEY_PAIR_GEN)?;
        self.backend.generate_edwards_keypair_otf(curve_oid)
    }

    pub fn generate_montgomery_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.assert_writable()?;
        self.assert_keypair_type(mech::CKK_EC_MONTGOMERY)?;
        self.assert_mechanism(mech::CKM_EC_MONTGOMERY_KEY_PAIR_GEN)?;
        let _guard = self.op_lock.lock().unwrap();
        let control = self.prepare_control(control)?;
        let key_id = self
            .backend
            .generate_montgomery_keypair(curve_oid, &control)?;
        debug!(slot = %self.slot_id, key = %key_id, curve = curve_oid, "generated Montgomery keypair");
        Ok(key_id)
    }

    pub fn generate_montgomery_keypair_otf(&self, curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        self.assert_keypair_type(mech::CKK_EC_MONTGOMERY)?;
        self.assert_mechanism(mech::CKM_EC_MONTGOMERY_KEY_PAIR_GEN)?;
        self.backend.generate_montgomery_keypair_otf(curve_oid)
    }

    pub fn generate_sm2_keypair(&self, control: &NewKeyControl) -> Result<P11KeyId, TokenError> {
        self.assert_writable()?;
        self.assert_keypair_type(mech::CKK_VENDOR_SM2)?;
        self.assert_mechanism(mech::CKM_VENDOR_SM2_KEY_PAIR_GEN)?;
        let _guard = self.op_lock.lock().unwrap();
        let control = self.prepare_control(control)?;
        let key_id = self.backend.generate_sm2_keypair(&control)?;
        debug!(slot = %self.slot_id, key = %key_id, "generated SM2 keypair");
        Ok(key_id)
    }

    pub fn generate_sm2_keypair_otf(&self) -> Result<Vec<u8>, TokenError> {
        self.assert_keypair_type(mech::CKK_VENDOR_SM2)?;
        self.assert_mechanism(mech::CKM_VENDOR_SM2_KEY_PAIR_GEN)?;
        self.backend.generate_sm2_keypair_otf()
    }

    // ---- use -------------------------------------------------------------

    pub fn sign(
        &self,
        mechanism: u64,
        params: Option<&P11Params>,
        key_handle: u64,
        content: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        self.assert_mechanism(mechanism)?;
        self.backend.sign(mechanism, params, key_handle, content)
    }

    pub fn digest_secret_key(
        &self,
        mechanism: u64,
        key_handle: u64,
    ) -> Result<Vec<u8>, TokenError> {
        self.assert_mechanism(mechanism)?;
        self.backend.digest_secret_key(mechanism, key_handle)
    }

    // ---- destruction -----------------------------------------------------

    pub fn destroy_all_objects(&self) -> Result<u32, TokenError> {
        self.assert_writable()?;
        let _guard = self.op_lock.lock().unwrap();
        let count = self.backend.destroy_all_objects()?;
        self.key_cache.lock().unwrap().clear();
        Ok(count)
    }

    /// Destroys the given objects; returns the handles that could not be
    /// destroyed.
    pub fn destroy_objects_by_handle(&self, handles: &[u64]) -> Result<Vec<u64>, TokenError> {
        self.assert_writable()?;
        let _guard = self.op_lock.lock().unwrap();
        let failed = self.backend.destroy_objects_by_handle(handles)?;
        let mut cache = self.key_cache.lock().unwrap();
        for handle in handles {
            cache.remove(handle);
        }
        Ok(failed)
    }

    pub fn destroy_objects_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<u32, TokenError> {
        if id.is_none() && label.is_none() {
            return Err(TokenError::other("at least one of id and label must be set"));
        }
        self.assert_writable()?;
        let _guard = self.op_lock.lock().unwrap();
        let count = self.backend.destroy_objects_by_id_label(id, label)?;
        self.key_cache.lock().unwrap().clear();
        Ok(count)
    }

    // ---- diagnostics -----------------------------------------------------

    pub fn show_details(
        &self,
        out: &mut dyn io::Write,
        handle: Option<u64>,
        verbose: bool,
    ) -> io::Result<()> {
        self.backend.show_details(out, handle, verbose)
    }

    // ---- policies --------------------------------------------------------

    fn assert_writable(&self) -> Result<(), TokenError> {
        if self.read_only {
            return Err(TokenError::ReadOnly);
        }
        Ok(())
    }

    fn assert_mechanism(&self, mechanism: u64) -> Result<(), TokenError> {
        if self
            .mech_filter
            .is_permitted(&self.module_name, &self.slot_id, mechanism)
        {
            Ok(())
        } else {
            Err(TokenError::UnsupportedMechanism(format!(
                "{} is filtered out for slot {}",
                mech::ckm_display(mechanism),
                self.slot_id
            )))
        }
    }

    fn assert_secret_key_type(&self, key_type: u64) -> Result<(), TokenError> {
        assert_key_type(&self.secret_key_types, key_type, "secret_key_types")
    }

    fn assert_keypair_type(&self, key_type: u64) -> Result<(), TokenError> {
        assert_key_type(&self.key_pair_types, key_type, "key_pair_types")
    }

    /// Fills in a fresh random id when the caller gave none and de-duplicates
    /// the label. Callers hold the op lock, so the checks cannot race with
    /// another creation on this slot.
    fn prepare_control(&self, control: &NewKeyControl) -> Result<NewKeyControl, TokenError> {
        let mut control = control.clone();

        match &control.id {
            Some(id) => {
                if self.backend.object_exists(Some(id.as_slice()), None)? {
                    return Err(TokenError::DuplicateId(hex::encode(id)));
                }
            }
            None => {
                let mut id = vec![0u8; self.new_object_conf.id_length];
                loop {
                    rand::rng().fill_bytes(&mut id);
                    if !self.backend.object_exists(Some(id.as_slice()), None)? {
                        break;
                    }
                }
                control.id = Some(id);
            }
        }

        if !self.new_object_conf.ignore_label
            && !control.label.is_empty()
            && self.backend.object_exists(None, Some(control.label.as_str()))?
        {
            let base = control.label.clone();
            let mut suffix = 1u32;
            loop {
                let candidate = format!("{base}-{suffix}");
                if !self.backend.object_exists(None, Some(candidate.as_str()))? {
                    debug!(slot = %self.slot_id, label = %candidate, "label already taken, uniquified");
                    control.label = candidate;
                    break;
                }
                suffix += 1;
            }
        }

        Ok(control)
    }
}

fn assert_key_type(allowed: &[u64], key_type: u64, list: &str) -> Result<(), TokenError> {
    if allowed.is_empty() || allowed.contains(&key_type) {
        Ok(())
    } else {
        Err(TokenError::other(format!(
            "key type {} is not in the configured {list}",
            mech::ckk_name(key_type).map(str::to_string).unwrap_or_else(|| format!("0x{key_type:X}"))
        )))
    }
}

fn describe_id_label(id: Option<&[u8]>, label: Option<&str>) -> String {
    format!(
        "(id = {}, label = {})",
        id.map(hex::encode).unwrap_or_default(),
        label.unwrap_or_default()
    )
}
