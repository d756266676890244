//! One emulator slot: a directory of wrapped key files implementing the
//! backend contract.

use std::io;

use camino::Utf8PathBuf;
use keyfort_security::hash;
use keyfort_security::HashAlgo;
use rand::RngCore;
use tracing::trace;

use crate::emulator::cryptor::KeyCryptor;
use crate::emulator::keys;
use crate::emulator::keys::GeneratedKeypair;
use crate::emulator::store;
use crate::emulator::store::Properties;
use crate::error::TokenError;
use crate::mech;
use crate::slot::SlotBackend;
use crate::types::fnv1a32;
use crate::types::KeyParams;
use crate::types::NewKeyControl;
use crate::types::ObjectClass;
use crate::types::P11Key;
use crate::types::P11KeyId;
use crate::types::P11Params;
use crate::types::P11SlotId;

/// Everything the emulator can drive in software.
const MECHANISMS: &[u64] = &[
    mech::CKM_RSA_PKCS_KEY_PAIR_GEN,
    mech::CKM_RSA_PKCS,
    mech::CKM_SHA1_RSA_PKCS,
    mech::CKM_SHA256_RSA_PKCS,
    mech::CKM_SHA384_RSA_PKCS,
    mech::CKM_SHA512_RSA_PKCS,
    mech::CKM_RSA_PKCS_PSS,
    mech::CKM_SHA1_RSA_PKCS_PSS,
    mech::CKM_SHA256_RSA_PKCS_PSS,
    mech::CKM_SHA384_RSA_PKCS_PSS,
    mech::CKM_SHA512_RSA_PKCS_PSS,
    mech::CKM_DSA_KEY_PAIR_GEN,
    mech::CKM_DSA_SHA1,
    mech::CKM_DSA_SHA256,
    mech::CKM_EC_KEY_PAIR_GEN,
    mech::CKM_ECDSA,
    mech::CKM_ECDSA_SHA1,
    mech::CKM_ECDSA_SHA256,
    mech::CKM_ECDSA_SHA384,
    mech::CKM_ECDSA_SHA512,
    mech::CKM_EC_EDWARDS_KEY_PAIR_GEN,
    mech::CKM_EDDSA,
    mech::CKM_EC_MONTGOMERY_KEY_PAIR_GEN,
    mech::CKM_VENDOR_SM2_KEY_PAIR_GEN,
    mech::CKM_VENDOR_SM2,
    mech::CKM_AES_KEY_GEN,
    mech::CKM_GENERIC_SECRET_KEY_GEN,
    mech::CKM_SHA_1_HMAC,
    mech::CKM_SHA256_HMAC,
    mech::CKM_SHA384_HMAC,
    mech::CKM_SHA512_HMAC,
    mech::CKM_SHA_1,
    mech::CKM_SHA256,
    mech::CKM_SHA384,
    mech::CKM_SHA512,
];

struct StoredObject {
    object_dir: &'static str,
    hex_id: String,
    props: Properties,
}

impl StoredObject {
    /// Deterministic handle: `fnv1a32(id) << 8`, +1 for the public sibling.
    /// Stable across restarts, which is what keeps re-opened modules seeing
    /// the same handles.
    fn handle(&self) -> Option<u64> {
        let id = hex::decode(&self.hex_id).ok()?;
        let base = u64::from(fnv1a32(&id)) << 8;
        Some(match self.object_dir {
            store::DIR_PUBKEY => base + 1,
            _ => base,
        })
    }

    fn object_class(&self) -> ObjectClass {
        match self.object_dir {
            store::DIR_PUBKEY => ObjectClass::PublicKey,
            store::DIR_SECKEY => ObjectClass::SecretKey,
            _ => ObjectClass::PrivateKey,
        }
    }

    fn key_type(&self) -> u64 {
        self.props
            .get(store::PROP_KEYTYPE)
            .and_then(|name| mech::ckk_code(name).or_else(|| mech::parse_code(name)))
            .unwrap_or(mech::CKK_GENERIC_SECRET)
    }
}

pub(crate) struct EmulatorP11Slot {
    slot_id: P11SlotId,
    dir: Utf8PathBuf,
    cryptor: KeyCryptor,
    named_curve_supported: bool,
}

impl EmulatorP11Slot {
    pub fn new(slot_id: P11SlotId, dir: Utf8PathBuf, password: &[u8]) -> Result<Self, TokenError> {
        for object_dir in [store::DIR_PRIVKEY, store::DIR_PUBKEY, store::DIR_SECKEY] {
            std::fs::create_dir_all(dir.join(object_dir).as_std_path())?;
        }
        let named_curve_supported = match store::read_properties(&dir.join(store::FILE_SLOT_INFO)) {
            Ok(props) => props
                .get(store::PROP_NAMED_CURVE_SUPPORTED)
                .map(|v| v != "false")
                .unwrap_or(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            slot_id,
            dir,
            cryptor: KeyCryptor::new(password)?,
            named_curve_supported,
        })
    }

    fn list_objects(&self, object_dir: &'static str) -> io::Result<Vec<StoredObject>> {
        let mut objects = Vec::new();
        for hex_id in store::list_hex_ids(&self.dir, object_dir)? {
            let path = store::object_path(&self.dir, object_dir, &hex_id, store::SUFFIX_INFO);
            let props = store::read_properties(&path)?;
            objects.push(StoredObject {
                object_dir,
                hex_id,
                props,
            });
        }
        Ok(objects)
    }

    fn matches(object: &StoredObject, id: Option<&[u8]>, label: Option<&str>) -> bool {
        if let Some(id) = id {
            if object.hex_id != hex::encode(id) {
                return false;
            }
        }
        if let Some(label) = label {
            if object.props.get(store::PROP_LABEL) != Some(label) {
                return false;
            }
        }
        true
    }

    fn find_object(
        &self,
        dirs: &[&'static str],
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<Option<StoredObject>, TokenError> {
        for object_dir in dirs {
            for object in self.list_objects(object_dir)? {
                if Self::matches(&object, id, label) {
                    return Ok(Some(object));
                }
            }
        }
        Ok(None)
    }

    fn object_by_handle(&self, handle: u64) -> Result<StoredObject, TokenError> {
        for object_dir in [store::DIR_PRIVKEY, store::DIR_SECKEY, store::DIR_PUBKEY] {
            for object in self.list_objects(object_dir)? {
                if object.handle() == Some(handle) {
                    return Ok(object);
                }
            }
        }
        Err(TokenError::UnknownKey(format!("handle {handle}")))
    }

    fn key_id_of(&self, object: &StoredObject) -> Result<P11KeyId, TokenError> {
        let id = hex::decode(&object.hex_id)
            .map_err(|_| TokenError::other(format!("malformed object file name {}", object.hex_id)))?;
        let handle = u64::from(fnv1a32(&id)) << 8;
        let label = object.props.get(store::PROP_LABEL).unwrap_or("").to_string();
        let mut key_id = P11KeyId::new(handle, object.object_class(), object.key_type(), id, label);
        if object.object_dir == store::DIR_PRIVKEY {
            let twin = store::object_path(&self.dir, store::DIR_PUBKEY, &object.hex_id, store::SUFFIX_INFO);
            if twin.as_std_path().is_file() {
                key_id = key_id.with_public_key_handle(handle + 1);
            }
        }
        Ok(key_id)
    }

    fn read_sealed_value(&self, object: &StoredObject) -> Result<Vec<u8>, TokenError> {
        let path =
            store::object_path(&self.dir, object.object_dir, &object.hex_id, store::SUFFIX_VALUE);
        Ok(std::fs::read(path.as_std_path())?)
    }

    fn store_keypair(
        &self,
        pair: GeneratedKeypair,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let id = control
            .id
            .as_deref()
            .ok_or_else(|| TokenError::other("creation control carries no id"))?;
        let hex_id = hex::encode(id);
        let key_type_name = mech::ckk_name(pair.key_type)
            .map(str::to_string)
            .unwrap_or_else(|| format!("0x{:X}", pair.key_type));

        let sealed = self.cryptor.encrypt(&pair.private_key_info)?;
        let integrity = hash(HashAlgo::Sha1, &[&sealed])
            .map_err(|err| TokenError::other(format!("integrity digest failed: {err}")))?;

        let mut private_props = Properties::new();
        private_props.set(store::PROP_ID, &hex_id);
        private_props.set(store::PROP_LABEL, control.label.as_str());
        private_props.set(store::PROP_KEYTYPE, &key_type_name);
        private_props.set(store::PROP_ALGO, &pair.algo_oid);
        private_props.set(store::PROP_KEYSPEC, &pair.keyspec);
        private_props.set_hex(store::PROP_SHA1, &integrity);

        let mut public_props = Properties::new();
        public_props.set(store::PROP_ID, &hex_id);
        public_props.set(store::PROP_LABEL, control.label.as_str());
        public_props.set(store::PROP_KEYTYPE, &key_type_name);
        public_props.set(store::PROP_ALGO, &pair.algo_oid);
        public_props.set(store::PROP_KEYSPEC, &pair.keyspec);
        for (key, value) in pair.public_props.iter() {
            public_props.set(key, value);
        }

        store::write_file(
            &store::object_path(&self.dir, store::DIR_PRIVKEY, &hex_id, store::SUFFIX_VALUE),
            &sealed,
        )?;
        store::write_file(
            &store::object_path(&self.dir, store::DIR_PRIVKEY, &hex_id, store::SUFFIX_INFO),
            private_props.render().as_bytes(),
        )?;
        store::write_file(
            &store::object_path(&self.dir, store::DIR_PUBKEY, &hex_id, store::SUFFIX_INFO),
            public_props.render().as_bytes(),
        )?;

        let handle = u64::from(fnv1a32(id)) << 8;
        trace!(slot = %self.slot_id, id = %hex_id, handle, "stored keypair");
        Ok(
            P11KeyId::new(handle, ObjectClass::PrivateKey, pair.key_type, id, control.label.as_str())
                .with_public_key_handle(handle + 1),
        )
    }

    fn store_secret(
        &self,
        key_type: u64,
        value: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let id = control
            .id
            .as_deref()
            .ok_or_else(|| TokenError::other("creation control carries no id"))?;
        let hex_id = hex::encode(id);
        let key_type_name = mech::ckk_name(key_type)
            .map(str::to_string)
            .unwrap_or_else(|| format!("0x{key_type:X}"));

        let sealed = self.cryptor.encrypt(value)?;
        let integrity = hash(HashAlgo::Sha1, &[&sealed])
            .map_err(|err| TokenError::other(format!("integrity digest failed: {err}")))?;

        let mut props = Properties::new();
        props.set(store::PROP_ID, &hex_id);
        props.set(store::PROP_LABEL, control.label.as_str());
        props.set(store::PROP_KEYTYPE, &key_type_name);
        props.set(store::PROP_KEYSPEC, format!("{}", value.len() * 8));
        props.set_hex(store::PROP_SHA1, &integrity);

        store::write_file(
            &store::object_path(&self.dir, store::DIR_SECKEY, &hex_id, store::SUFFIX_VALUE),
            &sealed,
        )?;
        store::write_file(
            &store::object_path(&self.dir, store::DIR_SECKEY, &hex_id, store::SUFFIX_INFO),
            props.render().as_bytes(),
        )?;

        let handle = u64::from(fnv1a32(id)) << 8;
        trace!(slot = %self.slot_id, id = %hex_id, handle, "stored secret key");
        Ok(P11KeyId::new(handle, ObjectClass::SecretKey, key_type, id, control.label.as_str()))
    }

    fn params_of_public(&self, props: &Properties) -> Option<KeyParams> {
        if let Some(modulus) = props.get_hex(store::PROP_MODULUS) {
            return Some(KeyParams::Rsa {
                modulus,
                public_exponent: props.get_hex(store::PROP_PUBLIC_EXPONENT)?,
            });
        }
        if let Some(p) = props.get_hex(store::PROP_PRIME) {
            return Some(KeyParams::Dsa {
                p,
                q: props.get_hex(store::PROP_SUBPRIME)?,
                g: props.get_hex(store::PROP_BASE)?,
            });
        }
        if props.get(store::PROP_EC_PARAMS).is_some() {
            let keyspec = props.get(store::PROP_KEYSPEC)?;
            let curve_oid = match keyspec.split_once('/') {
                Some((_, oid)) => oid.to_string(),
                // ED25519 / X25519 carry the curve as the algorithm oid
                None => props.get(store::PROP_ALGO)?.to_string(),
            };
            return Some(KeyParams::Ec { curve_oid });
        }
        None
    }

    fn remove_object(&self, object: &StoredObject) -> io::Result<()> {
        for suffix in [store::SUFFIX_INFO, store::SUFFIX_VALUE] {
            let path = store::object_path(&self.dir, object.object_dir, &object.hex_id, suffix);
            match std::fs::remove_file(path.as_std_path()) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl SlotBackend for EmulatorP11Slot {
    fn object_exists(&self, id: Option<&[u8]>, label: Option<&str>) -> Result<bool, TokenError> {
        let dirs = [store::DIR_PRIVKEY, store::DIR_SECKEY, store::DIR_PUBKEY];
        Ok(self.find_object(&dirs, id, label)?.is_some())
    }

    fn key_id(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<Option<P11KeyId>, TokenError> {
        let dirs = [store::DIR_PRIVKEY, store::DIR_SECKEY];
        match self.find_object(&dirs, id, label)? {
            Some(object) => Ok(Some(self.key_id_of(&object)?)),
            None => Ok(None),
        }
    }

    fn key(&self, key_id: &P11KeyId) -> Result<Option<P11Key>, TokenError> {
        let dirs = [store::DIR_PRIVKEY, store::DIR_SECKEY];
        let id = (!key_id.id.is_empty()).then_some(key_id.id.as_slice());
        let label = (!key_id.label.is_empty()).then_some(key_id.label.as_str());
        if id.is_none() && label.is_none() {
            return Ok(None);
        }
        let Some(object) = self.find_object(&dirs, id, label)? else {
            return Ok(None);
        };
        let canonical = self.key_id_of(&object)?;
        let params = if object.object_dir == store::DIR_PRIVKEY {
            let twin = store::object_path(&self.dir, store::DIR_PUBKEY, &object.hex_id, store::SUFFIX_INFO);
            match store::read_properties(&twin) {
                Ok(props) => self.params_of_public(&props),
                Err(err) if err.kind() == io::ErrorKind::NotFound => None,
                Err(err) => return Err(err.into()),
            }
        } else {
            None
        };
        Ok(Some(P11Key::new(canonical, params)))
    }

    fn mechanisms(&self) -> Result<Vec<u64>, TokenError> {
        Ok(MECHANISMS.to_vec())
    }

    fn generate_secret_key(
        &self,
        key_type: u64,
        key_len_bits: Option<u32>,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let bits = key_len_bits
            .ok_or_else(|| TokenError::other("secret key generation requires a key length"))?;
        if key_type == mech::CKK_AES && !matches!(bits, 128 | 192 | 256) {
            return Err(TokenError::other(format!("invalid AES key length {bits}")));
        }
        if bits == 0 || bits % 8 != 0 {
            return Err(TokenError::other(format!("invalid key length {bits}")));
        }
        let mut value = zeroize::Zeroizing::new(vec![0u8; bits as usize / 8]);
        rand::rng().fill_bytes(&mut value);
        self.store_secret(key_type, &value, control)
    }

    fn import_secret_key(
        &self,
        key_type: u64,
        value: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.store_secret(key_type, value, control)
    }

    fn generate_rsa_keypair(
        &self,
        keysize: u32,
        public_exponent: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.store_keypair(keys::generate_rsa(keysize, public_exponent)?, control)
    }

    fn generate_rsa_keypair_otf(
        &self,
        keysize: u32,
        public_exponent: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        Ok(keys::generate_rsa(keysize, public_exponent)?
            .private_key_info
            .to_vec())
    }

    fn generate_dsa_keypair(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.store_keypair(keys::generate_dsa(p, q, g)?, control)
    }

    fn generate_dsa_keypair_by_size(
        &self,
        p_bits: u32,
        q_bits: u32,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.store_keypair(keys::generate_dsa_by_size(p_bits, q_bits)?, control)
    }

    fn generate_dsa_keypair_otf(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        Ok(keys::generate_dsa(p, q, g)?.private_key_info.to_vec())
    }

    fn generate_ec_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.store_keypair(
            keys::generate_ec(curve_oid, self.named_curve_supported)?,
            control,
        )
    }

    fn generate_ec_keypair_otf(&self, curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        Ok(keys::generate_ec(curve_oid, self.named_curve_supported)?
            .private_key_info
            .to_vec())
    }

    fn generate_edwards_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.store_keypair(keys::generate_edwards(curve_oid)?, control)
    }

    fn generate_edwards_keypair_otf(&self, curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        Ok(keys::generate_edwards(curve_oid)?.private_key_info.to_vec())
    }

    fn generate_montgomery_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        self.store_keypair(keys::generate_montgomery(curve_oid)?, control)
    }

    fn generate_montgomery_keypair_otf(&self, curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        Ok(keys::generate_montgomery(curve_oid)?.private_key_info.to_vec())
    }

    fn generate_sm2_keypair(&self, control: &NewKeyControl) -> Result<P11KeyId, TokenError> {
        self.store_keypair(keys::generate_sm2()?, control)
    }

    fn generate_sm2_keypair_otf(&self) -> Result<Vec<u8>, TokenError> {
        Ok(keys::generate_sm2()?.private_key_info.to_vec())
    }

    fn sign(
        &self,
        mechanism: u64,
        params: Option<&P11Params>,
        key_handle: u64,
        content: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        let object = self.object_by_handle(key_handle)?;
        let sealed = self.read_sealed_value(&object)?;
        let value = self.cryptor.decrypt(&sealed)?;
        match object.object_dir {
            store::DIR_PRIVKEY => keys::sign_with_private_key(
                object.key_type(),
                &value,
                object.props.get(store::PROP_KEYSPEC).unwrap_or(""),
                mechanism,
                params,
                content,
            ),
            store::DIR_SECKEY => keys::sign_hmac(&value, mechanism, content),
            _ => Err(TokenError::other("public keys cannot sign")),
        }
    }

    fn digest_secret_key(&self, mechanism: u64, key_handle: u64) -> Result<Vec<u8>, TokenError> {
        let algo = match mechanism {
            mech::CKM_SHA_1 => HashAlgo::Sha1,
            mech::CKM_SHA256 => HashAlgo::Sha256,
            mech::CKM_SHA384 => HashAlgo::Sha384,
            mech::CKM_SHA512 => HashAlgo::Sha512,
            _ => {
                return Err(TokenError::UnsupportedMechanism(format!(
                    "{} is not a digest mechanism",
                    mech::ckm_display(mechanism)
                )))
            }
        };
        let object = self.object_by_handle(key_handle)?;
        if object.object_dir != store::DIR_SECKEY {
            return Err(TokenError::other("digestSecretKey requires a secret key"));
        }
        let sealed = self.read_sealed_value(&object)?;
        let value = self.cryptor.decrypt(&sealed)?;
        hash(algo, &[&value]).map_err(|err| TokenError::other(err.to_string()))
    }

    fn destroy_all_objects(&self) -> Result<u32, TokenError> {
        Err(TokenError::Unsupported(
            "destroyAllObjects is not supported by the emulator",
        ))
    }

    fn destroy_objects_by_handle(&self, _handles: &[u64]) -> Result<Vec<u64>, TokenError> {
        Err(TokenError::Unsupported(
            "destroyObjectsByHandle is not supported by the emulator",
        ))
    }

    fn destroy_objects_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<u32, TokenError> {
        let mut count = 0u32;
        for object_dir in [store::DIR_PRIVKEY, store::DIR_PUBKEY, store::DIR_SECKEY] {
            for object in self.list_objects(object_dir)? {
                if Self::matches(&object, id, label) {
                    self.remove_object(&object)?;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn show_details(
        &self,
        out: &mut dyn io::Write,
        handle: Option<u64>,
        verbose: bool,
    ) -> io::Result<()> {
        writeln!(out, "Emulator slot {}", self.slot_id)?;
        if verbose {
            writeln!(out, "Supported mechanisms:")?;
            for mechanism in MECHANISMS {
                writeln!(out, "  {}", mech::ckm_display(*mechanism))?;
            }
        }
        for (object_dir, title) in [
            (store::DIR_PRIVKEY, "Private keys"),
            (store::DIR_PUBKEY, "Public keys"),
            (store::DIR_SECKEY, "Secret keys"),
        ] {
            let objects = self.list_objects(object_dir)?;
            if objects.is_empty() {
                continue;
            }
            writeln!(out, "{title}:")?;
            for object in objects {
                let object_handle = object.handle().unwrap_or(0);
                if let Some(wanted) = handle {
                    if object_handle != wanted {
                        continue;
                    }
                }
                write!(
                    out,
                    "  handle={object_handle} id={} label={}",
                    object.hex_id,
                    object.props.get(store::PROP_LABEL).unwrap_or("-"),
                )?;
                for prop in [store::PROP_KEYTYPE, store::PROP_KEYSPEC, store::PROP_ALGO] {
                    if let Some(value) = object.props.get(prop) {
                        write!(out, " {prop}={value}")?;
                    }
                }
                if let Some(modulus) = object.props.get_hex(store::PROP_MODULUS) {
                    write!(out, " modulusBits={}", modulus.len() * 8)?;
                }
                writeln!(out)?;
            }
        }
        Ok(())
    }
}
