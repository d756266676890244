//! One native slot: a session-pool-backed adapter over the cryptoki
//! wrapper.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use cryptoki::context::Pkcs11;
use cryptoki::error::Error;
use cryptoki::error::RvError;
use cryptoki::mechanism::Mechanism;
use cryptoki::object::Attribute;
use cryptoki::object::AttributeType;
use cryptoki::object::ObjectClass as CkObjectClass;
use cryptoki::object::ObjectHandle;
use cryptoki::session::Session;
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use cryptoki::types::Ulong;
use keyfort_security::Bag;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use zeroize::Zeroizing;

use crate::asn1::oid_der;
use crate::asn1::oid_from_der;
use crate::error::TokenError;
use crate::mech;
use crate::native::convert;
use crate::slot::SlotBackend;
use crate::types::KeyParams;
use crate::types::NewKeyControl;
use crate::types::ObjectClass;
use crate::types::P11Key;
use crate::types::P11KeyId;
use crate::types::P11Params;
use crate::types::P11SlotId;

const DEFAULT_NUM_SESSIONS: usize = 2;
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct NativeP11Slot {
    slot_id: P11SlotId,
    context: Pkcs11,
    slot: Slot,
    max_message_size: usize,
    sessions: Bag<Session>,
    session_timeout: Duration,
    // handles handed out as plain integers; the wrapper's typed handles live here
    handles: Mutex<HashMap<u64, ObjectHandle>>,
}

impl NativeP11Slot {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        context: Pkcs11,
        slot: Slot,
        slot_id: P11SlotId,
        user_type: u64,
        passwords: &[Zeroizing<Vec<u8>>],
        read_only: bool,
        num_sessions: Option<usize>,
        session_timeout: Option<Duration>,
        max_message_size: usize,
    ) -> Result<Self, TokenError> {
        let user_type = convert::user_type(user_type)?;
        let num_sessions = num_sessions.unwrap_or(DEFAULT_NUM_SESSIONS).max(1);

        let mut sessions = Vec::with_capacity(num_sessions);
        for i in 0..num_sessions {
            let session = if read_only {
                context.open_ro_session(slot)?
            } else {
                context.open_rw_session(slot)?
            };
            // one login authenticates every session of this token
            if i == 0 {
                login(&session, user_type, passwords)?;
            }
            sessions.push(session);
        }
        debug!(slot = %slot_id, sessions = num_sessions, "native slot ready");

        Ok(Self {
            slot_id,
            context,
            slot,
            max_message_size,
            sessions: Bag::new(sessions),
            session_timeout: session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT),
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn with_session<R>(
        &self,
        f: impl FnOnce(&Session) -> Result<R, TokenError>,
    ) -> Result<R, TokenError> {
        let session = self
            .sessions
            .borrow(self.session_timeout)
            .ok_or_else(|| TokenError::other("no idle PKCS#11 session"))?;
        let result = f(&session);
        self.sessions.requite(session);
        result
    }

    /// Registers a wrapper handle and returns its numeric form.
    fn remember(&self, handle: ObjectHandle) -> u64 {
        let raw = handle.handle();
        self.handles.lock().unwrap().insert(raw, handle);
        raw
    }

    fn resolve(&self, raw: u64) -> Result<ObjectHandle, TokenError> {
        self.handles
            .lock()
            .unwrap()
            .get(&raw)
            .copied()
            .ok_or_else(|| TokenError::UnknownKey(format!("handle {raw}")))
    }

    fn find_template(
        class: CkObjectClass,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Vec<Attribute> {
        let mut template = vec![Attribute::Token(true), Attribute::Class(class)];
        if let Some(id) = id {
            template.push(Attribute::Id(id.to_vec()));
        }
        if let Some(label) = label {
            template.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        template
    }

    fn find_in_class(
        &self,
        session: &Session,
        class: CkObjectClass,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<Vec<ObjectHandle>, TokenError> {
        Ok(session.find_objects(&Self::find_template(class, id, label))?)
    }

    fn identity_of(
        &self,
        session: &Session,
        class: ObjectClass,
        handle: ObjectHandle,
    ) -> Result<P11KeyId, TokenError> {
        let attributes = session.get_attributes(
            handle,
            &[AttributeType::Id, AttributeType::Label, AttributeType::KeyType],
        )?;
        let mut id = Vec::new();
        let mut label = String::new();
        let mut key_type = mech::CKK_GENERIC_SECRET;
        for attribute in attributes {
            match attribute {
                Attribute::Id(value) => id = value,
                Attribute::Label(value) => label = String::from_utf8_lossy(&value).into_owned(),
                Attribute::KeyType(value) => key_type = convert::key_type_from_ck(value),
                _ => {}
            }
        }
        let mut key_id = P11KeyId::new(self.remember(handle), class, key_type, id, label);
        if class == ObjectClass::PrivateKey && !key_id.id.is_empty() {
            let public = self
                .find_in_class(session, CkObjectClass::PUBLIC_KEY, Some(key_id.id.as_slice()), None)?
                .into_iter()
                .next();
            if let Some(public) = public {
                key_id = key_id.with_public_key_handle(self.remember(public));
            }
        }
        Ok(key_id)
    }

    fn params_of(
        &self,
        session: &Session,
        key_id: &P11KeyId,
    ) -> Result<Option<KeyParams>, TokenError> {
        // parameters live on the public half
        let Some(public_handle) = key_id.public_key_handle else {
            return Ok(None);
        };
        let handle = self.resolve(public_handle)?;
        let attributes = session.get_attributes(
            handle,
            &[
                AttributeType::Modulus,
                AttributeType::PublicExponent,
                AttributeType::EcParams,
            ],
        )?;
        let mut modulus = None;
        let mut public_exponent = None;
        let mut ec_params = None;
        for attribute in attributes {
            match attribute {
                Attribute::Modulus(value) => modulus = Some(value),
                Attribute::PublicExponent(value) => public_exponent = Some(value),
                Attribute::EcParams(value) => ec_params = Some(value),
                _ => {}
            }
        }
        if let (Some(modulus), Some(public_exponent)) = (modulus, public_exponent) {
            return Ok(Some(KeyParams::Rsa {
                modulus,
                public_exponent,
            }));
        }
        if let Some(curve_oid) = ec_params.as_deref().and_then(oid_from_der) {
            return Ok(Some(KeyParams::Ec { curve_oid }));
        }
        Ok(None)
    }

    fn assert_message_size(&self, content: &[u8]) -> Result<(), TokenError> {
        if content.len() > self.max_message_size {
            return Err(TokenError::other(format!(
                "message of {} bytes exceeds maxMessageSize {}",
                content.len(),
                self.max_message_size
            )));
        }
        Ok(())
    }

    fn keypair_templates(
        control: &NewKeyControl,
    ) -> (Vec<Attribute>, Vec<Attribute>) {
        let id = control.id.clone().unwrap_or_default();
        let label = control.label.as_bytes().to_vec();
        let public = vec![
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::Id(id.clone()),
            Attribute::Label(label.clone()),
        ];
        let private = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sign(true),
            Attribute::Sensitive(control.sensitive.unwrap_or(true)),
            Attribute::Extractable(control.extractable.unwrap_or(false)),
            Attribute::Id(id),
            Attribute::Label(label),
        ];
        (public, private)
    }

    fn generate_keypair(
        &self,
        mechanism: &Mechanism<'_>,
        key_type: u64,
        mut public_template: Vec<Attribute>,
        control: &NewKeyControl,
        extra_public: Vec<Attribute>,
    ) -> Result<P11KeyId, TokenError> {
        public_template.extend(extra_public);
        let (_, private_template) = Self::keypair_templates(control);
        self.with_session(|session| {
            let (public, private) = session.generate_key_pair(
                mechanism,
                &public_template,
                &private_template,
            )?;
            let private_raw = self.remember(private);
            let public_raw = self.remember(public);
            trace!(slot = %self.slot_id, private_raw, public_raw, "generated keypair");
            Ok(P11KeyId::new(
                private_raw,
                ObjectClass::PrivateKey,
                key_type,
                control.id.clone().unwrap_or_default(),
                control.label.as_str(),
            )
            .with_public_key_handle(public_raw))
        })
    }

    fn destroy_one(&self, session: &Session, raw: u64) -> Result<(), TokenError> {
        let handle = self.resolve(raw)?;
        session.destroy_object(handle)?;
        self.handles.lock().unwrap().remove(&raw);
        Ok(())
    }
}

fn login(
    session: &Session,
    user_type: cryptoki::session::UserType,
    passwords: &[Zeroizing<Vec<u8>>],
) -> Result<(), TokenError> {
    if passwords.is_empty() {
        return match session.login(user_type, None) {
            Ok(()) | Err(Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => Ok(()),
            Err(err) => Err(err.into()),
        };
    }
    let mut last = None;
    for password in passwords {
        let pin = AuthPin::new(String::from_utf8_lossy(password).into_owned().into());
        match session.login(user_type, Some(&pin)) {
            Ok(()) => return Ok(()),
            Err(Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {
                warn!("user is already logged in, continuing");
                return Ok(());
            }
            Err(err) => last = Some(err),
        }
    }
    Err(last.expect("at least one password was tried").into())
}

impl SlotBackend for NativeP11Slot {
    fn object_exists(&self, id: Option<&[u8]>, label: Option<&str>) -> Result<bool, TokenError> {
        self.with_session(|session| {
            for class in [
                CkObjectClass::PRIVATE_KEY,
                CkObjectClass::SECRET_KEY,
                CkObjectClass::PUBLIC_KEY,
            ] {
                if !self.find_in_class(session, class, id, label)?.is_empty() {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    fn key_id(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<Option<P11KeyId>, TokenError> {
        self.with_session(|session| {
            for (ck_class, class) in [
                (CkObjectClass::PRIVATE_KEY, ObjectClass::PrivateKey),
                (CkObjectClass::SECRET_KEY, ObjectClass::SecretKey),
            ] {
                if let Some(handle) = self
                    .find_in_class(session, ck_class, id, label)?
                    .into_iter()
                    .next()
                {
                    return Ok(Some(self.identity_of(session, class, handle)?));
                }
            }
            Ok(None)
        })
    }

    fn key(&self, key_id: &P11KeyId) -> Result<Option<P11Key>, TokenError> {
        let id = (!key_id.id.is_empty()).then_some(key_id.id.as_slice());
        let label = (!key_id.label.is_empty()).then_some(key_id.label.as_str());
        if id.is_none() && label.is_none() {
            return Ok(None);
        }
        let Some(canonical) = self.key_id(id, label)? else {
            return Ok(None);
        };
        let params = self.with_session(|session| self.params_of(session, &canonical))?;
        Ok(Some(P11Key::new(canonical, params)))
    }

    fn mechanisms(&self) -> Result<Vec<u64>, TokenError> {
        let available = self.context.get_mechanism_list(self.slot)?;
        Ok(convert::advertised_codes(&available))
    }

    fn generate_secret_key(
        &self,
        key_type: u64,
        key_len_bits: Option<u32>,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let mechanism = if key_type == mech::CKK_AES {
            Mechanism::AesKeyGen
        } else {
            Mechanism::GenericSecretKeyGen
        };
        let bits = key_len_bits
            .ok_or_else(|| TokenError::other("secret key generation requires a key length"))?;
        let mut template = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sign(true),
            Attribute::Sensitive(control.sensitive.unwrap_or(true)),
            Attribute::Extractable(control.extractable.unwrap_or(false)),
            Attribute::ValueLen(Ulong::from(u64::from(bits) / 8)),
            Attribute::Label(control.label.as_bytes().to_vec()),
        ];
        if let Some(id) = &control.id {
            template.push(Attribute::Id(id.clone()));
        }
        self.with_session(|session| {
            let handle = session.generate_key(&mechanism, &template)?;
            Ok(P11KeyId::new(
                self.remember(handle),
                ObjectClass::SecretKey,
                key_type,
                control.id.clone().unwrap_or_default(),
                control.label.as_str(),
            ))
        })
    }

    fn import_secret_key(
        &self,
        key_type: u64,
        value: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let ck_key_type = convert::key_type_to_ck(key_type)?;
        let mut template = vec![
            Attribute::Class(CkObjectClass::SECRET_KEY),
            Attribute::KeyType(ck_key_type),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sign(true),
            Attribute::Sensitive(control.sensitive.unwrap_or(true)),
            Attribute::Extractable(control.extractable.unwrap_or(false)),
            Attribute::Value(value.to_vec()),
            Attribute::Label(control.label.as_bytes().to_vec()),
        ];
        if let Some(id) = &control.id {
            template.push(Attribute::Id(id.clone()));
        }
        self.with_session(|session| {
            let handle = session.create_object(&template)?;
            Ok(P11KeyId::new(
                self.remember(handle),
                ObjectClass::SecretKey,
                key_type,
                control.id.clone().unwrap_or_default(),
                control.label.as_str(),
            ))
        })
    }

    fn generate_rsa_keypair(
        &self,
        keysize: u32,
        public_exponent: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let exponent = if public_exponent.is_empty() {
            vec![0x01, 0x00, 0x01]
        } else {
            public_exponent.to_vec()
        };
        let (public_template, _) = Self::keypair_templates(control);
        self.generate_keypair(
            &Mechanism::RsaPkcsKeyPairGen,
            mech::CKK_RSA,
            public_template,
            control,
            vec![
                Attribute::ModulusBits(Ulong::from(u64::from(keysize))),
                Attribute::PublicExponent(exponent),
            ],
        )
    }

    fn generate_rsa_keypair_otf(
        &self,
        keysize: u32,
        public_exponent: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        use pkcs8::EncodePrivateKey;
        use rsa::BigUint;

        let exponent = if public_exponent.is_empty() {
            vec![0x01, 0x00, 0x01]
        } else {
            public_exponent.to_vec()
        };
        let public_template = vec![
            Attribute::Token(false),
            Attribute::ModulusBits(Ulong::from(u64::from(keysize))),
            Attribute::PublicExponent(exponent),
        ];
        let private_template = vec![
            Attribute::Token(false),
            Attribute::Sensitive(false),
            Attribute::Extractable(true),
        ];
        self.with_session(|session| {
            let (public, private) = session.generate_key_pair(
                &Mechanism::RsaPkcsKeyPairGen,
                &public_template,
                &private_template,
            )?;
            let attributes = session.get_attributes(
                private,
                &[
                    AttributeType::Modulus,
                    AttributeType::PublicExponent,
                    AttributeType::PrivateExponent,
                ],
            )?;
            let _ = session.destroy_object(private);
            let _ = session.destroy_object(public);

            let mut n = None;
            let mut e = None;
            let mut d = None;
            for attribute in attributes {
                match attribute {
                    Attribute::Modulus(value) => n = Some(BigUint::from_bytes_be(&value)),
                    Attribute::PublicExponent(value) => e = Some(BigUint::from_bytes_be(&value)),
                    Attribute::PrivateExponent(value) => d = Some(BigUint::from_bytes_be(&value)),
                    _ => {}
                }
            }
            let (Some(n), Some(e), Some(d)) = (n, e, d) else {
                return Err(TokenError::other(
                    "driver did not export the session keypair components",
                ));
            };
            let key = rsa::RsaPrivateKey::from_components(n, e, d, Vec::new())
                .map_err(|err| TokenError::other(format!("cannot assemble RSA key: {err}")))?;
            let document = key
                .to_pkcs8_der()
                .map_err(|err| TokenError::other(format!("cannot encode RSA key: {err}")))?;
            Ok(document.as_bytes().to_vec())
        })
    }

    fn generate_dsa_keypair(
        &self,
        _p: &[u8],
        _q: &[u8],
        _g: &[u8],
        _control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        Err(TokenError::Unsupported(
            "the PKCS#11 wrapper exposes no DSA mechanisms",
        ))
    }

    fn generate_dsa_keypair_by_size(
        &self,
        _p_bits: u32,
        _q_bits: u32,
        _control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        Err(TokenError::Unsupported(
            "the PKCS#11 wrapper exposes no DSA mechanisms",
        ))
    }

    fn generate_dsa_keypair_otf(
        &self,
        _p: &[u8],
        _q: &[u8],
        _g: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        Err(TokenError::Unsupported(
            "the PKCS#11 wrapper exposes no DSA mechanisms",
        ))
    }

    fn generate_ec_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let (public_template, _) = Self::keypair_templates(control);
        self.generate_keypair(
            &Mechanism::EccKeyPairGen,
            mech::CKK_EC,
            public_template,
            control,
            vec![Attribute::EcParams(oid_der(curve_oid)?)],
        )
    }

    fn generate_ec_keypair_otf(&self, _curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        Err(TokenError::Unsupported(
            "EC private keys cannot be exported through the PKCS#11 wrapper",
        ))
    }

    fn generate_edwards_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let (public_template, _) = Self::keypair_templates(control);
        self.generate_keypair(
            &Mechanism::EccEdwardsKeyPairGen,
            mech::CKK_EC_EDWARDS,
            public_template,
            control,
            vec![Attribute::EcParams(oid_der(curve_oid)?)],
        )
    }

    fn generate_edwards_keypair_otf(&self, _curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        Err(TokenError::Unsupported(
            "Edwards private keys cannot be exported through the PKCS#11 wrapper",
        ))
    }

    fn generate_montgomery_keypair(
        &self,
        _curve_oid: &str,
        _control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        Err(TokenError::Unsupported(
            "the PKCS#11 wrapper exposes no Montgomery key generation",
        ))
    }

    fn generate_montgomery_keypair_otf(&self, _curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        Err(TokenError::Unsupported(
            "the PKCS#11 wrapper exposes no Montgomery key generation",
        ))
    }

    fn generate_sm2_keypair(&self, _control: &NewKeyControl) -> Result<P11KeyId, TokenError> {
        Err(TokenError::Unsupported(
            "the PKCS#11 wrapper exposes no SM2 mechanisms",
        ))
    }

    fn generate_sm2_keypair_otf(&self) -> Result<Vec<u8>, TokenError> {
        Err(TokenError::Unsupported(
            "the PKCS#11 wrapper exposes no SM2 mechanisms",
        ))
    }

    fn sign(
        &self,
        mechanism: u64,
        params: Option<&P11Params>,
        key_handle: u64,
        content: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        self.assert_message_size(content)?;
        let wrapper_mechanism = convert::sign_mechanism(mechanism, params)?;
        let handle = self.resolve(key_handle)?;
        self.with_session(|session| Ok(session.sign(&wrapper_mechanism, handle, content)?))
    }

    fn digest_secret_key(&self, mechanism: u64, key_handle: u64) -> Result<Vec<u8>, TokenError> {
        let wrapper_mechanism = convert::digest_mechanism(mechanism)?;
        let handle = self.resolve(key_handle)?;
        self.with_session(|session| {
            let attributes = session.get_attributes(handle, &[AttributeType::Value])?;
            let value = attributes
                .into_iter()
                .find_map(|attribute| match attribute {
                    Attribute::Value(value) => Some(Zeroizing::new(value)),
                    _ => None,
                })
                .ok_or_else(|| {
                    TokenError::other("secret value is sensitive and cannot be digested")
                })?;
            Ok(session.digest(&wrapper_mechanism, &value)?)
        })
    }

    fn destroy_all_objects(&self) -> Result<u32, TokenError> {
        self.with_session(|session| {
            let objects = session.find_objects(&[Attribute::Token(true)])?;
            let mut count = 0u32;
            for object in objects {
                match session.destroy_object(object) {
                    Ok(()) => count += 1,
                    Err(err) => warn!(slot = %self.slot_id, %err, "could not destroy object"),
                }
            }
            self.handles.lock().unwrap().clear();
            Ok(count)
        })
    }

    fn destroy_objects_by_handle(&self, handles: &[u64]) -> Result<Vec<u64>, TokenError> {
        self.with_session(|session| {
            let mut failed = Vec::new();
            for raw in handles {
                if let Err(err) = self.destroy_one(session, *raw) {
                    warn!(slot = %self.slot_id, handle = raw, %err, "could not destroy object");
                    failed.push(*raw);
                }
            }
            Ok(failed)
        })
    }

    fn destroy_objects_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<u32, TokenError> {
        self.with_session(|session| {
            let mut count = 0u32;
            for class in [
                CkObjectClass::PRIVATE_KEY,
                CkObjectClass::PUBLIC_KEY,
                CkObjectClass::SECRET_KEY,
            ] {
                for object in self.find_in_class(session, class, id, label)? {
                    match session.destroy_object(object) {
                        Ok(()) => count += 1,
                        Err(err) => {
                            warn!(slot = %self.slot_id, %err, "could not destroy object")
                        }
                    }
                }
            }
            Ok(count)
        })
    }

    fn show_details(
        &self,
        out: &mut dyn io::Write,
        handle: Option<u64>,
        verbose: bool,
    ) -> io::Result<()> {
        writeln!(out, "Native slot {}", self.slot_id)?;
        if verbose {
            let mechanisms = self.mechanisms().map_err(io::Error::other)?;
            writeln!(out, "Supported mechanisms:")?;
            for mechanism in mechanisms {
                writeln!(out, "  {}", mech::ckm_display(mechanism))?;
            }
        }
        let details = self
            .with_session(|session| {
                let mut lines = Vec::new();
                for (ck_class, class) in [
                    (CkObjectClass::PRIVATE_KEY, ObjectClass::PrivateKey),
                    (CkObjectClass::PUBLIC_KEY, ObjectClass::PublicKey),
                    (CkObjectClass::SECRET_KEY, ObjectClass::SecretKey),
                ] {
                    for object in self.find_in_class(session, ck_class, None, None)? {
                        let key_id = self.identity_of(session, class, object)?;
                        if let Some(wanted) = handle {
                            if key_id.handle != wanted {
                                continue;
                            }
                        }
                        lines.push(format!("  {class} handle={} {key_id}", key_id.handle));
                    }
                }
                Ok(lines)
            })
            .map_err(io::Error::other)?;
        for line in details {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }
}
