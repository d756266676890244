//! Core data model of the PKCS#11 layer: slot and key identifiers, resolved
//! keys, creation controls and mechanism parameters.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The three object classes this layer manages.
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize, strum_macros::Display,
)]
pub enum ObjectClass {
    #[strum(serialize = "CKO_PRIVATE_KEY")]
    PrivateKey,
    #[strum(serialize = "CKO_PUBLIC_KEY")]
    PublicKey,
    #[strum(serialize = "CKO_SECRET_KEY")]
    SecretKey,
}

/// Identifies one slot within a module, both by enumeration index and by the
/// driver-assigned id.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct P11SlotId {
    pub index: u32,
    pub id: u64,
}

impl P11SlotId {
    pub fn new(index: u32, id: u64) -> Self {
        Self { index, id }
    }
}

impl fmt::Display for P11SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(index = {}, id = {})", self.index, self.id)
    }
}

/// Identifies one key object within a slot.
///
/// Equality follows the token's uniqueness rules: `(class, id, label)` when
/// the id is set, `(class, label)` otherwise. Handles are backend-assigned
/// and excluded on purpose, so the same key looked up through different
/// backends compares equal.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
pub struct P11KeyId {
    pub handle: u64,
    pub object_class: ObjectClass,
    pub key_type: u64,
    pub id: Vec<u8>,
    pub label: String,
    pub public_key_handle: Option<u64>,
}

impl P11KeyId {
    pub fn new(
        handle: u64,
        object_class: ObjectClass,
        key_type: u64,
        id: impl Into<Vec<u8>>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            handle,
            object_class,
            key_type,
            id: id.into(),
            label: label.into(),
            public_key_handle: None,
        }
    }

    pub fn with_public_key_handle(mut self, handle: u64) -> Self {
        self.public_key_handle = Some(handle);
        self
    }

    pub fn hex_id(&self) -> String {
        hex::encode(&self.id)
    }
}

impl PartialEq for P11KeyId {
    fn eq(&self, other: &Self) -> bool {
        if self.object_class != other.object_class {
            return false;
        }
        if self.id.is_empty() && other.id.is_empty() {
            self.label == other.label
        } else {
            self.id == other.id && self.label == other.label
        }
    }
}

impl fmt::Display for P11KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (id = {}, label = {})",
            self.object_class,
            self.hex_id(),
            self.label
        )
    }
}

/// Algorithm parameters attached to a resolved key. All integers are raw
/// big-endian byte strings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum KeyParams {
    Rsa {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
    },
    Dsa {
        p: Vec<u8>,
        q: Vec<u8>,
        g: Vec<u8>,
    },
    Ec {
        curve_oid: String,
    },
}

/// A key resolved from a slot: its identity plus whatever public parameters
/// the backend exposes. Signing goes back through the slot so the private
/// material never leaves the backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct P11Key {
    pub key_id: P11KeyId,
    pub params: Option<KeyParams>,
}

impl P11Key {
    pub fn new(key_id: P11KeyId, params: Option<KeyParams>) -> Self {
        Self { key_id, params }
    }
}

/// Caller's request for the attributes of a to-be-created object. A missing
/// id is filled in by the slot with a fresh random one.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewKeyControl {
    pub id: Option<Vec<u8>>,
    pub label: String,
    pub extractable: Option<bool>,
    pub sensitive: Option<bool>,
}

impl NewKeyControl {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_extractable(mut self, extractable: bool) -> Self {
        self.extractable = Some(extractable);
        self
    }
}

/// Defaults applied when creating objects: length of auto-generated ids and
/// whether the backend ignores labels.
#[derive(Clone, Copy, Debug)]
pub struct NewObjectConf {
    pub id_length: usize,
    pub ignore_label: bool,
}

impl Default for NewObjectConf {
    fn default() -> Self {
        Self {
            id_length: 8,
            ignore_label: false,
        }
    }
}

/// Extra mechanism parameters for parameterized mechanisms. Hash and MGF
/// identifiers are mechanism codes (`CKM_SHA256` names `SHA-256` as both
/// hash and MGF selector, the way drivers key their CK parameter structs).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum P11Params {
    RsaPss(RsaPssParams),
    Oaep(OaepParams),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RsaPssParams {
    pub hash_mech: u64,
    pub mgf_hash_mech: u64,
    pub salt_len: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OaepParams {
    pub hash_mech: u64,
    pub mgf_hash_mech: u64,
}

/// Elliptic curves this layer knows by OID.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EcCurve {
    P256,
    P384,
    Ed25519,
    X25519,
    Sm2,
}

impl EcCurve {
    pub const P256_OID: &'static str = "1.2.840.10045.3.1.7";
    pub const P384_OID: &'static str = "1.3.132.0.34";
    pub const ED25519_OID: &'static str = "1.3.101.112";
    pub const X25519_OID: &'static str = "1.3.101.110";
    pub const SM2_OID: &'static str = "1.2.156.10197.1.301";

    pub fn by_oid(oid: &str) -> Option<Self> {
        match oid {
            Self::P256_OID => Some(EcCurve::P256),
            Self::P384_OID => Some(EcCurve::P384),
            Self::ED25519_OID => Some(EcCurve::Ed25519),
            Self::X25519_OID => Some(EcCurve::X25519),
            Self::SM2_OID => Some(EcCurve::Sm2),
            _ => None,
        }
    }

    pub fn oid(self) -> &'static str {
        match self {
            EcCurve::P256 => Self::P256_OID,
            EcCurve::P384 => Self::P384_OID,
            EcCurve::Ed25519 => Self::ED25519_OID,
            EcCurve::X25519 => Self::X25519_OID,
            EcCurve::Sm2 => Self::SM2_OID,
        }
    }
}

/// 32-bit FNV-1a, the stable hash behind emulator object handles.
pub(crate) fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_equality_prefers_id_when_present() {
        let a = P11KeyId::new(1, ObjectClass::PrivateKey, 0, vec![1, 2], "k1");
        let b = P11KeyId::new(99, ObjectClass::PrivateKey, 0, vec![1, 2], "k1");
        let c = P11KeyId::new(1, ObjectClass::PrivateKey, 0, vec![3, 4], "k1");
        assert_eq!(a, b); // handles differ, identity does not
        assert_ne!(a, c);
    }

    #[test]
    fn key_id_equality_falls_back_to_label() {
        let a = P11KeyId::new(1, ObjectClass::SecretKey, 0, vec![], "aes-1");
        let b = P11KeyId::new(2, ObjectClass::SecretKey, 0, vec![], "aes-1");
        let c = P11KeyId::new(2, ObjectClass::PrivateKey, 0, vec![], "aes-1");
        assert_eq!(a, b);
        assert_ne!(a, c); // class differs
    }

    #[test]
    fn fnv1a32_is_stable() {
        // pinned: handles must not move between releases
        assert_eq!(fnv1a32(b""), 0x811C_9DC5);
        assert_eq!(fnv1a32(b"a"), 0xE40C_292C);
    }
}
