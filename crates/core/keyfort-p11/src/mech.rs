//! PKCS#11 constant tables: mechanism (`CKM_*`), key-type (`CKK_*`) and
//! user-type (`CKU_*`) codes, with name lookup in both directions.
//!
//! Only the codes this layer can actually drive are listed; vendor-defined
//! codes live above [`CKM_VENDOR_DEFINED`].

use keyfort_security::HashAlgo;

pub const CKM_RSA_PKCS_KEY_PAIR_GEN: u64 = 0x0000;
pub const CKM_RSA_PKCS: u64 = 0x0001;
pub const CKM_RSA_X_509: u64 = 0x0003;
pub const CKM_SHA1_RSA_PKCS: u64 = 0x0006;
pub const CKM_RSA_PKCS_OAEP: u64 = 0x0009;
pub const CKM_RSA_PKCS_PSS: u64 = 0x000D;
pub const CKM_SHA1_RSA_PKCS_PSS: u64 = 0x000E;
pub const CKM_DSA_KEY_PAIR_GEN: u64 = 0x0010;
pub const CKM_DSA: u64 = 0x0011;
pub const CKM_DSA_SHA1: u64 = 0x0012;
pub const CKM_DSA_SHA224: u64 = 0x0013;
pub const CKM_DSA_SHA256: u64 = 0x0014;
pub const CKM_SHA256_RSA_PKCS: u64 = 0x0040;
pub const CKM_SHA384_RSA_PKCS: u64 = 0x0041;
pub const CKM_SHA512_RSA_PKCS: u64 = 0x0042;
pub const CKM_SHA256_RSA_PKCS_PSS: u64 = 0x0043;
pub const CKM_SHA384_RSA_PKCS_PSS: u64 = 0x0044;
pub const CKM_SHA512_RSA_PKCS_PSS: u64 = 0x0045;
pub const CKM_SHA224_RSA_PKCS: u64 = 0x0046;
pub const CKM_SHA224_RSA_PKCS_PSS: u64 = 0x0047;
pub const CKM_SHA_1: u64 = 0x0220;
pub const CKM_SHA_1_HMAC: u64 = 0x0221;
pub const CKM_SHA256: u64 = 0x0250;
pub const CKM_SHA256_HMAC: u64 = 0x0251;
pub const CKM_SHA224: u64 = 0x0255;
pub const CKM_SHA224_HMAC: u64 = 0x0256;
pub const CKM_SHA384: u64 = 0x0260;
pub const CKM_SHA384_HMAC: u64 = 0x0261;
pub const CKM_SHA512: u64 = 0x0270;
pub const CKM_SHA512_HMAC: u64 = 0x0271;
pub const CKM_GENERIC_SECRET_KEY_GEN: u64 = 0x0350;
pub const CKM_EC_KEY_PAIR_GEN: u64 = 0x1040;
pub const CKM_ECDSA: u64 = 0x1041;
pub const CKM_ECDSA_SHA1: u64 = 0x1042;
pub const CKM_ECDSA_SHA224: u64 = 0x1043;
pub const CKM_ECDSA_SHA256: u64 = 0x1044;
pub const CKM_ECDSA_SHA384: u64 = 0x1045;
pub const CKM_ECDSA_SHA512: u64 = 0x1046;
pub const CKM_EC_EDWARDS_KEY_PAIR_GEN: u64 = 0x1055;
pub const CKM_EC_MONTGOMERY_KEY_PAIR_GEN: u64 = 0x1056;
pub const CKM_EDDSA: u64 = 0x1057;
pub const CKM_AES_KEY_GEN: u64 = 0x1080;
pub const CKM_VENDOR_DEFINED: u64 = 0x8000_0000;
pub const CKM_VENDOR_SM2_KEY_PAIR_GEN: u64 = CKM_VENDOR_DEFINED + 0x2001;
pub const CKM_VENDOR_SM2: u64 = CKM_VENDOR_DEFINED + 0x2002;

pub const CKK_RSA: u64 = 0x00;
pub const CKK_DSA: u64 = 0x01;
pub const CKK_EC: u64 = 0x03;
pub const CKK_GENERIC_SECRET: u64 = 0x10;
pub const CKK_AES: u64 = 0x1F;
pub const CKK_SHA_1_HMAC: u64 = 0x28;
pub const CKK_SHA256_HMAC: u64 = 0x2B;
pub const CKK_SHA384_HMAC: u64 = 0x2C;
pub const CKK_SHA512_HMAC: u64 = 0x2D;
pub const CKK_SHA224_HMAC: u64 = 0x2E;
pub const CKK_EC_EDWARDS: u64 = 0x40;
pub const CKK_EC_MONTGOMERY: u64 = 0x41;
pub const CKK_VENDOR_SM2: u64 = CKM_VENDOR_DEFINED + 0x2000;

pub const CKU_SO: u64 = 0;
pub const CKU_USER: u64 = 1;
pub const CKU_CONTEXT_SPECIFIC: u64 = 2;

static CKM_NAMES: &[(&str, u64)] = &[
    ("CKM_RSA_PKCS_KEY_PAIR_GEN", CKM_RSA_PKCS_KEY_PAIR_GEN),
    ("CKM_RSA_PKCS", CKM_RSA_PKCS),
    ("CKM_RSA_X_509", CKM_RSA_X_509),
    ("CKM_SHA1_RSA_PKCS", CKM_SHA1_RSA_PKCS),
    ("CKM_RSA_PKCS_OAEP", CKM_RSA_PKCS_OAEP),
    ("CKM_RSA_PKCS_PSS", CKM_RSA_PKCS_PSS),
    ("CKM_SHA1_RSA_PKCS_PSS", CKM_SHA1_RSA_PKCS_PSS),
    ("CKM_DSA_KEY_PAIR_GEN", CKM_DSA_KEY_PAIR_GEN),
    ("CKM_DSA", CKM_DSA),
    ("CKM_DSA_SHA1", CKM_DSA_SHA1),
    ("CKM_DSA_SHA224", CKM_DSA_SHA224),
    ("CKM_DSA_SHA256", CKM_DSA_SHA256),
    ("CKM_SHA256_RSA_PKCS", CKM_SHA256_RSA_PKCS),
    ("CKM_SHA384_RSA_PKCS", CKM_SHA384_RSA_PKCS),
    ("CKM_SHA512_RSA_PKCS", CKM_SHA512_RSA_PKCS),
    ("CKM_SHA256_RSA_PKCS_PSS", CKM_SHA256_RSA_PKCS_PSS),
    ("CKM_SHA384_RSA_PKCS_PSS", CKM_SHA384_RSA_PKCS_PSS),
    ("CKM_SHA512_RSA_PKCS_PSS", CKM_SHA512_RSA_PKCS_PSS),
    ("CKM_SHA224_RSA_PKCS", CKM_SHA224_RSA_PKCS),
    ("CKM_SHA224_RSA_PKCS_PSS", CKM_SHA224_RSA_PKCS_PSS),
    ("CKM_SHA_1", CKM_SHA_1),
    ("CKM_SHA_1_HMAC", CKM_SHA_1_HMAC),
    ("CKM_SHA256", CKM_SHA256),
    ("CKM_SHA256_HMAC", CKM_SHA256_HMAC),
    ("CKM_SHA224", CKM_SHA224),
    ("CKM_SHA224_HMAC", CKM_SHA224_HMAC),
    ("CKM_SHA384", CKM_SHA384),
    ("CKM_SHA384_HMAC", CKM_SHA384_HMAC),
    ("CKM_SHA512", CKM_SHA512),
    ("CKM_SHA512_HMAC", CKM_SHA512_HMAC),
    ("CKM_GENERIC_SECRET_KEY_GEN", CKM_GENERIC_SECRET_KEY_GEN),
    ("CKM_EC_KEY_PAIR_GEN", CKM_EC_KEY_PAIR_GEN),
    ("CKM_ECDSA", CKM_ECDSA),
    ("CKM_ECDSA_SHA1", CKM_ECDSA_SHA1),
    ("CKM_ECDSA_SHA224", CKM_ECDSA_SHA224),
    ("CKM_ECDSA_SHA256", CKM_ECDSA_SHA256),
    ("CKM_ECDSA_SHA384", CKM_ECDSA_SHA384),
    ("CKM_ECDSA_SHA512", CKM_ECDSA_SHA512),
    ("CKM_EC_EDWARDS_KEY_PAIR_GEN", CKM_EC_EDWARDS_KEY_PAIR_GEN),
    ("CKM_EC_MONTGOMERY_KEY_PAIR_GEN", CKM_EC_MONTGOMERY_KEY_PAIR_GEN),
    ("CKM_EDDSA", CKM_EDDSA),
    ("CKM_AES_KEY_GEN", CKM_AES_KEY_GEN),
    ("CKM_VENDOR_SM2_KEY_PAIR_GEN", CKM_VENDOR_SM2_KEY_PAIR_GEN),
    ("CKM_VENDOR_SM2", CKM_VENDOR_SM2),
];

static CKK_NAMES: &[(&str, u64)] = &[
    ("CKK_RSA", CKK_RSA),
    ("CKK_DSA", CKK_DSA),
    ("CKK_EC", CKK_EC),
    ("CKK_GENERIC_SECRET", CKK_GENERIC_SECRET),
    ("CKK_AES", CKK_AES),
    ("CKK_SHA_1_HMAC", CKK_SHA_1_HMAC),
    ("CKK_SHA256_HMAC", CKK_SHA256_HMAC),
    ("CKK_SHA384_HMAC", CKK_SHA384_HMAC),
    ("CKK_SHA512_HMAC", CKK_SHA512_HMAC),
    ("CKK_SHA224_HMAC", CKK_SHA224_HMAC),
    ("CKK_EC_EDWARDS", CKK_EC_EDWARDS),
    ("CKK_EC_MONTGOMERY", CKK_EC_MONTGOMERY),
    ("CKK_VENDOR_SM2", CKK_VENDOR_SM2),
];

static CKU_NAMES: &[(&str, u64)] = &[
    ("CKU_SO", CKU_SO),
    ("CKU_USER", CKU_USER),
    ("CKU_CONTEXT_SPECIFIC", CKU_CONTEXT_SPECIFIC),
];

pub fn ckm_code(name: &str) -> Option<u64> {
    lookup(CKM_NAMES, name)
}

/// Every mechanism code this layer knows by name.
pub fn all_ckm_codes() -> Vec<u64> {
    CKM_NAMES.iter().map(|(_, code)| *code).collect()
}

pub fn ckm_name(code: u64) -> Option<&'static str> {
    reverse(CKM_NAMES, code)
}

pub fn ckk_code(name: &str) -> Option<u64> {
    lookup(CKK_NAMES, name)
}

pub fn ckk_name(code: u64) -> Option<&'static str> {
    reverse(CKK_NAMES, code)
}

pub fn cku_code(name: &str) -> Option<u64> {
    lookup(CKU_NAMES, name)
}

fn lookup(table: &[(&str, u64)], name: &str) -> Option<u64> {
    table.iter().find(|(n, _)| *n == name).map(|(_, c)| *c)
}

fn reverse(table: &'static [(&str, u64)], code: u64) -> Option<&'static str> {
    table.iter().find(|(_, c)| *c == code).map(|(n, _)| *n)
}

/// Renders a mechanism code for diagnostics: name when known, hex otherwise.
pub fn ckm_display(code: u64) -> String {
    match ckm_name(code) {
        Some(name) => name.to_string(),
        None => format!("0x{code:08X}"),
    }
}

/// Parses a numeric CK code: decimal or `0x` hex, with an optional `L`/`UL`
/// suffix as some vendor documentation writes them.
pub fn parse_code(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let raw = raw
        .strip_suffix("UL")
        .or_else(|| raw.strip_suffix("L"))
        .unwrap_or(raw);
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// The digest behind a plain-hash or HMAC mechanism, if it has one.
pub fn hash_algo_of(mechanism: u64) -> Option<HashAlgo> {
    match mechanism {
        CKM_SHA_1 | CKM_SHA_1_HMAC => Some(HashAlgo::Sha1),
        CKM_SHA256 | CKM_SHA256_HMAC => Some(HashAlgo::Sha256),
        CKM_SHA384 | CKM_SHA384_HMAC => Some(HashAlgo::Sha384),
        CKM_SHA512 | CKM_SHA512_HMAC => Some(HashAlgo::Sha512),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_tables_resolve_both_ways() {
        assert_eq!(ckm_code("CKM_RSA_PKCS_PSS"), Some(CKM_RSA_PKCS_PSS));
        assert_eq!(ckm_name(CKM_ECDSA), Some("CKM_ECDSA"));
        assert_eq!(ckk_code("CKK_AES"), Some(CKK_AES));
        assert_eq!(cku_code("CKU_SO"), Some(CKU_SO));
        assert_eq!(ckm_code("CKM_NO_SUCH"), None);
    }

    #[test]
    fn code_parsing_accepts_hex_and_suffixes() {
        assert_eq!(parse_code("31"), Some(31));
        assert_eq!(parse_code("0x1F"), Some(0x1F));
        assert_eq!(parse_code("0x1FL"), Some(0x1F));
        assert_eq!(parse_code("42UL"), Some(42));
        assert_eq!(parse_code("banana"), None);
    }
}
