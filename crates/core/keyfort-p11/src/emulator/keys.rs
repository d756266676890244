//! Software key material for the emulator: generation, PKCS#8 encoding and
//! signing over the RustCrypto engines.
//!
//! Private keys only ever exist decoded inside these functions; the byte
//! buffers travel as [`Zeroizing`] and the engines wipe themselves on drop.

use der::asn1::ObjectIdentifier;
use der::asn1::OctetString;
use der::asn1::Uint;
use der::Encode;
use hmac::Hmac;
use hmac::Mac;
use keyfort_security::hash;
use keyfort_security::HashAlgo;
use pkcs8::DecodePrivateKey;
use pkcs8::EncodePrivateKey;
use rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::BigUint;
use rsa::RsaPrivateKey;
use sha1::Sha1;
use sha2::Digest;
use sha2::Sha256;
use sha2::Sha384;
use sha2::Sha512;
use signature::hazmat::PrehashSigner;
use signature::DigestSigner;
use signature::Signer;
use zeroize::Zeroizing;

use crate::asn1::der_err;
use crate::asn1::octet_wrap;
use crate::asn1::oid_der;
use crate::emulator::store::Properties;
use crate::emulator::store::PROP_BASE;
use crate::emulator::store::PROP_EC_PARAMS;
use crate::emulator::store::PROP_EC_POINT;
use crate::emulator::store::PROP_MODULUS;
use crate::emulator::store::PROP_PRIME;
use crate::emulator::store::PROP_PUBLIC_EXPONENT;
use crate::emulator::store::PROP_SUBPRIME;
use crate::emulator::store::PROP_VALUE;
use crate::error::TokenError;
use crate::mech;
use crate::types::EcCurve;
use crate::types::P11Params;
use crate::types::RsaPssParams;

pub const OID_RSA: &str = "1.2.840.113549.1.1.1";
pub const OID_DSA: &str = "1.2.840.10040.4.1";
pub const OID_EC: &str = "1.2.840.10045.2.1";

const SM2_DEFAULT_DIST_ID: &str = "1234567812345678";

/// Freshly generated pair, ready for the store: wrapped-to-be private half
/// plus the public half as info-file properties.
pub struct GeneratedKeypair {
    pub key_type: u64,
    pub algo_oid: String,
    pub keyspec: String,
    pub private_key_info: Zeroizing<Vec<u8>>,
    pub public_props: Properties,
}

fn crypto_err(err: impl std::fmt::Display) -> TokenError {
    TokenError::other(format!("software crypto failure: {err}"))
}

/// PKCS#8 `OneAsymmetricKey` for raw-seed algorithms (X25519); the dalek
/// types for Ed25519 encode themselves.
fn raw_pkcs8(oid: &str, seed: &[u8]) -> Result<Zeroizing<Vec<u8>>, TokenError> {
    let curve_private_key = Zeroizing::new(octet_wrap(seed)?);
    let algorithm = pkcs8::AlgorithmIdentifierRef {
        oid: oid.parse().map_err(der_err)?,
        parameters: None,
    };
    let info = pkcs8::PrivateKeyInfo::new(algorithm, &curve_private_key);
    Ok(Zeroizing::new(info.to_der().map_err(der_err)?))
}

// ---- explicit EC domain parameters ------------------------------------

#[derive(der::Sequence)]
struct FieldId {
    field_type: ObjectIdentifier,
    prime: Uint,
}

#[derive(der::Sequence)]
struct CurveCoefficients {
    a: OctetString,
    b: OctetString,
}

/// RFC 3279 `ECParameters` with explicit domain parameters.
#[derive(der::Sequence)]
struct EcDomainParameters {
    version: u8,
    field_id: FieldId,
    curve: CurveCoefficients,
    base: OctetString,
    order: Uint,
    cofactor: u8,
}

const OID_PRIME_FIELD: &str = "1.2.840.10045.1.1";

struct CurveConstants {
    p: &'static str,
    a: &'static str,
    b: &'static str,
    base: &'static str,
    n: &'static str,
}

const P256_CONSTANTS: CurveConstants = CurveConstants {
    p: "ffffffff00000001000000000000000000000000ffffffffffffffffffffffff",
    a: "ffffffff00000001000000000000000000000000fffffffffffffffffffffffc",
    b: "5ac635d8aa3a93e7b3ebbd55769886bc651d06b0cc53b0f63bce3c3e27d2604b",
    base: "046b17d1f2e12c4247f8bce6e563a440f277037d812deb33a0f4a13945d898c296\
           4fe342e2fe1a7f9b8ee7eb4a7c0f9e162bce33576b315ececbb6406837bf51f5",
    n: "ffffffff00000000ffffffffffffffffbce6faada7179e84f3b9cac2fc632551",
};

const P384_CONSTANTS: CurveConstants = CurveConstants {
    p: "fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffeffffffff0000000000000000ffffffff",
    a: "fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffeffffffff0000000000000000fffffffc",
    b: "b3312fa7e23ee7e4988e056be3f82d19181d9c6efe8141120314088f5013875ac656398d8a2ed19d2a85c8edd3ec2aef",
    base: "04aa87ca22be8b05378eb1c71ef320ad746e1d3b628ba79b9859f741e082542a385502f25dbf55296c3a545e3872760ab7\
           3617de4a96262c6f5d9e98bf9292dc29f8f41dbd289a147ce9da3113b5f0b8c00a60b1ce1d7e819d7a431d7c90ea0e5f",
    n: "ffffffffffffffffffffffffffffffffffffffffffffffffc7634d81f4372ddf581a0db248b0a77aecec196accc52973",
};

/// The curve of an EC public key, as `ecParams` wants it written: the named
/// OID, or the full domain parameters for tokens that cannot handle named
/// curves.
pub fn ec_params_der(curve: EcCurve, named_curve_supported: bool) -> Result<Vec<u8>, TokenError> {
    if named_curve_supported {
        return oid_der(curve.oid());
    }
    let constants = match curve {
        EcCurve::P256 => &P256_CONSTANTS,
        EcCurve::P384 => &P384_CONSTANTS,
        // no explicit form exists for these
        _ => return oid_der(curve.oid()),
    };
    let unhex = |s: &str| hex::decode(s.replace(char::is_whitespace, "")).map_err(der_err);
    let params = EcDomainParameters {
        version: 1,
        field_id: FieldId {
            field_type: OID_PRIME_FIELD.parse().map_err(der_err)?,
            prime: Uint::new(&unhex(constants.p)?).map_err(der_err)?,
        },
        curve: CurveCoefficients {
            a: OctetString::new(unhex(constants.a)?).map_err(der_err)?,
            b: OctetString::new(unhex(constants.b)?).map_err(der_err)?,
        },
        base: OctetString::new(unhex(constants.base)?).map_err(der_err)?,
        order: Uint::new(&unhex(constants.n)?).map_err(der_err)?,
        cofactor: 1,
    };
    params.to_der().map_err(der_err)
}

// ---- generation --------------------------------------------------------

pub fn generate_rsa(keysize: u32, public_exponent: &[u8]) -> Result<GeneratedKeypair, TokenError> {
    let exponent = if public_exponent.is_empty() {
        BigUint::from(65537u32)
    } else {
        BigUint::from_bytes_be(public_exponent)
    };
    let private_key = RsaPrivateKey::new_with_exp(&mut OsRng, keysize as usize, &exponent)
        .map_err(crypto_err)?;
    let public_key = private_key.to_public_key();

    let mut public_props = Properties::new();
    public_props.set_hex(PROP_MODULUS, &public_key.n().to_bytes_be());
    public_props.set_hex(PROP_PUBLIC_EXPONENT, &public_key.e().to_bytes_be());

    Ok(GeneratedKeypair {
        key_type: mech::CKK_RSA,
        algo_oid: OID_RSA.to_string(),
        keyspec: format!("RSA/{keysize}"),
        private_key_info: pkcs8_of(&private_key)?,
        public_props,
    })
}

pub fn generate_dsa(p: &[u8], q: &[u8], g: &[u8]) -> Result<GeneratedKeypair, TokenError> {
    let components = dsa::Components::from_components(
        BigUint::from_bytes_be(p),
        BigUint::from_bytes_be(q),
        BigUint::from_bytes_be(g),
    )
    .map_err(crypto_err)?;
    finish_dsa(dsa::SigningKey::generate(&mut OsRng, components))
}

pub fn generate_dsa_by_size(p_bits: u32, q_bits: u32) -> Result<GeneratedKeypair, TokenError> {
    let size = match (p_bits, q_bits) {
        (1024, 160) => dsa::KeySize::DSA_1024_160,
        (2048, 224) => dsa::KeySize::DSA_2048_224,
        (2048, 256) => dsa::KeySize::DSA_2048_256,
        (3072, 256) => dsa::KeySize::DSA_3072_256,
        _ => {
            return Err(TokenError::other(format!(
                "unsupported DSA parameter sizes P={p_bits} Q={q_bits}"
            )))
        }
    };
    let components = dsa::Components::generate(&mut OsRng, size);
    finish_dsa(dsa::SigningKey::generate(&mut OsRng, components))
}

fn finish_dsa(private_key: dsa::SigningKey) -> Result<GeneratedKeypair, TokenError> {
    let verifying = private_key.verifying_key();
    let components = verifying.components();
    let p_bits = components.p().bits();

    let mut public_props = Properties::new();
    public_props.set_hex(PROP_PRIME, &components.p().to_bytes_be());
    public_props.set_hex(PROP_SUBPRIME, &components.q().to_bytes_be());
    public_props.set_hex(PROP_BASE, &components.g().to_bytes_be());
    public_props.set_hex(PROP_VALUE, &verifying.y().to_bytes_be());

    Ok(GeneratedKeypair {
        key_type: mech::CKK_DSA,
        algo_oid: OID_DSA.to_string(),
        keyspec: format!("DSA/{p_bits}"),
        private_key_info: pkcs8_of(&private_key)?,
        public_props,
    })
}

pub fn generate_ec(
    curve_oid: &str,
    named_curve_supported: bool,
) -> Result<GeneratedKeypair, TokenError> {
    let curve = EcCurve::by_oid(curve_oid)
        .ok_or_else(|| TokenError::other(format!("unsupported curve {curve_oid}")))?;
    let (private_key_info, point): (Zeroizing<Vec<u8>>, Vec<u8>) = match curve {
        EcCurve::P256 => {
            let secret = p256::SecretKey::random(&mut OsRng);
            let point = secret.public_key().to_sec1_bytes().to_vec();
            (pkcs8_of(&secret)?, point)
        }
        EcCurve::P384 => {
            let secret = p384::SecretKey::random(&mut OsRng);
            let point = secret.public_key().to_sec1_bytes().to_vec();
            (pkcs8_of(&secret)?, point)
        }
        _ => {
            return Err(TokenError::other(format!(
                "curve {curve_oid} is not an ECDSA curve"
            )))
        }
    };

    let mut public_props = Properties::new();
    public_props.set_hex(PROP_EC_PARAMS, &ec_params_der(curve, named_curve_supported)?);
    public_props.set_hex(PROP_EC_POINT, &octet_wrap(&point)?);

    Ok(GeneratedKeypair {
        key_type: mech::CKK_EC,
        algo_oid: OID_EC.to_string(),
        keyspec: format!("EC/{curve_oid}"),
        private_key_info,
        public_props,
    })
}

pub fn generate_edwards(curve_oid: &str) -> Result<GeneratedKeypair, TokenError> {
    if curve_oid != EcCurve::ED25519_OID {
        return Err(TokenError::other(format!(
            "unsupported Edwards curve {curve_oid}"
        )));
    }
    let private_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
    let point = private_key.verifying_key().to_bytes();

    let mut public_props = Properties::new();
    public_props.set_hex(PROP_EC_PARAMS, &oid_der(curve_oid)?);
    public_props.set_hex(PROP_EC_POINT, &octet_wrap(&point)?);

    Ok(GeneratedKeypair {
        key_type: mech::CKK_EC_EDWARDS,
        algo_oid: EcCurve::ED25519_OID.to_string(),
        keyspec: "ED25519".to_string(),
        private_key_info: pkcs8_of(&private_key)?,
        public_props,
    })
}

pub fn generate_montgomery(curve_oid: &str) -> Result<GeneratedKeypair, TokenError> {
    if curve_oid != EcCurve::X25519_OID {
        return Err(TokenError::other(format!(
            "unsupported Montgomery curve {curve_oid}"
        )));
    }
    let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);

    let mut public_props = Properties::new();
    public_props.set_hex(PROP_EC_PARAMS, &oid_der(curve_oid)?);
    public_props.set_hex(PROP_EC_POINT, &octet_wrap(public.as_bytes())?);

    Ok(GeneratedKeypair {
        key_type: mech::CKK_EC_MONTGOMERY,
        algo_oid: EcCurve::X25519_OID.to_string(),
        keyspec: "X25519".to_string(),
        private_key_info: raw_pkcs8(EcCurve::X25519_OID, &secret.to_bytes())?,
        public_props,
    })
}

pub fn generate_sm2() -> Result<GeneratedKeypair, TokenError> {
    let secret = sm2::SecretKey::random(&mut OsRng);
    let point = secret.public_key().to_sec1_bytes().to_vec();

    let mut public_props = Properties::new();
    public_props.set_hex(PROP_EC_PARAMS, &oid_der(EcCurve::SM2_OID)?);
    public_props.set_hex(PROP_EC_POINT, &octet_wrap(&point)?);

    Ok(GeneratedKeypair {
        key_type: mech::CKK_VENDOR_SM2,
        algo_oid: OID_EC.to_string(),
        keyspec: format!("EC/{}", EcCurve::SM2_OID),
        private_key_info: pkcs8_of(&secret)?,
        public_props,
    })
}

fn pkcs8_of(key: &impl EncodePrivateKey) -> Result<Zeroizing<Vec<u8>>, TokenError> {
    let document = key.to_pkcs8_der().map_err(der_err)?;
    Ok(Zeroizing::new(document.as_bytes().to_vec()))
}

// ---- signing -----------------------------------------------------------

/// Signs `content` with the decoded private key of `key_type`, dispatching
/// on the mechanism. ECDSA/DSA signatures come out as the raw `r || s`
/// concatenation, the PKCS#11 wire form.
pub fn sign_with_private_key(
    key_type: u64,
    private_key_info: &[u8],
    keyspec: &str,
    mechanism: u64,
    params: Option<&P11Params>,
    content: &[u8],
) -> Result<Vec<u8>, TokenError> {
    match key_type {
        mech::CKK_RSA => sign_rsa(private_key_info, mechanism, params, content),
        mech::CKK_EC => sign_ecdsa(private_key_info, keyspec, mechanism, content),
        mech::CKK_EC_EDWARDS => sign_eddsa(private_key_info, mechanism, content),
        mech::CKK_DSA => sign_dsa(private_key_info, mechanism, content),
        mech::CKK_VENDOR_SM2 => sign_sm2(private_key_info, mechanism, content),
        _ => Err(unsupported(mechanism)),
    }
}

fn unsupported(mechanism: u64) -> TokenError {
    TokenError::UnsupportedMechanism(format!(
        "{} is not supported by the emulator",
        mech::ckm_display(mechanism)
    ))
}

fn sign_rsa(
    private_key_info: &[u8],
    mechanism: u64,
    params: Option<&P11Params>,
    content: &[u8],
) -> Result<Vec<u8>, TokenError> {
    let private_key = RsaPrivateKey::from_pkcs8_der(private_key_info).map_err(crypto_err)?;
    match mechanism {
        mech::CKM_RSA_PKCS => private_key
            .sign(rsa::Pkcs1v15Sign::new_unprefixed(), content)
            .map_err(crypto_err),
        mech::CKM_SHA1_RSA_PKCS => {
            let digest = hash(HashAlgo::Sha1, &[content])?;
            private_key
                .sign(rsa::Pkcs1v15Sign::new::<Sha1>(), &digest)
                .map_err(crypto_err)
        }
        mech::CKM_SHA256_RSA_PKCS => {
            let digest = hash(HashAlgo::Sha256, &[content])?;
            private_key
                .sign(rsa::Pkcs1v15Sign::new::<Sha256>(), &digest)
                .map_err(crypto_err)
        }
        mech::CKM_SHA384_RSA_PKCS => {
            let digest = hash(HashAlgo::Sha384, &[content])?;
            private_key
                .sign(rsa::Pkcs1v15Sign::new::<Sha384>(), &digest)
                .map_err(crypto_err)
        }
        mech::CKM_SHA512_RSA_PKCS => {
            let digest = hash(HashAlgo::Sha512, &[content])?;
            private_key
                .sign(rsa::Pkcs1v15Sign::new::<Sha512>(), &digest)
                .map_err(crypto_err)
        }
        mech::CKM_RSA_PKCS_PSS => {
            let pss = pss_params(mechanism, params)?;
            rsa_pss(&private_key, pss, content)
        }
        mech::CKM_SHA1_RSA_PKCS_PSS
        | mech::CKM_SHA256_RSA_PKCS_PSS
        | mech::CKM_SHA384_RSA_PKCS_PSS
        | mech::CKM_SHA512_RSA_PKCS_PSS => {
            let pss = pss_params(mechanism, params)?;
            let digest = hash(pss.0, &[content])?;
            rsa_pss(&private_key, pss, &digest)
        }
        _ => Err(unsupported(mechanism)),
    }
}

/// (hash, salt length) of a PSS operation, from the mechanism itself or its
/// explicit parameters.
fn pss_params(
    mechanism: u64,
    params: Option<&P11Params>,
) -> Result<(HashAlgo, usize), TokenError> {
    let from_mechanism = match mechanism {
        mech::CKM_SHA1_RSA_PKCS_PSS => Some(HashAlgo::Sha1),
        mech::CKM_SHA256_RSA_PKCS_PSS => Some(HashAlgo::Sha256),
        mech::CKM_SHA384_RSA_PKCS_PSS => Some(HashAlgo::Sha384),
        mech::CKM_SHA512_RSA_PKCS_PSS => Some(HashAlgo::Sha512),
        _ => None,
    };
    match params {
        Some(P11Params::RsaPss(RsaPssParams {
            hash_mech,
            salt_len,
            ..
        })) => {
            let hash_algo = mech::hash_algo_of(*hash_mech)
                .or(from_mechanism)
                .ok_or_else(|| unsupported(*hash_mech))?;
            Ok((hash_algo, *salt_len as usize))
        }
        Some(_) => Err(TokenError::other("unexpected parameters for RSA-PSS")),
        None => {
            let hash_algo = from_mechanism
                .ok_or_else(|| TokenError::other("CKM_RSA_PKCS_PSS requires parameters"))?;
            Ok((hash_algo, hash_algo.output_len()))
        }
    }
}

fn rsa_pss(
    private_key: &RsaPrivateKey,
    (hash_algo, salt_len): (HashAlgo, usize),
    digest: &[u8],
) -> Result<Vec<u8>, TokenError> {
    let signature = match hash_algo {
        HashAlgo::Sha1 => {
            private_key.sign_with_rng(&mut OsRng, rsa::Pss::new_with_salt::<Sha1>(salt_len), digest)
        }
        HashAlgo::Sha256 => private_key.sign_with_rng(
            &mut OsRng,
            rsa::Pss::new_with_salt::<Sha256>(salt_len),
            digest,
        ),
        HashAlgo::Sha384 => private_key.sign_with_rng(
            &mut OsRng,
            rsa::Pss::new_with_salt::<Sha384>(salt_len),
            digest,
        ),
        HashAlgo::Sha512 => private_key.sign_with_rng(
            &mut OsRng,
            rsa::Pss::new_with_salt::<Sha512>(salt_len),
            digest,
        ),
    };
    signature.map_err(crypto_err)
}

fn sign_ecdsa(
    private_key_info: &[u8],
    keyspec: &str,
    mechanism: u64,
    content: &[u8],
) -> Result<Vec<u8>, TokenError> {
    let prehash = match mechanism {
        mech::CKM_ECDSA => content.to_vec(),
        mech::CKM_ECDSA_SHA1 => hash(HashAlgo::Sha1, &[content])?,
        mech::CKM_ECDSA_SHA256 => hash(HashAlgo::Sha256, &[content])?,
        mech::CKM_ECDSA_SHA384 => hash(HashAlgo::Sha384, &[content])?,
        mech::CKM_ECDSA_SHA512 => hash(HashAlgo::Sha512, &[content])?,
        _ => return Err(unsupported(mechanism)),
    };
    let curve_oid = keyspec.split_once('/').map(|(_, oid)| oid).unwrap_or("");
    match EcCurve::by_oid(curve_oid) {
        Some(EcCurve::P256) => {
            let secret = p256::SecretKey::from_pkcs8_der(private_key_info).map_err(crypto_err)?;
            let signing_key = p256::ecdsa::SigningKey::from(secret);
            let signature: p256::ecdsa::Signature =
                signing_key.sign_prehash(&prehash).map_err(crypto_err)?;
            Ok(signature.to_bytes().to_vec())
        }
        Some(EcCurve::P384) => {
            let secret = p384::SecretKey::from_pkcs8_der(private_key_info).map_err(crypto_err)?;
            let signing_key = p384::ecdsa::SigningKey::from(secret);
            let signature: p384::ecdsa::Signature =
                signing_key.sign_prehash(&prehash).map_err(crypto_err)?;
            Ok(signature.to_bytes().to_vec())
        }
        _ => Err(TokenError::other(format!(
            "cannot sign with curve {curve_oid}"
        ))),
    }
}

fn sign_eddsa(
    private_key_info: &[u8],
    mechanism: u64,
    content: &[u8],
) -> Result<Vec<u8>, TokenError> {
    if mechanism != mech::CKM_EDDSA {
        return Err(unsupported(mechanism));
    }
    let signing_key =
        ed25519_dalek::SigningKey::from_pkcs8_der(private_key_info).map_err(crypto_err)?;
    Ok(signing_key.sign(content).to_bytes().to_vec())
}

fn sign_dsa(
    private_key_info: &[u8],
    mechanism: u64,
    content: &[u8],
) -> Result<Vec<u8>, TokenError> {
    let signing_key = dsa::SigningKey::from_pkcs8_der(private_key_info).map_err(crypto_err)?;
    let signature: dsa::Signature = match mechanism {
        mech::CKM_DSA_SHA1 => {
            let mut digest = Sha1::new();
            digest.update(content);
            signing_key.try_sign_digest(digest).map_err(crypto_err)?
        }
        mech::CKM_DSA_SHA256 => {
            let mut digest = Sha256::new();
            digest.update(content);
            signing_key.try_sign_digest(digest).map_err(crypto_err)?
        }
        _ => return Err(unsupported(mechanism)),
    };
    let width = signing_key
        .verifying_key()
        .components()
        .q()
        .to_bytes_be()
        .len();
    let mut out = vec![0u8; 2 * width];
    write_fixed(&mut out[..width], &signature.r().to_bytes_be());
    write_fixed(&mut out[width..], &signature.s().to_bytes_be());
    Ok(out)
}

fn write_fixed(target: &mut [u8], value: &[u8]) {
    let offset = target.len().saturating_sub(value.len());
    let copy_len = target.len() - offset;
    target[offset..].copy_from_slice(&value[value.len() - copy_len..]);
}

fn sign_sm2(
    private_key_info: &[u8],
    mechanism: u64,
    content: &[u8],
) -> Result<Vec<u8>, TokenError> {
    if mechanism != mech::CKM_VENDOR_SM2 {
        return Err(unsupported(mechanism));
    }
    let secret = sm2::SecretKey::from_pkcs8_der(private_key_info).map_err(crypto_err)?;
    let signing_key =
        sm2::dsa::SigningKey::new(SM2_DEFAULT_DIST_ID, &secret).map_err(crypto_err)?;
    let signature: sm2::dsa::Signature = signing_key.sign(content);
    Ok(signature.to_bytes().to_vec())
}

/// HMAC over a stored secret value.
pub fn sign_hmac(secret: &[u8], mechanism: u64, content: &[u8]) -> Result<Vec<u8>, TokenError> {
    macro_rules! hmac_with {
        ($digest:ty) => {{
            let mut engine = <Hmac<$digest>>::new_from_slice(secret)
                .map_err(|_| TokenError::other("invalid HMAC key length"))?;
            engine.update(content);
            Ok(engine.finalize().into_bytes().to_vec())
        }};
    }

    match mechanism {
        mech::CKM_SHA_1_HMAC => hmac_with!(Sha1),
        mech::CKM_SHA256_HMAC => hmac_with!(Sha256),
        mech::CKM_SHA384_HMAC => hmac_with!(Sha384),
        mech::CKM_SHA512_HMAC => hmac_with!(Sha512),
        _ => Err(unsupported(mechanism)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signature::hazmat::PrehashVerifier;

    #[test]
    fn generated_rsa_key_round_trips_through_pkcs8() {
        let pair = generate_rsa(2048, &[0x01, 0x00, 0x01]).unwrap();
        let key = RsaPrivateKey::from_pkcs8_der(&pair.private_key_info).unwrap();
        assert_eq!(key.size() * 8, 2048);
        assert_eq!(
            pair.public_props.get_hex(PROP_PUBLIC_EXPONENT),
            Some(vec![0x01, 0x00, 0x01])
        );
    }

    #[test]
    fn ecdsa_signature_verifies_against_generated_public_point() {
        let pair = generate_ec(EcCurve::P256_OID, true).unwrap();
        let prehash = hash(HashAlgo::Sha256, &[b"content"]).unwrap();
        let signature = sign_ecdsa(
            &pair.private_key_info,
            &pair.keyspec,
            mech::CKM_ECDSA,
            &prehash,
        )
        .unwrap();
        assert_eq!(signature.len(), 64);

        // unwrap the stored point and verify
        let wrapped = pair.public_props.get_hex(PROP_EC_POINT).unwrap();
        let point: OctetString = der::Decode::from_der(&wrapped).unwrap();
        let verifying_key =
            p256::ecdsa::VerifyingKey::from_sec1_bytes(point.as_bytes()).unwrap();
        let signature = p256::ecdsa::Signature::from_slice(&signature).unwrap();
        verifying_key.verify_prehash(&prehash, &signature).unwrap();
    }

    #[test]
    fn eddsa_round_trip() {
        let pair = generate_edwards(EcCurve::ED25519_OID).unwrap();
        let signature = sign_eddsa(&pair.private_key_info, mech::CKM_EDDSA, b"msg").unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn pss_defaults_salt_to_digest_length() {
        let (algo, salt) = pss_params(mech::CKM_SHA256_RSA_PKCS_PSS, None).unwrap();
        assert_eq!(algo, HashAlgo::Sha256);
        assert_eq!(salt, 32);
    }

    #[test]
    fn explicit_ec_params_differ_from_named() {
        let named = ec_params_der(EcCurve::P256, true).unwrap();
        let explicit = ec_params_der(EcCurve::P256, false).unwrap();
        assert_ne!(named, explicit);
        assert!(explicit.len() > named.len());
    }
}
