//! Marshaling between this crate's mechanism/key codes and the cryptoki
//! wrapper's typed representations.

use cryptoki::mechanism::eddsa::EddsaParams;
use cryptoki::mechanism::eddsa::EddsaSignatureScheme;
use cryptoki::mechanism::rsa::PkcsMgfType;
use cryptoki::mechanism::rsa::PkcsPssParams;
use cryptoki::mechanism::Mechanism;
use cryptoki::mechanism::MechanismType;
use cryptoki::object::KeyType;
use cryptoki::session::UserType;

use crate::error::TokenError;
use crate::mech;
use crate::types::P11Params;
use crate::types::RsaPssParams;

fn unsupported(mechanism: u64) -> TokenError {
    TokenError::UnsupportedMechanism(format!(
        "{} is not supported through the PKCS#11 wrapper",
        mech::ckm_display(mechanism)
    ))
}

/// The wrapper mechanism for a signing operation.
pub(super) fn sign_mechanism(
    mechanism: u64,
    params: Option<&P11Params>,
) -> Result<Mechanism<'static>, TokenError> {
    Ok(match mechanism {
        mech::CKM_RSA_PKCS => Mechanism::RsaPkcs,
        mech::CKM_RSA_X_509 => Mechanism::RsaX509,
        mech::CKM_SHA1_RSA_PKCS => Mechanism::Sha1RsaPkcs,
        mech::CKM_SHA256_RSA_PKCS => Mechanism::Sha256RsaPkcs,
        mech::CKM_SHA384_RSA_PKCS => Mechanism::Sha384RsaPkcs,
        mech::CKM_SHA512_RSA_PKCS => Mechanism::Sha512RsaPkcs,
        mech::CKM_RSA_PKCS_PSS => Mechanism::RsaPkcsPss(pss(mechanism, params)?),
        mech::CKM_SHA1_RSA_PKCS_PSS => Mechanism::Sha1RsaPkcsPss(pss(mechanism, params)?),
        mech::CKM_SHA256_RSA_PKCS_PSS => Mechanism::Sha256RsaPkcsPss(pss(mechanism, params)?),
        mech::CKM_SHA384_RSA_PKCS_PSS => Mechanism::Sha384RsaPkcsPss(pss(mechanism, params)?),
        mech::CKM_SHA512_RSA_PKCS_PSS => Mechanism::Sha512RsaPkcsPss(pss(mechanism, params)?),
        mech::CKM_ECDSA => Mechanism::Ecdsa,
        mech::CKM_ECDSA_SHA1 => Mechanism::EcdsaSha1,
        mech::CKM_ECDSA_SHA256 => Mechanism::EcdsaSha256,
        mech::CKM_ECDSA_SHA384 => Mechanism::EcdsaSha384,
        mech::CKM_ECDSA_SHA512 => Mechanism::EcdsaSha512,
        mech::CKM_EDDSA => Mechanism::Eddsa(EddsaParams::new(EddsaSignatureScheme::Pure)),
        other => return Err(unsupported(other)),
    })
}

/// The wrapper mechanism for a plain digest.
pub(super) fn digest_mechanism(mechanism: u64) -> Result<Mechanism<'static>, TokenError> {
    Ok(match mechanism {
        mech::CKM_SHA_1 => Mechanism::Sha1,
        mech::CKM_SHA256 => Mechanism::Sha256,
        mech::CKM_SHA384 => Mechanism::Sha384,
        mech::CKM_SHA512 => Mechanism::Sha512,
        other => return Err(unsupported(other)),
    })
}

fn pss(mechanism: u64, params: Option<&P11Params>) -> Result<PkcsPssParams, TokenError> {
    let defaults = match mechanism {
        mech::CKM_SHA1_RSA_PKCS_PSS => Some((mech::CKM_SHA_1, 20u64)),
        mech::CKM_SHA256_RSA_PKCS_PSS => Some((mech::CKM_SHA256, 32)),
        mech::CKM_SHA384_RSA_PKCS_PSS => Some((mech::CKM_SHA384, 48)),
        mech::CKM_SHA512_RSA_PKCS_PSS => Some((mech::CKM_SHA512, 64)),
        _ => None,
    };
    let (hash_mech, salt_len) = match params {
        Some(P11Params::RsaPss(RsaPssParams {
            hash_mech,
            salt_len,
            ..
        })) => (*hash_mech, *salt_len),
        Some(_) => return Err(TokenError::other("unexpected parameters for RSA-PSS")),
        None => defaults
            .ok_or_else(|| TokenError::other("CKM_RSA_PKCS_PSS requires parameters"))?,
    };
    let (hash_alg, mgf) = match hash_mech {
        mech::CKM_SHA_1 => (MechanismType::SHA1, PkcsMgfType::MGF1_SHA1),
        mech::CKM_SHA256 => (MechanismType::SHA256, PkcsMgfType::MGF1_SHA256),
        mech::CKM_SHA384 => (MechanismType::SHA384, PkcsMgfType::MGF1_SHA384),
        mech::CKM_SHA512 => (MechanismType::SHA512, PkcsMgfType::MGF1_SHA512),
        other => return Err(unsupported(other)),
    };
    Ok(PkcsPssParams {
        hash_alg,
        mgf,
        s_len: salt_len.into(),
    })
}

pub(super) fn key_type_to_ck(key_type: u64) -> Result<KeyType, TokenError> {
    Ok(match key_type {
        mech::CKK_RSA => KeyType::RSA,
        mech::CKK_EC => KeyType::EC,
        mech::CKK_AES => KeyType::AES,
        mech::CKK_GENERIC_SECRET => KeyType::GENERIC_SECRET,
        mech::CKK_EC_EDWARDS => KeyType::EC_EDWARDS,
        other => {
            return Err(TokenError::other(format!(
                "key type 0x{other:X} is not supported through the PKCS#11 wrapper"
            )))
        }
    })
}

pub(super) fn key_type_from_ck(key_type: KeyType) -> u64 {
    if key_type == KeyType::RSA {
        mech::CKK_RSA
    } else if key_type == KeyType::EC {
        mech::CKK_EC
    } else if key_type == KeyType::AES {
        mech::CKK_AES
    } else if key_type == KeyType::EC_EDWARDS {
        mech::CKK_EC_EDWARDS
    } else {
        mech::CKK_GENERIC_SECRET
    }
}

pub(super) fn user_type(code: u64) -> Result<UserType, TokenError> {
    match code {
        mech::CKU_USER => Ok(UserType::User),
        mech::CKU_CONTEXT_SPECIFIC => Ok(UserType::ContextSpecific),
        other => Err(TokenError::other(format!("unsupported user type {other}"))),
    }
}

/// Our mechanism codes among the ones the token advertises.
pub(super) fn advertised_codes(available: &[MechanismType]) -> Vec<u64> {
    mech::all_ckm_codes()
        .iter()
        .copied()
        .filter(|code| {
            MechanismType::try_from(*code)
                .map(|mt| available.contains(&mt))
                .unwrap_or(false)
        })
        .collect()
}
