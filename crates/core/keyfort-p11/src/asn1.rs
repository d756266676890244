//! Small DER helpers shared by the backends.

use der::asn1::ObjectIdentifier;
use der::asn1::OctetString;
use der::Encode;

use crate::error::TokenError;

pub(crate) fn der_err(err: impl std::fmt::Display) -> TokenError {
    TokenError::other(format!("DER encoding failed: {err}"))
}

/// DER of a dotted-decimal OID, the named-curve form of `CKA_EC_PARAMS`.
pub(crate) fn oid_der(oid: &str) -> Result<Vec<u8>, TokenError> {
    let oid: ObjectIdentifier = oid.parse().map_err(der_err)?;
    oid.to_der().map_err(der_err)
}

/// Decodes a DER OID back to its dotted-decimal form.
pub(crate) fn oid_from_der(bytes: &[u8]) -> Option<String> {
    use der::Decode;
    ObjectIdentifier::from_der(bytes).ok().map(|oid| oid.to_string())
}

/// Wraps bytes in a DER OCTET STRING, the `CKA_EC_POINT` convention.
pub(crate) fn octet_wrap(bytes: &[u8]) -> Result<Vec<u8>, TokenError> {
    OctetString::new(bytes)
        .map_err(der_err)?
        .to_der()
        .map_err(der_err)
}
