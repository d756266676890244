//! Wire format of the proxy protocol.
//!
//! A request is the CBOR array `[slot_id, payload]` where `payload` is
//! `null` for parameterless actions. A response is one CBOR-encoded
//! [`ProxyMessage`] (or `null` where the value is optional). The action tag
//! itself travels out of band, next to the frame, through the transport.

use serde::Deserialize;
use serde::Serialize;

use crate::error::TokenError;
use crate::types::KeyParams;
use crate::types::NewKeyControl;
use crate::types::P11KeyId;
use crate::types::P11Params;

/// The closed set of proxy actions. Codes are the enum ordinals and are part
/// of the wire contract; new actions append, nothing renumbers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
#[repr(u16)]
pub enum ProxyAction {
    ModuleCaps = 0,
    SlotIds = 1,
    MechInfos = 2,
    PublicKeyByHandle = 3,
    KeyByKeyId = 4,
    KeyByIdLabel = 5,
    KeyIdByIdLabel = 6,
    ObjectExistsByIdLabel = 7,
    DestroyAllObjects = 8,
    DestroyObjectsByHandle = 9,
    DestroyObjectsByIdLabel = 10,
    GenSecretKey = 11,
    ImportSecretKey = 12,
    GenRsaKeypair = 13,
    GenRsaKeypairOtf = 14,
    GenDsaKeypair2 = 15,
    GenDsaKeypair = 16,
    GenDsaKeypairOtf = 17,
    GenEcKeypair = 18,
    GenEcKeypairOtf = 19,
    GenSm2Keypair = 20,
    GenSm2KeypairOtf = 21,
    ShowDetails = 22,
    Sign = 23,
    DigestSecretKey = 24,
}

impl ProxyAction {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use ProxyAction::*;
        Some(match code {
            0 => ModuleCaps,
            1 => SlotIds,
            2 => MechInfos,
            3 => PublicKeyByHandle,
            4 => KeyByKeyId,
            5 => KeyByIdLabel,
            6 => KeyIdByIdLabel,
            7 => ObjectExistsByIdLabel,
            8 => DestroyAllObjects,
            9 => DestroyObjectsByHandle,
            10 => DestroyObjectsByIdLabel,
            11 => GenSecretKey,
            12 => ImportSecretKey,
            13 => GenRsaKeypair,
            14 => GenRsaKeypairOtf,
            15 => GenDsaKeypair2,
            16 => GenDsaKeypair,
            17 => GenDsaKeypairOtf,
            18 => GenEcKeypair,
            19 => GenEcKeypairOtf,
            20 => GenSm2Keypair,
            21 => GenSm2KeypairOtf,
            22 => ShowDetails,
            23 => Sign,
            24 => DigestSecretKey,
            _ => return None,
        })
    }
}

// ---- responses ---------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ByteArrayMessage {
    pub value: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IntMessage {
    pub value: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LongMessage {
    pub value: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LongArrayMessage {
    pub value: Vec<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BooleanMessage {
    pub value: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeyIdMessage {
    pub key_id: P11KeyId,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct P11KeyResponse {
    pub key_id: P11KeyId,
    pub params: Option<KeyParams>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MechanismInfo {
    pub mechanism: u64,
    pub min_key_size: u64,
    pub max_key_size: u64,
    pub flags: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GetMechanismInfosResponse {
    pub infos: Vec<MechanismInfo>,
}

/// Every reply the server can send, externally tagged with its type name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProxyMessage {
    ByteArrayMessage(ByteArrayMessage),
    IntMessage(IntMessage),
    LongMessage(LongMessage),
    LongArrayMessage(LongArrayMessage),
    BooleanMessage(BooleanMessage),
    KeyIdMessage(KeyIdMessage),
    P11KeyResponse(P11KeyResponse),
    GetMechanismInfosResponse(GetMechanismInfosResponse),
}

// ---- requests ----------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdLabelRequest {
    pub id: Option<Vec<u8>>,
    pub label: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyByKeyIdRequest {
    pub key_id: P11KeyId,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HandleRequest {
    pub handle: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandlesRequest {
    pub handles: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenSecretKeyRequest {
    pub key_type: u64,
    pub key_len_bits: Option<u32>,
    pub control: NewKeyControl,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportSecretKeyRequest {
    pub key_type: u64,
    pub value: Vec<u8>,
    pub control: NewKeyControl,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenRsaKeypairRequest {
    pub keysize: u32,
    pub public_exponent: Vec<u8>,
    pub control: Option<NewKeyControl>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenDsaKeypairRequest {
    pub p: Vec<u8>,
    pub q: Vec<u8>,
    pub g: Vec<u8>,
    pub control: Option<NewKeyControl>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenDsaKeypair2Request {
    pub p_bits: u32,
    pub q_bits: u32,
    pub control: NewKeyControl,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenEcKeypairRequest {
    pub curve_oid: String,
    pub control: Option<NewKeyControl>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenSm2KeypairRequest {
    pub control: NewKeyControl,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignRequest {
    pub mechanism: u64,
    pub params: Option<P11Params>,
    pub key_handle: u64,
    pub content: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DigestSecretKeyRequest {
    pub mechanism: u64,
    pub key_handle: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ShowDetailsRequest {
    pub handle: Option<u64>,
    pub verbose: bool,
}

// ---- framing -----------------------------------------------------------

fn codec_err(err: impl std::fmt::Display) -> TokenError {
    TokenError::other(format!("CBOR codec failure: {err}"))
}

/// `[slot_id, payload]`, payload `null` when absent.
pub fn encode_request<T: Serialize>(
    slot_id: u64,
    payload: Option<&T>,
) -> Result<Vec<u8>, TokenError> {
    let mut frame = Vec::new();
    ciborium::into_writer(&(slot_id, payload), &mut frame).map_err(codec_err)?;
    Ok(frame)
}

pub fn decode_request<T: for<'de> Deserialize<'de>>(
    frame: &[u8],
) -> Result<(u64, Option<T>), TokenError> {
    ciborium::from_reader(frame).map_err(codec_err)
}

pub fn encode_response(message: Option<&ProxyMessage>) -> Result<Vec<u8>, TokenError> {
    let mut frame = Vec::new();
    ciborium::into_writer(&message, &mut frame).map_err(codec_err)?;
    Ok(frame)
}

pub fn decode_response(frame: &[u8]) -> Result<Option<ProxyMessage>, TokenError> {
    if frame.is_empty() {
        return Ok(None);
    }
    ciborium::from_reader(frame).map_err(codec_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectClass;

    #[test]
    fn action_codes_are_stable_and_closed() {
        assert_eq!(ProxyAction::ModuleCaps.code(), 0);
        assert_eq!(ProxyAction::GenEcKeypairOtf.code(), 19);
        assert_eq!(ProxyAction::DigestSecretKey.code(), 24);
        for code in 0..=24 {
            let action = ProxyAction::from_code(code).unwrap();
            assert_eq!(action.code(), code);
        }
        assert_eq!(ProxyAction::from_code(25), None);
        assert_eq!(ProxyAction::from_code(u16::MAX), None);
    }

    #[test]
    fn request_frame_round_trips() {
        let request = SignRequest {
            mechanism: 0x40,
            params: None,
            key_handle: 0xAB00,
            content: b"data".to_vec(),
        };
        let frame = encode_request(800_000, Some(&request)).unwrap();
        let (slot_id, decoded): (u64, Option<SignRequest>) = decode_request(&frame).unwrap();
        assert_eq!(slot_id, 800_000);
        let decoded = decoded.unwrap();
        assert_eq!(decoded.key_handle, request.key_handle);
        assert_eq!(decoded.content, request.content);
    }

    #[test]
    fn null_payload_round_trips() {
        let frame = encode_request::<()>(42, None).unwrap();
        let (slot_id, payload): (u64, Option<()>) = decode_request(&frame).unwrap();
        assert_eq!(slot_id, 42);
        assert!(payload.is_none());
    }

    #[test]
    fn response_messages_round_trip_typed() {
        let message = ProxyMessage::KeyIdMessage(KeyIdMessage {
            key_id: P11KeyId::new(7, ObjectClass::PrivateKey, 0, vec![1], "k"),
        });
        let frame = encode_response(Some(&message)).unwrap();
        assert_eq!(decode_response(&frame).unwrap(), Some(message));

        let null_frame = encode_response(None).unwrap();
        assert_eq!(decode_response(&null_frame).unwrap(), None);
        assert_eq!(decode_response(&[]).unwrap(), None);
    }
}
