//! One remote slot: every backend primitive encodes a request, sends it
//! through the injected transport and decodes a typed reply.

use std::io;
use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use crate::error::TokenError;
use crate::proxy::msg;
use crate::proxy::msg::ProxyAction;
use crate::proxy::msg::ProxyMessage;
use crate::proxy::ProxyTransport;
use crate::slot::SlotBackend;
use crate::types::NewKeyControl;
use crate::types::P11Key;
use crate::types::P11KeyId;
use crate::types::P11Params;
use crate::types::P11SlotId;

pub(crate) struct ProxyP11Slot {
    slot_id: P11SlotId,
    transport: Arc<dyn ProxyTransport>,
}

impl ProxyP11Slot {
    pub fn new(slot_id: P11SlotId, transport: Arc<dyn ProxyTransport>) -> Self {
        Self { slot_id, transport }
    }

    fn call<T: Serialize>(
        &self,
        action: ProxyAction,
        payload: Option<&T>,
    ) -> Result<Option<ProxyMessage>, TokenError> {
        let request = msg::encode_request(self.slot_id.id, payload)?;
        trace!(slot = %self.slot_id, %action, bytes = request.len(), "proxy request");
        let response = self.transport.send(action, &request)?;
        msg::decode_response(&response)
    }
}

fn required(reply: Option<ProxyMessage>, expected: &'static str) -> Result<ProxyMessage, TokenError> {
    reply.ok_or(TokenError::UnexpectedResponse { expected })
}

fn expect_key_id(reply: Option<ProxyMessage>) -> Result<P11KeyId, TokenError> {
    match required(reply, "KeyIdMessage")? {
        ProxyMessage::KeyIdMessage(message) => Ok(message.key_id),
        _ => Err(TokenError::UnexpectedResponse {
            expected: "KeyIdMessage",
        }),
    }
}

fn expect_bytes(reply: Option<ProxyMessage>) -> Result<Vec<u8>, TokenError> {
    match required(reply, "ByteArrayMessage")? {
        ProxyMessage::ByteArrayMessage(message) => Ok(message.value),
        _ => Err(TokenError::UnexpectedResponse {
            expected: "ByteArrayMessage",
        }),
    }
}

fn expect_int(reply: Option<ProxyMessage>) -> Result<u32, TokenError> {
    match required(reply, "IntMessage")? {
        ProxyMessage::IntMessage(message) => Ok(message.value),
        _ => Err(TokenError::UnexpectedResponse {
            expected: "IntMessage",
        }),
    }
}

fn expect_long_array(reply: Option<ProxyMessage>) -> Result<Vec<u64>, TokenError> {
    match required(reply, "LongArrayMessage")? {
        ProxyMessage::LongArrayMessage(message) => Ok(message.value),
        _ => Err(TokenError::UnexpectedResponse {
            expected: "LongArrayMessage",
        }),
    }
}

impl SlotBackend for ProxyP11Slot {
    fn object_exists(&self, id: Option<&[u8]>, label: Option<&str>) -> Result<bool, TokenError> {
        let request = msg::IdLabelRequest {
            id: id.map(<[u8]>::to_vec),
            label: label.map(str::to_string),
        };
        match required(
            self.call(ProxyAction::ObjectExistsByIdLabel, Some(&request))?,
            "BooleanMessage",
        )? {
            ProxyMessage::BooleanMessage(message) => Ok(message.value),
            _ => Err(TokenError::UnexpectedResponse {
                expected: "BooleanMessage",
            }),
        }
    }

    fn key_id(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<Option<P11KeyId>, TokenError> {
        let request = msg::IdLabelRequest {
            id: id.map(<[u8]>::to_vec),
            label: label.map(str::to_string),
        };
        match self.call(ProxyAction::KeyIdByIdLabel, Some(&request))? {
            // a missing key is a legal null reply here
            None => Ok(None),
            Some(ProxyMessage::KeyIdMessage(message)) => Ok(Some(message.key_id)),
            Some(_) => Err(TokenError::UnexpectedResponse {
                expected: "KeyIdMessage",
            }),
        }
    }

    fn key(&self, key_id: &P11KeyId) -> Result<Option<P11Key>, TokenError> {
        let request = msg::KeyByKeyIdRequest {
            key_id: key_id.clone(),
        };
        match self.call(ProxyAction::KeyByKeyId, Some(&request))? {
            None => Ok(None),
            Some(ProxyMessage::P11KeyResponse(message)) => {
                Ok(Some(P11Key::new(message.key_id, message.params)))
            }
            Some(_) => Err(TokenError::UnexpectedResponse {
                expected: "P11KeyResponse",
            }),
        }
    }

    fn mechanisms(&self) -> Result<Vec<u64>, TokenError> {
        match required(
            self.call::<()>(ProxyAction::MechInfos, None)?,
            "GetMechanismInfosResponse",
        )? {
            ProxyMessage::GetMechanismInfosResponse(message) => {
                Ok(message.infos.iter().map(|info| info.mechanism).collect())
            }
            _ => Err(TokenError::UnexpectedResponse {
                expected: "GetMechanismInfosResponse",
            }),
        }
    }

    fn generate_secret_key(
        &self,
        key_type: u64,
        key_len_bits: Option<u32>,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let request = msg::GenSecretKeyRequest {
            key_type,
            key_len_bits,
            control: control.clone(),
        };
        expect_key_id(self.call(ProxyAction::GenSecretKey, Some(&request))?)
    }

    fn import_secret_key(
        &self,
        key_type: u64,
        value: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let request = msg::ImportSecretKeyRequest {
            key_type,
            value: value.to_vec(),
            control: control.clone(),
        };
        expect_key_id(self.call(ProxyAction::ImportSecretKey, Some(&request))?)
    }

    fn generate_rsa_keypair(
        &self,
        keysize: u32,
        public_exponent: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let request = msg::GenRsaKeypairRequest {
            keysize,
            public_exponent: public_exponent.to_vec(),
            control: Some(control.clone()),
        };
        expect_key_id(self.call(ProxyAction::GenRsaKeypair, Some(&request))?)
    }

    fn generate_rsa_keypair_otf(
        &self,
        keysize: u32,
        public_exponent: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        let request = msg::GenRsaKeypairRequest {
            keysize,
            public_exponent: public_exponent.to_vec(),
            control: None,
        };
        expect_bytes(self.call(ProxyAction::GenRsaKeypairOtf, Some(&request))?)
    }

    fn generate_dsa_keypair(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let request = msg::GenDsaKeypairRequest {
            p: p.to_vec(),
            q: q.to_vec(),
            g: g.to_vec(),
            control: Some(control.clone()),
        };
        expect_key_id(self.call(ProxyAction::GenDsaKeypair, Some(&request))?)
    }

    fn generate_dsa_keypair_by_size(
        &self,
        p_bits: u32,
        q_bits: u32,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let request = msg::GenDsaKeypair2Request {
            p_bits,
            q_bits,
            control: control.clone(),
        };
        expect_key_id(self.call(ProxyAction::GenDsaKeypair2, Some(&request))?)
    }

    fn generate_dsa_keypair_otf(
        &self,
        p: &[u8],
        q: &[u8],
        g: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        let request = msg::GenDsaKeypairRequest {
            p: p.to_vec(),
            q: q.to_vec(),
            g: g.to_vec(),
            control: None,
        };
        expect_bytes(self.call(ProxyAction::GenDsaKeypairOtf, Some(&request))?)
    }

    fn generate_ec_keypair(
        &self,
        curve_oid: &str,
        control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        let request = msg::GenEcKeypairRequest {
            curve_oid: curve_oid.to_string(),
            control: Some(control.clone()),
        };
        expect_key_id(self.call(ProxyAction::GenEcKeypair, Some(&request))?)
    }

    fn generate_ec_keypair_otf(&self, curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        let request = msg::GenEcKeypairRequest {
            curve_oid: curve_oid.to_string(),
            control: None,
        };
        expect_bytes(self.call(ProxyAction::GenEcKeypairOtf, Some(&request))?)
    }

    fn generate_edwards_keypair(
        &self,
        _curve_oid: &str,
        _control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        Err(TokenError::Unsupported(
            "Edwards key generation has no proxy action",
        ))
    }

    fn generate_edwards_keypair_otf(&self, _curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        Err(TokenError::Unsupported(
            "Edwards key generation has no proxy action",
        ))
    }

    fn generate_montgomery_keypair(
        &self,
        _curve_oid: &str,
        _control: &NewKeyControl,
    ) -> Result<P11KeyId, TokenError> {
        Err(TokenError::Unsupported(
            "Montgomery key generation has no proxy action",
        ))
    }

    fn generate_montgomery_keypair_otf(&self, _curve_oid: &str) -> Result<Vec<u8>, TokenError> {
        Err(TokenError::Unsupported(
            "Montgomery key generation has no proxy action",
        ))
    }

    fn generate_sm2_keypair(&self, control: &NewKeyControl) -> Result<P11KeyId, TokenError> {
        let request = msg::GenSm2KeypairRequest {
            control: control.clone(),
        };
        expect_key_id(self.call(ProxyAction::GenSm2Keypair, Some(&request))?)
    }

    fn generate_sm2_keypair_otf(&self) -> Result<Vec<u8>, TokenError> {
        expect_bytes(self.call::<()>(ProxyAction::GenSm2KeypairOtf, None)?)
    }

    fn sign(
        &self,
        mechanism: u64,
        params: Option<&P11Params>,
        key_handle: u64,
        content: &[u8],
    ) -> Result<Vec<u8>, TokenError> {
        let request = msg::SignRequest {
            mechanism,
            params: params.cloned(),
            key_handle,
            content: content.to_vec(),
        };
        expect_bytes(self.call(ProxyAction::Sign, Some(&request))?)
    }

    fn digest_secret_key(&self, mechanism: u64, key_handle: u64) -> Result<Vec<u8>, TokenError> {
        let request = msg::DigestSecretKeyRequest {
            mechanism,
            key_handle,
        };
        expect_bytes(self.call(ProxyAction::DigestSecretKey, Some(&request))?)
    }

    fn destroy_all_objects(&self) -> Result<u32, TokenError> {
        expect_int(self.call::<()>(ProxyAction::DestroyAllObjects, None)?)
    }

    fn destroy_objects_by_handle(&self, handles: &[u64]) -> Result<Vec<u64>, TokenError> {
        let request = msg::HandlesRequest {
            handles: handles.to_vec(),
        };
        expect_long_array(self.call(ProxyAction::DestroyObjectsByHandle, Some(&request))?)
    }

    fn destroy_objects_by_id_label(
        &self,
        id: Option<&[u8]>,
        label: Option<&str>,
    ) -> Result<u32, TokenError> {
        let request = msg::IdLabelRequest {
            id: id.map(<[u8]>::to_vec),
            label: label.map(str::to_string),
        };
        expect_int(self.call(ProxyAction::DestroyObjectsByIdLabel, Some(&request))?)
    }

    fn show_details(
        &self,
        out: &mut dyn io::Write,
        handle: Option<u64>,
        verbose: bool,
    ) -> io::Result<()> {
        let request = msg::ShowDetailsRequest { handle, verbose };
        let rendered = expect_bytes(
            self.call(ProxyAction::ShowDetails, Some(&request))
                .map_err(io::Error::other)?,
        )
        .map_err(io::Error::other)?;
        out.write_all(&rendered)
    }
}
