use std::sync::Arc;
use std::sync::Mutex;

use assert_matches::assert_matches;

use crate::config::P11ModuleConf;
use crate::error::TokenError;
use crate::password::PassThroughResolver;
use crate::proxy::msg;
use crate::proxy::msg::ProxyAction;
use crate::proxy::msg::ProxyMessage;
use crate::proxy::open_slots;
use crate::proxy::ProxyTransport;
use crate::slot::P11Slot;
use crate::types::NewKeyControl;
use crate::types::ObjectClass;
use crate::types::P11KeyId;

const SLOT0_ID: u64 = 800_000;

type Handler = dyn Fn(ProxyAction, &[u8]) -> Result<Vec<u8>, TokenError> + Send + Sync;

struct MockTransport {
    handler: Box<Handler>,
    seen: Mutex<Vec<ProxyAction>>,
}

impl MockTransport {
    fn new(
        handler: impl Fn(ProxyAction, &[u8]) -> Result<Vec<u8>, TokenError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<ProxyAction> {
        self.seen.lock().unwrap().clone()
    }
}

impl ProxyTransport for MockTransport {
    fn send(&self, action: ProxyAction, request: &[u8]) -> Result<Vec<u8>, TokenError> {
        self.seen.lock().unwrap().push(action);
        (self.handler)(action, request)
    }
}

fn reply(message: ProxyMessage) -> Result<Vec<u8>, TokenError> {
    msg::encode_response(Some(&message))
}

fn null_reply() -> Result<Vec<u8>, TokenError> {
    msg::encode_response(None)
}

/// Answers the two module-init actions; everything else goes to `handler`.
fn transport_with(
    handler: impl Fn(ProxyAction, &[u8]) -> Result<Vec<u8>, TokenError> + Send + Sync + 'static,
) -> Arc<MockTransport> {
    MockTransport::new(move |action, request| match action {
        ProxyAction::ModuleCaps => reply(ProxyMessage::IntMessage(msg::IntMessage { value: 16384 })),
        ProxyAction::SlotIds => reply(ProxyMessage::LongArrayMessage(msg::LongArrayMessage {
            value: vec![SLOT0_ID, SLOT0_ID + 1],
        })),
        other => handler(other, request),
    })
}

fn proxy_slots(transport: Arc<MockTransport>) -> Vec<P11Slot> {
    let conf = P11ModuleConf::from_toml(
        "name = \"proxy1\"\ntype = \"hsmproxy\"\n",
        Arc::new(PassThroughResolver),
    )
    .unwrap();
    open_slots(&conf, transport).unwrap()
}

fn sample_key_id() -> P11KeyId {
    P11KeyId::new(0xAB00, ObjectClass::PrivateKey, 0, vec![0xAA], "rsa-p")
}

#[test]
fn module_init_enumerates_server_slots() {
    let transport = transport_with(|action, _| {
        panic!("unexpected action {action}");
    });
    let slots = proxy_slots(Arc::clone(&transport));
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].slot_id().index, 0);
    assert_eq!(slots[0].slot_id().id, SLOT0_ID);
    assert_eq!(
        transport.seen(),
        vec![ProxyAction::ModuleCaps, ProxyAction::SlotIds]
    );
}

#[test]
fn gen_rsa_keypair_frames_slot_id_and_payload() {
    let transport = transport_with(|action, request| match action {
        ProxyAction::ObjectExistsByIdLabel => {
            reply(ProxyMessage::BooleanMessage(msg::BooleanMessage {
                value: false,
            }))
        }
        ProxyAction::GenRsaKeypair => {
            let (slot_id, payload): (u64, Option<msg::GenRsaKeypairRequest>) =
                msg::decode_request(request).unwrap();
            assert_eq!(slot_id, SLOT0_ID);
            let payload = payload.unwrap();
            assert_eq!(payload.keysize, 2048);
            assert_eq!(payload.public_exponent, vec![0x01, 0x00, 0x01]);
            assert_eq!(payload.control.as_ref().unwrap().label, "rsa-p");
            reply(ProxyMessage::KeyIdMessage(msg::KeyIdMessage {
                key_id: sample_key_id(),
            }))
        }
        other => panic!("unexpected action {other}"),
    });

    let slots = proxy_slots(transport);
    let control = NewKeyControl::new("rsa-p").with_id(vec![0xAA]);
    let key_id = slots[0]
        .generate_rsa_keypair(2048, &[0x01, 0x00, 0x01], &control)
        .unwrap();
    assert_eq!(key_id, sample_key_id());
}

#[test]
fn mistyped_reply_is_a_protocol_error() {
    let transport = transport_with(|action, _| match action {
        ProxyAction::ObjectExistsByIdLabel => {
            reply(ProxyMessage::BooleanMessage(msg::BooleanMessage {
                value: false,
            }))
        }
        ProxyAction::GenRsaKeypair => reply(ProxyMessage::ByteArrayMessage(msg::ByteArrayMessage {
            value: vec![1, 2, 3],
        })),
        other => panic!("unexpected action {other}"),
    });

    let slots = proxy_slots(transport);
    let control = NewKeyControl::new("rsa-p").with_id(vec![0xAA]);
    let err = slots[0]
        .generate_rsa_keypair(2048, &[0x01, 0x00, 0x01], &control)
        .unwrap_err();
    assert_matches!(
        err,
        TokenError::UnexpectedResponse {
            expected: "KeyIdMessage"
        }
    );
    assert_eq!(err.to_string(), "response is not a KeyIdMessage");
}

#[test]
fn ec_otf_uses_the_otf_action_tag() {
    let transport = transport_with(|action, request| match action {
        ProxyAction::GenEcKeypairOtf => {
            let (_, payload): (u64, Option<msg::GenEcKeypairRequest>) =
                msg::decode_request(request).unwrap();
            let payload = payload.unwrap();
            assert_eq!(payload.curve_oid, crate::types::EcCurve::P256_OID);
            assert!(payload.control.is_none());
            reply(ProxyMessage::ByteArrayMessage(msg::ByteArrayMessage {
                value: vec![0x30, 0x82],
            }))
        }
        other => panic!("unexpected action {other}"),
    });

    let slots = proxy_slots(Arc::clone(&transport));
    let private_key_info = slots[0]
        .generate_ec_keypair_otf(crate::types::EcCurve::P256_OID)
        .unwrap();
    assert_eq!(private_key_info, vec![0x30, 0x82]);
    assert!(transport.seen().contains(&ProxyAction::GenEcKeypairOtf));
}

#[test]
fn missing_key_is_a_null_reply_not_an_error() {
    let transport = transport_with(|action, _| match action {
        ProxyAction::KeyIdByIdLabel => null_reply(),
        other => panic!("unexpected action {other}"),
    });
    let slots = proxy_slots(transport);
    assert_eq!(slots[0].get_key_id(None, Some("nope")).unwrap(), None);
}

#[test]
fn edwards_generation_is_unsupported_over_the_proxy() {
    let transport = transport_with(|action, _| panic!("unexpected action {action}"));
    let slots = proxy_slots(transport);
    assert_matches!(
        slots[0].generate_edwards_keypair_otf(crate::types::EcCurve::ED25519_OID),
        Err(TokenError::Unsupported(_))
    );
}

#[test]
fn destroy_by_handle_returns_failed_handles() {
    let transport = transport_with(|action, request| match action {
        ProxyAction::DestroyObjectsByHandle => {
            let (_, payload): (u64, Option<msg::HandlesRequest>) =
                msg::decode_request(request).unwrap();
            assert_eq!(payload.unwrap().handles, vec![1, 2, 3]);
            reply(ProxyMessage::LongArrayMessage(msg::LongArrayMessage {
                value: vec![2],
            }))
        }
        other => panic!("unexpected action {other}"),
    });
    let slots = proxy_slots(transport);
    assert_eq!(slots[0].destroy_objects_by_handle(&[1, 2, 3]).unwrap(), vec![2]);
}

#[test]
fn transport_failures_surface_as_token_errors() {
    let transport = transport_with(|action, _| match action {
        ProxyAction::Sign => Err(TokenError::Transport {
            action: "sign",
            source: anyhow::anyhow!("connection reset"),
        }),
        other => panic!("unexpected action {other}"),
    });
    let slots = proxy_slots(transport);
    assert_matches!(
        slots[0].sign(crate::mech::CKM_RSA_PKCS, None, 0xAB00, b"x"),
        Err(TokenError::Transport { .. })
    );
}

#[test]
fn sign_round_trips_content_and_params() {
    let transport = transport_with(|action, request| match action {
        ProxyAction::Sign => {
            let (slot_id, payload): (u64, Option<msg::SignRequest>) =
                msg::decode_request(request).unwrap();
            assert_eq!(slot_id, SLOT0_ID + 1);
            let payload = payload.unwrap();
            assert_eq!(payload.mechanism, crate::mech::CKM_SHA256_RSA_PKCS_PSS);
            assert!(payload.params.is_some());
            reply(ProxyMessage::ByteArrayMessage(msg::ByteArrayMessage {
                value: vec![0x5A; 256],
            }))
        }
        other => panic!("unexpected action {other}"),
    });
    let slots = proxy_slots(transport);
    let params = crate::types::P11Params::RsaPss(crate::types::RsaPssParams {
        hash_mech: crate::mech::CKM_SHA256,
        mgf_hash_mech: crate::mech::CKM_SHA256,
        salt_len: 32,
    });
    let signature = slots[1]
        .sign(
            crate::mech::CKM_SHA256_RSA_PKCS_PSS,
            Some(&params),
            0xAB00,
            b"payload",
        )
        .unwrap();
    assert_eq!(signature.len(), 256);
}
