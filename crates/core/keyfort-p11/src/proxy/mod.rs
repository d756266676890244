//! The proxy client backend: PKCS#11 operations tunneled to a remote HSM
//! server, many slots multiplexed over one injected transport.

pub mod msg;
mod slot;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::config::P11ModuleConf;
use crate::error::TokenError;
use crate::proxy::msg::ProxyAction;
use crate::proxy::msg::ProxyMessage;
use crate::slot::P11Slot;
use crate::types::P11SlotId;

/// The byte transport the proxy rides on. Implementations exchange opaque
/// frames; whatever connection management, retry or framing they do is
/// theirs. Failures surface as token errors.
pub trait ProxyTransport: Send + Sync {
    fn send(&self, action: ProxyAction, request: &[u8]) -> Result<Vec<u8>, TokenError>;
}

/// Queries the server for its slots and builds one proxy slot per survivor
/// of the include/exclude filters. Slot indexes are the positions in the
/// server's reply.
pub(crate) fn open_slots(
    conf: &P11ModuleConf,
    transport: Arc<dyn ProxyTransport>,
) -> Result<Vec<P11Slot>, TokenError> {
    match module_call(&transport, ProxyAction::ModuleCaps)? {
        Some(ProxyMessage::IntMessage(caps)) => {
            debug!(module = %conf.name, server_max_message_size = caps.value, "proxy module caps");
            if (caps.value as usize) < conf.max_message_size {
                warn!(
                    module = %conf.name,
                    server = caps.value,
                    configured = conf.max_message_size,
                    "server max message size is below the configured one"
                );
            }
        }
        Some(_) => {
            return Err(TokenError::UnexpectedResponse {
                expected: "IntMessage",
            })
        }
        None => warn!(module = %conf.name, "server reported no module caps"),
    }

    let slot_ids = match module_call(&transport, ProxyAction::SlotIds)? {
        Some(ProxyMessage::LongArrayMessage(message)) => message.value,
        _ => {
            return Err(TokenError::UnexpectedResponse {
                expected: "LongArrayMessage",
            })
        }
    };

    let mut slots = Vec::new();
    for (index, id) in slot_ids.into_iter().enumerate() {
        let slot_id = P11SlotId::new(index as u32, id);
        if !conf.slot_accepted(&slot_id) {
            debug!(module = %conf.name, slot = %slot_id, "slot filtered out");
            continue;
        }
        let backend = slot::ProxyP11Slot::new(slot_id, Arc::clone(&transport));
        slots.push(P11Slot::new(conf, slot_id, Box::new(backend)));
    }
    debug!(module = %conf.name, slots = slots.len(), "proxy module ready");
    Ok(slots)
}

/// Module-scoped calls carry slot id 0 and a null payload.
fn module_call(
    transport: &Arc<dyn ProxyTransport>,
    action: ProxyAction,
) -> Result<Option<ProxyMessage>, TokenError> {
    let request = msg::encode_request::<()>(0, None)?;
    let response = transport.send(action, &request)?;
    msg::decode_response(&response)
}
