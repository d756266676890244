//! The native backend: a thin adapter over a vendor PKCS#11 library loaded
//! through the cryptoki wrapper.

mod convert;
mod slot;

use cryptoki::context::CInitializeArgs;
use cryptoki::context::CInitializeFlags;
use cryptoki::context::Pkcs11;
use cryptoki::error::Error;
use cryptoki::error::RvError;
use tracing::debug;
use tracing::warn;

use crate::config::P11ModuleConf;
use crate::error::TokenError;
use crate::slot::P11Slot;
use crate::types::P11SlotId;

/// Loads the configured library, initializes it (tolerating a concurrent
/// initialization by another component of the process) and opens every slot
/// with a present, initialized token that survives the filters.
pub(crate) fn open_slots(conf: &P11ModuleConf) -> Result<Vec<P11Slot>, TokenError> {
    let library = conf
        .native_library
        .as_ref()
        .ok_or_else(|| TokenError::other("native module requires a native library path"))?;

    debug!(module = %conf.name, path = %library, "loading PKCS#11 library");
    let context = Pkcs11::new(library)?;
    match context.initialize(CInitializeArgs::new(CInitializeFlags::OS_LOCKING_OK)) {
        Ok(()) => {}
        Err(Error::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {
            warn!(module = %conf.name, "PKCS#11 library was already initialized, continuing");
        }
        Err(err) => return Err(err.into()),
    }

    let mut slots = Vec::new();
    for (index, ck_slot) in context.get_slots_with_token()?.into_iter().enumerate() {
        let token_info = context.get_token_info(ck_slot)?;
        if !token_info.token_initialized() {
            debug!(module = %conf.name, slot = index, "skipping uninitialized token");
            continue;
        }
        let slot_id = P11SlotId::new(index as u32, ck_slot.id());
        if !conf.slot_accepted(&slot_id) {
            debug!(module = %conf.name, slot = %slot_id, "slot filtered out");
            continue;
        }

        let passwords = conf
            .passwords
            .get_passwords(&slot_id)?
            .unwrap_or_default();

        let backend = slot::NativeP11Slot::open(
            context.clone(),
            ck_slot,
            slot_id,
            conf.user_type,
            &passwords,
            conf.read_only,
            conf.num_sessions,
            conf.new_session_timeout,
            conf.max_message_size,
        )?;
        slots.push(P11Slot::new(conf, slot_id, Box::new(backend)));
    }
    debug!(module = %conf.name, slots = slots.len(), "native module ready");
    Ok(slots)
}
