//! The emulator backend: a software HSM storing wrapped keys on disk.
//!
//! Each slot is a directory `<index>-<id>` under the module's base
//! directory; a missing base directory is populated with a fresh pair of
//! empty slots so a module can be pointed at an empty path and used
//! immediately.

mod cryptor;
mod keys;
mod slot;
mod store;

#[cfg(test)]
mod tests;

use std::collections::HashSet;

use camino::Utf8PathBuf;
use tracing::debug;
use tracing::warn;

use crate::config::P11ModuleConf;
use crate::error::TokenError;
use crate::slot::P11Slot;
use crate::types::P11SlotId;

const DEFAULT_SLOT_COUNT: u64 = 2;
const DEFAULT_FIRST_SLOT_ID: u64 = 800_000;
const DEFAULT_DIR_NAME: &str = "pkcs11-emulator";

/// Opens (creating if necessary) the emulator slots of one module.
pub(crate) fn open_slots(conf: &P11ModuleConf) -> Result<Vec<P11Slot>, TokenError> {
    let base_dir = match &conf.native_library {
        Some(path) => path.clone(),
        None => default_base_dir()?,
    };

    if !base_dir.as_std_path().is_dir() {
        debug!(module = %conf.name, dir = %base_dir, "creating emulator directory");
        populate_base_dir(&base_dir)?;
    }

    let mut names: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(base_dir.as_std_path())? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();

    let mut seen_indexes = HashSet::new();
    let mut seen_ids = HashSet::new();
    let mut slots = Vec::new();
    for name in names {
        let Some(slot_id) = parse_slot_dir_name(&name) else {
            warn!(module = %conf.name, dir = %name, "ignoring malformed slot directory");
            continue;
        };
        if !seen_indexes.insert(slot_id.index) {
            return Err(TokenError::other(format!(
                "duplicate slot index {} in {base_dir}",
                slot_id.index
            )));
        }
        if !seen_ids.insert(slot_id.id) {
            return Err(TokenError::other(format!(
                "duplicate slot id {} in {base_dir}",
                slot_id.id
            )));
        }
        if !conf.slot_accepted(&slot_id) {
            debug!(module = %conf.name, slot = %slot_id, "slot filtered out");
            continue;
        }

        let passwords = conf
            .passwords
            .get_passwords(&slot_id)?
            .ok_or_else(|| TokenError::other(format!("no password configured for slot {slot_id}")))?;
        let password = passwords
            .first()
            .ok_or_else(|| TokenError::other(format!("empty password list for slot {slot_id}")))?;

        let backend = slot::EmulatorP11Slot::new(slot_id, base_dir.join(&name), password)?;
        slots.push(P11Slot::new(conf, slot_id, Box::new(backend)));
    }

    debug!(module = %conf.name, slots = slots.len(), "emulator module ready");
    Ok(slots)
}

fn default_base_dir() -> Result<Utf8PathBuf, TokenError> {
    Utf8PathBuf::from_path_buf(std::env::temp_dir().join(DEFAULT_DIR_NAME))
        .map_err(|path| TokenError::other(format!("non-UTF-8 temp dir {}", path.display())))
}

fn populate_base_dir(base_dir: &Utf8PathBuf) -> Result<(), TokenError> {
    for index in 0..DEFAULT_SLOT_COUNT {
        let dir = base_dir.join(format!("{index}-{}", DEFAULT_FIRST_SLOT_ID + index));
        std::fs::create_dir_all(dir.as_std_path())?;
        std::fs::write(
            dir.join(store::FILE_SLOT_INFO).as_std_path(),
            format!("{}=true\n", store::PROP_NAMED_CURVE_SUPPORTED),
        )?;
    }
    Ok(())
}

fn parse_slot_dir_name(name: &str) -> Option<P11SlotId> {
    let (index, id) = name.split_once('-')?;
    Some(P11SlotId::new(index.parse().ok()?, id.parse().ok()?))
}
