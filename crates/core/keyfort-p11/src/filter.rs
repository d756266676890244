//! Slot filters and the per-slot mechanism filter.
//!
//! A mechanism filter is an ordered list of entries. The first entry whose
//! slot-filter list matches a slot decides the policy for that slot; slots no
//! entry matches are unrestricted. Mechanism names resolve to codes lazily
//! the first time an entry sees a module, because vendor mechanisms only
//! resolve against that module's own table.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::warn;

use crate::error::InvalidConf;
use crate::mech;
use crate::types::P11SlotId;

/// Matches slots by index, by id, or by both.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotIdFilter {
    pub index: Option<u32>,
    pub id: Option<u64>,
}

impl SlotIdFilter {
    pub fn validate(&self) -> Result<(), InvalidConf> {
        if self.index.is_none() && self.id.is_none() {
            return Err(InvalidConf::EmptySlotFilter);
        }
        Ok(())
    }

    pub fn matches(&self, slot: &P11SlotId) -> bool {
        if let Some(index) = self.index {
            if index != slot.index {
                return false;
            }
        }
        if let Some(id) = self.id {
            if id != slot.id {
                return false;
            }
        }
        self.index.is_some() || self.id.is_some()
    }
}

/// Returns true when any filter in the list matches, or the list is empty
/// (an empty list means "all slots").
pub fn any_matches(filters: &[SlotIdFilter], slot: &P11SlotId) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(slot))
}

/// Mechanism names of one entry, with `None` meaning "all mechanisms".
#[derive(Clone, Debug)]
pub struct MechanismSet {
    pub include: Option<HashSet<String>>,
    pub exclude: HashSet<String>,
}

#[derive(Debug, Default)]
struct ResolvedSet {
    include: Option<HashSet<u64>>,
    exclude: HashSet<u64>,
}

/// One ordered entry of the mechanism filter.
#[derive(Debug)]
pub struct MechFilterEntry {
    slot_filters: Vec<SlotIdFilter>,
    set: MechanismSet,
    // name->code resolution cached per module identity
    resolved: Mutex<HashMap<String, ResolvedSet>>,
}

impl MechFilterEntry {
    pub fn new(slot_filters: Vec<SlotIdFilter>, set: MechanismSet) -> Self {
        Self {
            slot_filters,
            set,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    fn matches_slot(&self, slot: &P11SlotId) -> bool {
        any_matches(&self.slot_filters, slot)
    }

    fn permits(&self, module: &str, mechanism: u64) -> bool {
        let mut cache = self.resolved.lock().unwrap();
        let resolved = cache
            .entry(module.to_string())
            .or_insert_with(|| resolve(&self.set, module));
        if resolved.exclude.contains(&mechanism) {
            return false;
        }
        match &resolved.include {
            None => true,
            Some(include) => include.contains(&mechanism),
        }
    }
}

fn resolve(set: &MechanismSet, module: &str) -> ResolvedSet {
    let resolve_names = |names: &HashSet<String>| -> HashSet<u64> {
        names
            .iter()
            .filter_map(|name| {
                let code = mech::ckm_code(name).or_else(|| mech::parse_code(name));
                if code.is_none() {
                    warn!(%module, mechanism = %name, "cannot resolve mechanism name, ignored");
                }
                code
            })
            .collect()
    };
    ResolvedSet {
        include: set.include.as_ref().map(resolve_names),
        exclude: resolve_names(&set.exclude),
    }
}

/// The ordered mechanism filter of one module configuration.
#[derive(Debug, Default)]
pub struct P11MechFilter {
    entries: Vec<MechFilterEntry>,
}

impl P11MechFilter {
    pub fn new(entries: Vec<MechFilterEntry>) -> Self {
        Self { entries }
    }

    /// Accepts everything; the filter used when none is configured.
    pub fn permit_all() -> Self {
        Self::default()
    }

    pub fn is_permitted(&self, module: &str, slot: &P11SlotId, mechanism: u64) -> bool {
        for entry in &self.entries {
            if entry.matches_slot(slot) {
                return entry.permits(module, mechanism);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mech::CKM_ECDSA;
    use crate::mech::CKM_RSA_PKCS;
    use crate::mech::CKM_RSA_X_509;

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn slot0_excluding_raw_rsa() -> P11MechFilter {
        let entry = MechFilterEntry::new(
            vec![SlotIdFilter {
                index: Some(0),
                id: None,
            }],
            MechanismSet {
                include: None,
                exclude: names(&["CKM_RSA_X_509"]),
            },
        );
        P11MechFilter::new(vec![entry])
    }

    #[test]
    fn first_matching_entry_decides() {
        let filter = slot0_excluding_raw_rsa();
        let slot0 = P11SlotId::new(0, 800_000);
        let slot1 = P11SlotId::new(1, 800_001);

        assert!(!filter.is_permitted("m", &slot0, CKM_RSA_X_509));
        assert!(filter.is_permitted("m", &slot0, CKM_RSA_PKCS));
        // no entry matches slot 1, everything is permitted there
        assert!(filter.is_permitted("m", &slot1, CKM_RSA_X_509));
    }

    #[test]
    fn exclude_wins_over_include() {
        let entry = MechFilterEntry::new(
            vec![],
            MechanismSet {
                include: Some(names(&["CKM_ECDSA", "CKM_RSA_PKCS"])),
                exclude: names(&["CKM_ECDSA"]),
            },
        );
        let filter = P11MechFilter::new(vec![entry]);
        let slot = P11SlotId::new(0, 1);
        assert!(!filter.is_permitted("m", &slot, CKM_ECDSA));
        assert!(filter.is_permitted("m", &slot, CKM_RSA_PKCS));
    }

    #[test]
    fn resolution_is_cached_per_module() {
        let filter = slot0_excluding_raw_rsa();
        let slot = P11SlotId::new(0, 1);
        // two different module identities share the entry without clashing
        assert!(!filter.is_permitted("module-a", &slot, CKM_RSA_X_509));
        assert!(!filter.is_permitted("module-b", &slot, CKM_RSA_X_509));
        assert!(filter.is_permitted("module-a", &slot, CKM_ECDSA));
    }

    #[test]
    fn unknown_names_are_dropped_not_fatal() {
        let entry = MechFilterEntry::new(
            vec![],
            MechanismSet {
                include: None,
                exclude: names(&["CKM_DOES_NOT_EXIST"]),
            },
        );
        let filter = P11MechFilter::new(vec![entry]);
        assert!(filter.is_permitted("m", &P11SlotId::new(0, 1), CKM_RSA_PKCS));
    }
}
