//! Declarative module configuration.
//!
//! A module is described by a TOML document (see the crate docs for the full
//! option table), deserialized into the raw schema below and validated into
//! an immutable [`P11ModuleConf`]. Everything that can be rejected is
//! rejected here, before any backend is touched.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;
use tracing::warn;

use crate::error::InvalidConf;
use crate::filter::MechFilterEntry;
use crate::filter::MechanismSet;
use crate::filter::P11MechFilter;
use crate::filter::SlotIdFilter;
use crate::mech;
use crate::password::P11PasswordsRetriever;
use crate::password::PasswordResolver;
use crate::types::NewObjectConf;

pub const MIN_MESSAGE_SIZE: usize = 256;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 16384;
const MECHANISM_SET_ALL: &str = "ALL";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModuleType {
    Native,
    Emulator,
    HsmProxy,
}

impl ModuleType {
    fn parse(raw: &str) -> Result<Self, InvalidConf> {
        match raw {
            "native" => Ok(ModuleType::Native),
            "emulator" => Ok(ModuleType::Emulator),
            "hsmproxy" => Ok(ModuleType::HsmProxy),
            other => Err(InvalidConf::UnknownModuleType(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct P11ModuleRaw {
    pub name: String,
    #[serde(rename = "type")]
    pub module_type: String,
    #[serde(default)]
    pub native_libraries: Vec<NativeLibraryRaw>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub max_message_size: Option<usize>,
    #[serde(default)]
    pub num_sessions: Option<usize>,
    /// Milliseconds to wait for an idle session before giving up.
    #[serde(default)]
    pub new_session_timeout: Option<u64>,
    #[serde(default)]
    pub secret_key_types: Vec<String>,
    #[serde(default)]
    pub key_pair_types: Vec<String>,
    #[serde(default)]
    pub include_slots: Vec<SlotIdFilter>,
    #[serde(default)]
    pub exclude_slots: Vec<SlotIdFilter>,
    #[serde(default)]
    pub mechanism_sets: Vec<MechanismSetRaw>,
    #[serde(default)]
    pub mechanism_filters: Vec<MechanismFilterRaw>,
    #[serde(default)]
    pub password_sets: Vec<PasswordSetRaw>,
    #[serde(default)]
    pub new_object_conf: Option<NewObjectConfRaw>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NativeLibraryRaw {
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub operation_systems: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MechanismSetRaw {
    pub name: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MechanismFilterRaw {
    #[serde(default)]
    pub slots: Vec<SlotIdFilter>,
    pub mechanism_set: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PasswordSetRaw {
    #[serde(default)]
    pub slots: Vec<SlotIdFilter>,
    pub passwords: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewObjectConfRaw {
    #[serde(default)]
    pub id_length: Option<usize>,
    #[serde(default)]
    pub ignore_label: bool,
}

/// Validated, immutable module configuration.
pub struct P11ModuleConf {
    pub name: String,
    pub module_type: ModuleType,
    /// Selected for the current operating system; `None` when the
    /// configuration declares no libraries (emulator, proxy).
    pub native_library: Option<Utf8PathBuf>,
    pub read_only: bool,
    pub user_type: u64,
    pub user_name: Option<String>,
    pub max_message_size: usize,
    pub num_sessions: Option<usize>,
    pub new_session_timeout: Option<Duration>,
    pub secret_key_types: Vec<u64>,
    pub key_pair_types: Vec<u64>,
    pub include_slots: Vec<SlotIdFilter>,
    pub exclude_slots: Vec<SlotIdFilter>,
    pub mech_filter: Arc<P11MechFilter>,
    pub passwords: Arc<P11PasswordsRetriever>,
    pub new_object_conf: NewObjectConf,
}

impl std::fmt::Debug for P11ModuleConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P11ModuleConf")
            .field("name", &self.name)
            .field("module_type", &self.module_type)
            .field("native_library", &self.native_library)
            .field("read_only", &self.read_only)
            .field("user_type", &self.user_type)
            .field("user_name", &self.user_name)
            .field("max_message_size", &self.max_message_size)
            .field("num_sessions", &self.num_sessions)
            .field("new_session_timeout", &self.new_session_timeout)
            .field("secret_key_types", &self.secret_key_types)
            .field("key_pair_types", &self.key_pair_types)
            .field("include_slots", &self.include_slots)
            .field("exclude_slots", &self.exclude_slots)
            .field("new_object_conf", &self.new_object_conf)
            .finish_non_exhaustive()
    }
}

impl P11ModuleConf {
    pub fn from_toml(
        document: &str,
        resolver: Arc<dyn PasswordResolver>,
    ) -> Result<Self, InvalidConf> {
        let raw: P11ModuleRaw = toml::from_str(document)?;
        Self::new(raw, resolver)
    }

    pub fn new(
        raw: P11ModuleRaw,
        resolver: Arc<dyn PasswordResolver>,
    ) -> Result<Self, InvalidConf> {
        let module_type = ModuleType::parse(&raw.module_type)?;

        let native_library = select_library(&raw.native_libraries)?;

        let max_message_size = raw.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);
        if max_message_size < MIN_MESSAGE_SIZE {
            return Err(InvalidConf::MaxMessageSizeTooSmall(max_message_size));
        }

        let user = raw.user.as_deref().unwrap_or("CKU_USER").to_uppercase();
        let user_type = mech::cku_code(&user)
            .or_else(|| mech::parse_code(&user))
            .ok_or_else(|| InvalidConf::BadUserType(user.clone()))?;
        if user_type == mech::CKU_SO {
            return Err(InvalidConf::SoUserForbidden);
        }

        for filter in raw.include_slots.iter().chain(&raw.exclude_slots) {
            filter.validate()?;
        }

        let mech_filter = build_mech_filter(&raw.mechanism_sets, &raw.mechanism_filters)?;

        let mut passwords = P11PasswordsRetriever::new(resolver);
        for set in raw.password_sets {
            for filter in &set.slots {
                filter.validate()?;
            }
            passwords.add_entry(set.slots, set.passwords);
        }

        let new_object_conf = match raw.new_object_conf {
            Some(conf) => NewObjectConf {
                id_length: conf.id_length.unwrap_or(NewObjectConf::default().id_length),
                ignore_label: conf.ignore_label,
            },
            None => NewObjectConf::default(),
        };

        Ok(Self {
            name: raw.name,
            module_type,
            native_library,
            read_only: raw.readonly,
            user_type,
            user_name: raw.user_name,
            max_message_size,
            num_sessions: raw.num_sessions,
            new_session_timeout: raw.new_session_timeout.map(Duration::from_millis),
            secret_key_types: parse_key_types(&raw.secret_key_types),
            key_pair_types: parse_key_types(&raw.key_pair_types),
            include_slots: raw.include_slots,
            exclude_slots: raw.exclude_slots,
            mech_filter: Arc::new(mech_filter),
            passwords: Arc::new(passwords),
            new_object_conf,
        })
    }

    /// True when `slot` survives the include/exclude filters.
    pub fn slot_accepted(&self, slot: &crate::types::P11SlotId) -> bool {
        let included =
            self.include_slots.is_empty() || self.include_slots.iter().any(|f| f.matches(slot));
        let excluded = self.exclude_slots.iter().any(|f| f.matches(slot));
        included && !excluded
    }
}

fn select_library(libraries: &[NativeLibraryRaw]) -> Result<Option<Utf8PathBuf>, InvalidConf> {
    if libraries.is_empty() {
        return Ok(None);
    }
    let os = std::env::consts::OS.to_lowercase();
    for library in libraries {
        let matches = library.operation_systems.is_empty()
            || library.operation_systems.iter().any(|listed| {
                let listed = listed.to_lowercase();
                listed.contains(&os) || os.contains(&listed)
            });
        if matches {
            return Ok(Some(library.path.clone()));
        }
    }
    Err(InvalidConf::NoMatchingLibrary(os))
}

fn build_mech_filter(
    sets: &[MechanismSetRaw],
    filters: &[MechanismFilterRaw],
) -> Result<P11MechFilter, InvalidConf> {
    let registry: HashMap<&str, &MechanismSetRaw> =
        sets.iter().map(|set| (set.name.as_str(), set)).collect();

    let mut entries = Vec::with_capacity(filters.len());
    for filter in filters {
        for slot_filter in &filter.slots {
            slot_filter.validate()?;
        }
        let set = registry
            .get(filter.mechanism_set.as_str())
            .ok_or_else(|| InvalidConf::UnknownMechanismSet(filter.mechanism_set.clone()))?;

        let include: HashSet<String> = set.include.iter().cloned().collect();
        let include = if include.is_empty() || include.contains(MECHANISM_SET_ALL) {
            None
        } else {
            Some(include)
        };
        entries.push(MechFilterEntry::new(
            filter.slots.clone(),
            MechanismSet {
                include,
                exclude: set.exclude.iter().cloned().collect(),
            },
        ));
    }
    Ok(P11MechFilter::new(entries))
}

fn parse_key_types(raw: &[String]) -> Vec<u64> {
    raw.iter()
        .filter_map(|value| {
            let code = if value.starts_with("CKK_") {
                mech::ckk_code(value)
            } else {
                mech::parse_code(value)
            };
            if code.is_none() {
                // lenient like the drivers are, but visible
                warn!(key_type = %value, "cannot parse key type, dropped from list");
            }
            code
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::PassThroughResolver;
    use crate::types::P11SlotId;
    use assert_matches::assert_matches;

    fn resolver() -> Arc<dyn PasswordResolver> {
        Arc::new(PassThroughResolver)
    }

    fn minimal(module_type: &str) -> String {
        format!("name = \"hsm1\"\ntype = \"{module_type}\"\n")
    }

    #[test]
    fn minimal_emulator_conf_builds() {
        let conf = P11ModuleConf::from_toml(&minimal("emulator"), resolver()).unwrap();
        assert_eq!(conf.module_type, ModuleType::Emulator);
        assert_eq!(conf.user_type, mech::CKU_USER);
        assert_eq!(conf.max_message_size, 16384);
        assert!(conf.native_library.is_none());
        assert!(!conf.read_only);
    }

    #[test]
    fn so_user_is_rejected() {
        let doc = format!("{}user = \"cku_so\"\n", minimal("emulator"));
        assert_matches!(
            P11ModuleConf::from_toml(&doc, resolver()),
            Err(InvalidConf::SoUserForbidden)
        );
    }

    #[test]
    fn small_max_message_size_is_rejected() {
        let doc = format!("{}max_message_size = 128\n", minimal("emulator"));
        assert_matches!(
            P11ModuleConf::from_toml(&doc, resolver()),
            Err(InvalidConf::MaxMessageSizeTooSmall(128))
        );
    }

    #[test]
    fn library_selection_honors_os_list() {
        let doc = format!(
            r#"{}
[[native_libraries]]
path = "/opt/other/pkcs11.so"
operation_systems = ["definitely-not-this-os"]

[[native_libraries]]
path = "/opt/any/pkcs11.so"
"#,
            minimal("native")
        );
        let conf = P11ModuleConf::from_toml(&doc, resolver()).unwrap();
        assert_eq!(
            conf.native_library.as_deref().map(|p| p.as_str()),
            Some("/opt/any/pkcs11.so")
        );
    }

    #[test]
    fn no_matching_library_is_rejected() {
        let doc = format!(
            r#"{}
[[native_libraries]]
path = "/opt/other/pkcs11.so"
operation_systems = ["definitely-not-this-os"]
"#,
            minimal("native")
        );
        assert_matches!(
            P11ModuleConf::from_toml(&doc, resolver()),
            Err(InvalidConf::NoMatchingLibrary(_))
        );
    }

    #[test]
    fn unknown_mechanism_set_reference_is_rejected() {
        let doc = format!(
            r#"{}
[[mechanism_filters]]
mechanism_set = "nope"
"#,
            minimal("emulator")
        );
        assert_matches!(
            P11ModuleConf::from_toml(&doc, resolver()),
            Err(InvalidConf::UnknownMechanismSet(name)) if name == "nope"
        );
    }

    #[test]
    fn mechanism_set_all_means_no_include_restriction() {
        let doc = format!(
            r#"{}
[[mechanism_sets]]
name = "basic"
include = ["ALL"]
exclude = ["CKM_RSA_X_509"]

[[mechanism_filters]]
slots = [{{ index = 0 }}]
mechanism_set = "basic"
"#,
            minimal("emulator")
        );
        let conf = P11ModuleConf::from_toml(&doc, resolver()).unwrap();
        let slot0 = P11SlotId::new(0, 800_000);
        assert!(!conf.mech_filter.is_permitted("hsm1", &slot0, mech::CKM_RSA_X_509));
        assert!(conf.mech_filter.is_permitted("hsm1", &slot0, mech::CKM_ECDSA));
    }

    #[test]
    fn key_types_parse_names_numbers_and_drop_garbage() {
        let doc = format!(
            "{}secret_key_types = [\"CKK_AES\", \"0x10\", \"garbage\"]\n",
            minimal("emulator")
        );
        let conf = P11ModuleConf::from_toml(&doc, resolver()).unwrap();
        assert_eq!(
            conf.secret_key_types,
            vec![mech::CKK_AES, mech::CKK_GENERIC_SECRET]
        );
    }

    #[test]
    fn slot_filters_apply_to_acceptance() {
        let doc = format!(
            "{}include_slots = [{{ index = 0 }}, {{ id = 900000 }}]\nexclude_slots = [{{ index = 5 }}]\n",
            minimal("emulator")
        );
        let conf = P11ModuleConf::from_toml(&doc, resolver()).unwrap();
        assert!(conf.slot_accepted(&P11SlotId::new(0, 1)));
        assert!(conf.slot_accepted(&P11SlotId::new(9, 900_000)));
        assert!(!conf.slot_accepted(&P11SlotId::new(2, 2)));
        let doc = format!("{}exclude_slots = [{{ index = 5 }}]\n", minimal("emulator"));
        let conf = P11ModuleConf::from_toml(&doc, resolver()).unwrap();
        assert!(conf.slot_accepted(&P11SlotId::new(0, 1)));
        assert!(!conf.slot_accepted(&P11SlotId::new(5, 1)));
    }
}
