//! Modules and the crypt-service factory: the entry points a CA stack uses
//! to reach a slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::debug;

use crate::config::ModuleType;
use crate::config::P11ModuleConf;
use crate::emulator;
use crate::error::TokenError;
use crate::native;
use crate::proxy;
use crate::proxy::ProxyTransport;
use crate::slot::P11Slot;
use crate::types::P11SlotId;

/// One opened module: its configuration plus the slots that survived the
/// filters, in index order.
#[derive(Debug)]
pub struct P11Module {
    conf: Arc<P11ModuleConf>,
    slots: Vec<Arc<P11Slot>>,
}

impl P11Module {
    /// Builds the backend the configuration names. The proxy backend needs
    /// its transport injected; the other types must not get one.
    pub fn build(
        conf: Arc<P11ModuleConf>,
        transport: Option<Arc<dyn ProxyTransport>>,
    ) -> Result<Self, TokenError> {
        let slots = match conf.module_type {
            ModuleType::Native => native::open_slots(&conf)?,
            ModuleType::Emulator => emulator::open_slots(&conf)?,
            ModuleType::HsmProxy => {
                let transport = transport.ok_or_else(|| {
                    TokenError::other("hsmproxy module requires an injected transport")
                })?;
                proxy::open_slots(&conf, transport)?
            }
        };
        let mut slots: Vec<Arc<P11Slot>> = slots.into_iter().map(Arc::new).collect();
        slots.sort_by_key(|slot| slot.slot_id().index);
        Ok(Self { conf, slots })
    }

    pub fn name(&self) -> &str {
        &self.conf.name
    }

    pub fn conf(&self) -> &P11ModuleConf {
        &self.conf
    }

    pub fn slots(&self) -> &[Arc<P11Slot>] {
        &self.slots
    }

    pub fn slot(&self, slot_id: &P11SlotId) -> Result<Arc<P11Slot>, TokenError> {
        self.slots
            .iter()
            .find(|slot| slot.slot_id() == *slot_id)
            .cloned()
            .ok_or(TokenError::UnknownSlot(*slot_id))
    }

    pub fn slot_by_index(&self, index: u32) -> Result<Arc<P11Slot>, TokenError> {
        self.slots
            .iter()
            .find(|slot| slot.slot_id().index == index)
            .cloned()
            .ok_or_else(|| TokenError::other(format!("no slot with index {index}")))
    }

    pub fn slot_by_id(&self, id: u64) -> Result<Arc<P11Slot>, TokenError> {
        self.slots
            .iter()
            .find(|slot| slot.slot_id().id == id)
            .cloned()
            .ok_or_else(|| TokenError::other(format!("no slot with id {id}")))
    }
}

/// A module opened for use.
#[derive(Debug)]
pub struct P11CryptService {
    module: Arc<P11Module>,
}

impl P11CryptService {
    pub fn new(module: Arc<P11Module>) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &Arc<P11Module> {
        &self.module
    }

    pub fn slot(&self, slot_id: &P11SlotId) -> Result<Arc<P11Slot>, TokenError> {
        self.module.slot(slot_id)
    }
}

/// Builds and caches one [`P11CryptService`] per configured module name.
#[derive(Default)]
pub struct P11CryptServiceFactory {
    confs: Mutex<HashMap<String, Arc<P11ModuleConf>>>,
    transports: Mutex<HashMap<String, Arc<dyn ProxyTransport>>>,
    services: Mutex<HashMap<String, Arc<P11CryptService>>>,
}

impl P11CryptServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_conf(&self, conf: P11ModuleConf) {
        self.confs
            .lock()
            .unwrap()
            .insert(conf.name.clone(), Arc::new(conf));
    }

    /// Registers the transport a `hsmproxy` module of this name will use.
    pub fn set_transport(&self, module: impl Into<String>, transport: Arc<dyn ProxyTransport>) {
        self.transports.lock().unwrap().insert(module.into(), transport);
    }

    pub fn service(&self, module: &str) -> Result<Arc<P11CryptService>, TokenError> {
        if let Some(service) = self.services.lock().unwrap().get(module) {
            return Ok(Arc::clone(service));
        }

        let conf = self
            .confs
            .lock()
            .unwrap()
            .get(module)
            .cloned()
            .ok_or_else(|| TokenError::other(format!("unknown module {module}")))?;
        let transport = self.transports.lock().unwrap().get(module).cloned();

        debug!(%module, "building crypt service");
        let built = Arc::new(P11CryptService::new(Arc::new(P11Module::build(
            conf, transport,
        )?)));

        let mut services = self.services.lock().unwrap();
        // keep whichever service a racing builder registered first
        Ok(Arc::clone(
            services
                .entry(module.to_string())
                .or_insert(built),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::PassThroughResolver;
    use assert_matches::assert_matches;

    fn emulator_conf(dir: &str) -> P11ModuleConf {
        let document = format!(
            r#"
name = "softtoken"
type = "emulator"

[[native_libraries]]
path = "{dir}"

[[password_sets]]
passwords = ["THRU:test-1234"]
"#
        );
        P11ModuleConf::from_toml(&document, Arc::new(PassThroughResolver)).unwrap()
    }

    #[test]
    fn factory_builds_and_caches_services() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("hsm");

        let factory = P11CryptServiceFactory::new();
        factory.add_conf(emulator_conf(dir.to_str().unwrap()));

        let first = factory.service("softtoken").unwrap();
        let second = factory.service("softtoken").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let module = first.module();
        assert_eq!(module.name(), "softtoken");
        assert_eq!(module.slots().len(), 2);

        let slot_id = module.slots()[0].slot_id();
        assert!(first.slot(&slot_id).is_ok());
        assert!(module.slot_by_index(1).is_ok());
        assert!(module.slot_by_id(800_001).is_ok());
        assert_matches!(
            module.slot(&crate::types::P11SlotId::new(9, 9)),
            Err(TokenError::UnknownSlot(_))
        );
    }

    #[test]
    fn unknown_module_is_rejected() {
        let factory = P11CryptServiceFactory::new();
        assert_matches!(factory.service("nope"), Err(TokenError::Other(_)));
    }

    #[test]
    fn proxy_module_without_transport_is_rejected() {
        let conf = P11ModuleConf::from_toml(
            "name = \"p\"\ntype = \"hsmproxy\"\n",
            Arc::new(PassThroughResolver),
        )
        .unwrap();
        assert_matches!(
            P11Module::build(Arc::new(conf), None),
            Err(TokenError::Other(_))
        );
    }
}
