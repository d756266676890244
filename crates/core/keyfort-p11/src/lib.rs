//! Uniform PKCS#11 access for the keyfort stack.
//!
//! One slot contract, three interchangeable backends:
//!
//! - **native** — a vendor PKCS#11 library driven through cryptoki;
//! - **emulator** — a software token keeping passphrase-wrapped keys on
//!   disk, for development and air-gapped test setups;
//! - **hsmproxy** — a client tunneling every operation to a remote HSM
//!   server over a CBOR-framed request/response protocol.
//!
//! Modules are described declaratively (TOML): slot filters, per-slot
//! mechanism filters, password retriever chains and object-creation
//! defaults. The slot base enforces the invariants that keep the backends
//! behaviorally equivalent; see [`slot::P11Slot`].

mod asn1;
pub mod config;
mod emulator;
pub mod error;
pub mod filter;
pub mod mech;
pub mod module;
mod native;
pub mod password;
pub mod proxy;
pub mod signer;
pub mod slot;
pub mod types;

pub use config::ModuleType;
pub use config::P11ModuleConf;
pub use error::InvalidConf;
pub use error::PasswordError;
pub use error::TokenError;
pub use module::P11CryptService;
pub use module::P11CryptServiceFactory;
pub use module::P11Module;
pub use password::PassThroughResolver;
pub use password::PasswordResolver;
pub use proxy::ProxyTransport;
pub use signer::concurrent_signer;
pub use signer::P11SignEngine;
pub use slot::P11Slot;
pub use types::EcCurve;
pub use types::KeyParams;
pub use types::NewKeyControl;
pub use types::ObjectClass;
pub use types::P11Key;
pub use types::P11KeyId;
pub use types::P11Params;
pub use types::P11SlotId;
pub use types::RsaPssParams;
