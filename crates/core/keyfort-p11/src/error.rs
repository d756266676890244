use crate::types::P11SlotId;

/// The one error type backends surface through the slot contract. Callers
/// never need to know which backend failed.
#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("unknown slot {0}")]
    UnknownSlot(P11SlotId),

    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("unsupported mechanism: {0}")]
    UnsupportedMechanism(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("the token is read-only")]
    ReadOnly,

    #[error("duplicate id: an object with id {0} exists")]
    DuplicateId(String),

    #[error("duplicate label: an object with label {0} exists")]
    DuplicateLabel(String),

    #[error("response is not a {expected}")]
    UnexpectedResponse { expected: &'static str },

    #[error("transport failed for action {action}: {source}")]
    Transport {
        action: &'static str,
        source: anyhow::Error,
    },

    #[error("PKCS#11 driver error")]
    Driver(#[from] cryptoki::error::Error),

    #[error("token storage failure")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error(transparent)]
    Security(#[from] keyfort_security::SecurityError),

    #[error("{0}")]
    Other(String),
}

impl TokenError {
    pub fn other(msg: impl Into<String>) -> Self {
        TokenError::Other(msg.into())
    }
}

/// Rejections raised while building a module from its configuration.
#[derive(thiserror::Error, Debug)]
pub enum InvalidConf {
    #[error("no native library matches operating system {0}")]
    NoMatchingLibrary(String),

    #[error("mechanism filter references unknown mechanism set {0}")]
    UnknownMechanismSet(String),

    #[error("maxMessageSize must be at least 256, got {0}")]
    MaxMessageSizeTooSmall(usize),

    #[error("user type {0} cannot be resolved")]
    BadUserType(String),

    #[error("login as the security officer is forbidden")]
    SoUserForbidden,

    #[error("slot filter must set an index or an id")]
    EmptySlotFilter,

    #[error("unknown module type {0}")]
    UnknownModuleType(String),

    #[error("invalid value for {field}: {value}")]
    BadValue { field: &'static str, value: String },

    #[error("configuration is not valid TOML")]
    Toml(#[from] toml::de::Error),
}

/// The injected password resolver could not produce a password.
#[derive(thiserror::Error, Debug)]
pub enum PasswordError {
    #[error("no resolver accepts protocol {0}")]
    UnknownProtocol(String),

    #[error("could not resolve password: {0}")]
    CannotResolve(String),
}
