//! Concurrency primitives shared by the keyfort signing stack.
//!
//! A [`ConcurrentSigner`] multiplexes parallel signing requests over a
//! bounded set of single-threaded engines, and the [`digest`] module keeps a
//! process-wide bag of reusable message-digest engines so hot hashing paths
//! don't reallocate digest state on every call.

mod bag;
mod digest;
mod error;
mod pool;

pub use bag::Bag;
pub use digest::hash;
pub use digest::HashAlgo;
pub use error::SecurityError;
pub use pool::default_signer_timeout;
pub use pool::ConcurrentSigner;
pub use pool::SignEngine;
pub use pool::SignerLease;

/// Environment variable overriding the default signer borrow timeout, in
/// milliseconds. Values are clamped to [0, 60000]; unset or unparseable
/// values fall back to 10000.
pub const SIGNSERVICE_TIMEOUT_ENV: &str = "KEYFORT_SIGNSERVICE_TIMEOUT";
