use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

use crate::bag::Bag;
use crate::error::SecurityError;
use crate::SIGNSERVICE_TIMEOUT_ENV;

const MAX_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// The process-wide default borrow timeout, tunable through
/// [`SIGNSERVICE_TIMEOUT_ENV`]. Read once, on first use.
pub fn default_signer_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let ms = match std::env::var(SIGNSERVICE_TIMEOUT_ENV) {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) => ms.min(MAX_TIMEOUT_MS),
                Err(_) => {
                    warn!(
                        value = %raw,
                        "ignoring unparseable {SIGNSERVICE_TIMEOUT_ENV}, using default"
                    );
                    DEFAULT_TIMEOUT_MS
                }
            },
            Err(_) => DEFAULT_TIMEOUT_MS,
        };
        Duration::from_millis(ms)
    })
}

/// A single-threaded signing engine.
///
/// An engine is never used by two threads at once; the pool guarantees
/// exclusive access between borrow and return.
pub trait SignEngine: Send {
    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, SecurityError>;
}

/// Exclusive lease on an engine, returned by [`ConcurrentSigner::borrow`].
///
/// Dropping the lease puts the engine back into the pool, so a successful
/// borrow can never leak an engine, early returns and panics included.
pub struct SignerLease<'a> {
    bag: &'a Bag<Box<dyn SignEngine>>,
    engine: Option<Box<dyn SignEngine>>,
}

impl std::fmt::Debug for SignerLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerLease")
            .field("engine_present", &self.engine.is_some())
            .finish_non_exhaustive()
    }
}

impl Deref for SignerLease<'_> {
    type Target = Box<dyn SignEngine>;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref().unwrap()
    }
}

impl DerefMut for SignerLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.engine.as_mut().unwrap()
    }
}

impl Drop for SignerLease<'_> {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.bag.requite(engine);
        }
    }
}

/// A thread-safe signer multiplexing over a bounded set of engines.
///
/// All engines must have been built over the same key; which engine serves a
/// given call is unspecified.
pub struct ConcurrentSigner {
    name: String,
    mac: bool,
    engines: Bag<Box<dyn SignEngine>>,
    total: usize,
    sha1_of_mac_key: Mutex<Option<[u8; 20]>>,
}

impl ConcurrentSigner {
    pub fn new(name: impl Into<String>, engines: Vec<Box<dyn SignEngine>>) -> Self {
        Self::build(name, false, engines)
    }

    /// A signer over MAC engines; only these accept [`Self::set_sha1_of_mac_key`].
    pub fn new_mac(name: impl Into<String>, engines: Vec<Box<dyn SignEngine>>) -> Self {
        Self::build(name, true, engines)
    }

    fn build(name: impl Into<String>, mac: bool, engines: Vec<Box<dyn SignEngine>>) -> Self {
        let name = name.into();
        let total = engines.len();
        debug!(signer = %name, engines = total, "building concurrent signer");
        Self {
            name,
            mac,
            engines: Bag::new(engines),
            total,
            sha1_of_mac_key: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_mac(&self) -> bool {
        self.mac
    }

    /// Total number of engines, borrowed or idle.
    pub fn engine_count(&self) -> usize {
        self.total
    }

    /// Borrows an engine, blocking up to `timeout`.
    pub fn borrow(&self, timeout: Duration) -> Result<SignerLease<'_>, SecurityError> {
        match self.engines.borrow(timeout) {
            Some(engine) => Ok(SignerLease {
                bag: &self.engines,
                engine: Some(engine),
            }),
            None => Err(SecurityError::NoIdleSigner(timeout)),
        }
    }

    /// Signs one message with the next idle engine.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let mut lease = self.borrow(default_signer_timeout())?;
        lease.sign(data)
    }

    /// Signs every chunk with a single borrowed engine.
    pub fn sign_batch(&self, chunks: &[&[u8]]) -> Result<Vec<Vec<u8>>, SecurityError> {
        let mut lease = self.borrow(default_signer_timeout())?;
        let mut signatures = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            signatures.push(lease.sign(chunk)?);
        }
        Ok(signatures)
    }

    /// Probes one engine with a fixed message. Never fails; any error or an
    /// empty signature reads as unhealthy.
    pub fn is_healthy(&self) -> bool {
        const PROBE: [u8; 4] = [1, 2, 3, 4];
        match self.borrow(default_signer_timeout()) {
            Ok(mut lease) => match lease.sign(&PROBE) {
                Ok(signature) => !signature.is_empty(),
                Err(err) => {
                    warn!(signer = %self.name, %err, "health probe failed");
                    false
                }
            },
            Err(err) => {
                warn!(signer = %self.name, %err, "health probe could not borrow");
                false
            }
        }
    }

    /// Records the SHA-1 fingerprint of the MAC key this signer wraps.
    pub fn set_sha1_of_mac_key(&self, digest: &[u8]) -> Result<(), SecurityError> {
        if !self.mac {
            return Err(SecurityError::InvalidArgument(format!(
                "signer {} is not a MAC signer",
                self.name
            )));
        }
        let tag: [u8; 20] = digest.try_into().map_err(|_| {
            SecurityError::InvalidArgument(format!(
                "SHA-1 digest must be 20 bytes, got {}",
                digest.len()
            ))
        })?;
        *self.sha1_of_mac_key.lock().unwrap() = Some(tag);
        Ok(())
    }

    pub fn sha1_of_mac_key(&self) -> Option<[u8; 20]> {
        *self.sha1_of_mac_key.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Instant;

    struct EchoEngine;

    impl SignEngine for EchoEngine {
        fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
            Ok(data.to_vec())
        }
    }

    fn pool_of(n: usize) -> ConcurrentSigner {
        let engines: Vec<Box<dyn SignEngine>> =
            (0..n).map(|_| Box::new(EchoEngine) as _).collect();
        ConcurrentSigner::new("test", engines)
    }

    #[test]
    fn third_borrow_times_out_then_waiter_wins() {
        let signer = Arc::new(pool_of(2));
        let first = signer.borrow(Duration::ZERO).unwrap();
        let _second = signer.borrow(Duration::ZERO).unwrap();

        let started = Instant::now();
        let err = signer.borrow(Duration::from_millis(100)).unwrap_err();
        let waited = started.elapsed();
        assert_matches!(err, SecurityError::NoIdleSigner(_));
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(200));

        let waiter = {
            let signer = Arc::clone(&signer);
            std::thread::spawn(move || signer.borrow(Duration::from_secs(5)).is_ok())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(first);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn engines_return_to_pool_after_sign() {
        let signer = pool_of(2);
        for _ in 0..10 {
            assert_eq!(signer.sign(b"abc").unwrap(), b"abc");
        }
        // quiescent: everything borrowed has been requited
        assert!(signer.borrow(Duration::ZERO).is_ok());
        assert!(signer.is_healthy());
    }

    #[test]
    fn batch_signs_every_chunk_with_one_engine() {
        let signer = pool_of(1);
        let signatures = signer.sign_batch(&[b"a".as_slice(), b"bc".as_slice()]).unwrap();
        assert_eq!(signatures, vec![b"a".to_vec(), b"bc".to_vec()]);
    }

    #[test]
    fn mac_key_digest_is_guarded() {
        let signer = pool_of(1);
        assert_matches!(
            signer.set_sha1_of_mac_key(&[0u8; 20]),
            Err(SecurityError::InvalidArgument(_))
        );

        let mac: Vec<Box<dyn SignEngine>> = vec![Box::new(EchoEngine)];
        let mac_signer = ConcurrentSigner::new_mac("mac", mac);
        assert_matches!(
            mac_signer.set_sha1_of_mac_key(&[0u8; 19]),
            Err(SecurityError::InvalidArgument(_))
        );
        mac_signer.set_sha1_of_mac_key(&[7u8; 20]).unwrap();
        assert_eq!(mac_signer.sha1_of_mac_key(), Some([7u8; 20]));
    }
}
