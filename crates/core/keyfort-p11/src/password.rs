//! Token passwords: ordered per-slot entries resolved through an injected
//! [`PasswordResolver`].
//!
//! Passwords travel as [`Zeroizing`] buffers so callers can log in and let
//! the material wipe itself when dropped.

use zeroize::Zeroizing;

use crate::error::PasswordError;
use crate::filter::any_matches;
use crate::filter::SlotIdFilter;
use crate::types::P11SlotId;

/// Resolves password hints like `THRU:secret` or `PBE:...` into cleartext.
///
/// Implementations may decrypt, prompt, or pass through; the retriever only
/// requires that a hint whose protocol is accepted resolves to fresh bytes
/// the caller owns.
pub trait PasswordResolver: Send + Sync {
    fn can_resolve_protocol(&self, protocol: &str) -> bool;

    fn resolve(&self, hint: &str) -> Result<Zeroizing<Vec<u8>>, PasswordError>;
}

pub const PROTOCOL_THRU: &str = "THRU";

/// Pass-through resolver: `THRU:<password>` resolves to `<password>`.
#[derive(Debug, Default)]
pub struct PassThroughResolver;

impl PasswordResolver for PassThroughResolver {
    fn can_resolve_protocol(&self, protocol: &str) -> bool {
        protocol == PROTOCOL_THRU
    }

    fn resolve(&self, hint: &str) -> Result<Zeroizing<Vec<u8>>, PasswordError> {
        let secret = hint
            .strip_prefix(PROTOCOL_THRU)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| PasswordError::CannotResolve(format!("not a THRU hint: {hint}")))?;
        Ok(Zeroizing::new(secret.as_bytes().to_vec()))
    }
}

struct PasswordEntry {
    slot_filters: Vec<SlotIdFilter>,
    passwords: Vec<String>,
}

/// Ordered password entries of one module; first matching entry wins.
pub struct P11PasswordsRetriever {
    entries: Vec<PasswordEntry>,
    resolver: std::sync::Arc<dyn PasswordResolver>,
}

impl P11PasswordsRetriever {
    pub fn new(resolver: std::sync::Arc<dyn PasswordResolver>) -> Self {
        Self {
            entries: Vec::new(),
            resolver,
        }
    }

    pub fn add_entry(&mut self, slot_filters: Vec<SlotIdFilter>, passwords: Vec<String>) {
        self.entries.push(PasswordEntry {
            slot_filters,
            passwords,
        });
    }

    /// The passwords for logging into `slot`'s token, or `None` when no
    /// entry covers the slot.
    pub fn get_passwords(
        &self,
        slot: &P11SlotId,
    ) -> Result<Option<Vec<Zeroizing<Vec<u8>>>>, PasswordError> {
        for entry in &self.entries {
            if !any_matches(&entry.slot_filters, slot) {
                continue;
            }
            let mut resolved = Vec::with_capacity(entry.passwords.len());
            for hint in &entry.passwords {
                resolved.push(self.resolve_hint(hint)?);
            }
            return Ok(Some(resolved));
        }
        Ok(None)
    }

    fn resolve_hint(&self, hint: &str) -> Result<Zeroizing<Vec<u8>>, PasswordError> {
        match hint.split_once(':') {
            Some((protocol, _)) if self.resolver.can_resolve_protocol(protocol) => {
                self.resolver.resolve(hint)
            }
            // no protocol prefix: the hint is the password
            _ => Ok(Zeroizing::new(hint.as_bytes().to_vec())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn thru_resolver_accepts_only_its_protocol() {
        let resolver = PassThroughResolver;
        assert!(resolver.can_resolve_protocol("THRU"));
        assert!(!resolver.can_resolve_protocol("PBE"));
        assert_eq!(
            resolver.resolve("THRU:test-1234").unwrap().as_slice(),
            b"test-1234"
        );
        assert!(resolver.resolve("PBE:abc").is_err());
    }

    #[test]
    fn first_matching_entry_wins() {
        let mut retriever = P11PasswordsRetriever::new(Arc::new(PassThroughResolver));
        retriever.add_entry(
            vec![SlotIdFilter {
                index: Some(0),
                id: None,
            }],
            vec!["THRU:slot0-pin".into()],
        );
        retriever.add_entry(vec![], vec!["fallback-pin".into()]);

        let slot0 = retriever.get_passwords(&P11SlotId::new(0, 7)).unwrap().unwrap();
        assert_eq!(slot0[0].as_slice(), b"slot0-pin");

        // bare hint without protocol resolves to itself
        let other = retriever.get_passwords(&P11SlotId::new(3, 9)).unwrap().unwrap();
        assert_eq!(other[0].as_slice(), b"fallback-pin");
    }
}
