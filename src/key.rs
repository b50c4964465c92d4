//! Key normalisation and hashing.
//!
//! Application keys are validated and canonicalised exactly once per call.
//! The canonical key is the application key with the configured prefix
//! prepended (`<prefix>:<key>`). When hashing is forced, or when auto-hash is
//! enabled and the canonical key exceeds the configured maximum length, a
//! fixed-width digest of the canonical key is used on the wire instead.

use crate::error::{Error, Result};
use std::hash::Hasher;
use tracing::warn;

/// Key hashing algorithm, selected by the `<app>.hash.algo` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    /// SipHash-2-4, the default.
    SipHash24,
    /// 64-bit xxHash.
    Xx64,
}

impl HashAlgo {
    /// Parse an algorithm name. Unknown names fall back to the default.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "siphash24" | "siphash" => HashAlgo::SipHash24,
            "xx64" | "xxhash64" => HashAlgo::Xx64,
            other => {
                warn!(algo = %other, "unknown hash algorithm, using siphash24");
                HashAlgo::SipHash24
            }
        }
    }

    /// Digest the input into a fixed-width lower-hex wire key.
    pub fn digest(&self, input: &str) -> String {
        let value = match self {
            HashAlgo::SipHash24 => {
                let mut hasher = siphasher::sip::SipHasher24::new();
                hasher.write(input.as_bytes());
                hasher.finish()
            }
            HashAlgo::Xx64 => {
                let mut hasher = twox_hash::XxHash64::with_seed(0);
                hasher.write(input.as_bytes());
                hasher.finish()
            }
        };
        format!("{value:016x}")
    }

    /// Stable identifier carried on the normalised key so downstream readers
    /// interpret collisions correctly.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgo::SipHash24 => "siphash24",
            HashAlgo::Xx64 => "xx64",
        }
    }
}

/// A validated, canonicalised cache key.
///
/// Immutable triple of (application key, canonical key, optional hashed key),
/// produced once per call by the client. A duet replica expects the
/// un-prefixed application key as its canonical form.
#[derive(Debug, Clone)]
pub struct CacheKey {
    app_key: String,
    canonical_key: String,
    hashed_key: Option<String>,
    algo: HashAlgo,
}

impl CacheKey {
    /// Normalise an application key.
    ///
    /// Fails with [`Error::InvalidKey`] when the key is empty, contains
    /// whitespace, or the canonical form exceeds `max_key_length` and hashing
    /// is not in effect.
    pub fn new(
        app_key: &str,
        prefix: Option<&str>,
        force_hash: bool,
        auto_hash: bool,
        max_key_length: usize,
        algo: HashAlgo,
    ) -> Result<Self> {
        if app_key.is_empty() {
            return Err(Error::InvalidKey("key cannot be empty".to_string()));
        }
        if let Some(pos) = app_key.find(char::is_whitespace) {
            return Err(Error::InvalidKey(format!(
                "key `{app_key}` contains whitespace at position {pos}"
            )));
        }

        let canonical_key = match prefix {
            Some(p) => format!("{p}:{app_key}"),
            None => app_key.to_string(),
        };

        let hashed_key = if force_hash || (auto_hash && canonical_key.len() > max_key_length) {
            Some(algo.digest(&canonical_key))
        } else {
            None
        };

        if hashed_key.is_none() && canonical_key.len() > max_key_length {
            return Err(Error::InvalidKey(format!(
                "key is too long ({} > {max_key_length})",
                canonical_key.len()
            )));
        }

        Ok(Self {
            app_key: app_key.to_string(),
            canonical_key,
            hashed_key,
            algo,
        })
    }

    /// The caller-supplied application key.
    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    /// Canonical key as seen by a replica. Duet replicas get the un-prefixed
    /// application key.
    pub fn canonical(&self, duet: bool) -> &str {
        if duet {
            &self.app_key
        } else {
            &self.canonical_key
        }
    }

    /// The hashed wire key, if hashing is in effect for this key.
    pub fn hashed(&self) -> Option<&str> {
        self.hashed_key.as_deref()
    }

    /// The key actually sent on the wire for the given replica.
    pub fn derived(&self, duet: bool) -> &str {
        match &self.hashed_key {
            Some(h) => h,
            None => self.canonical(duet),
        }
    }

    /// The hashing algorithm this key was normalised under.
    pub fn algo(&self) -> HashAlgo {
        self.algo
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.hashed_key {
            Some(h) => write!(f, "{} (hashed {h})", self.canonical_key),
            None => f.write_str(&self.canonical_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(key: &str, prefix: Option<&str>) -> Result<CacheKey> {
        CacheKey::new(key, prefix, false, false, 200, HashAlgo::SipHash24)
    }

    #[test]
    fn test_canonical_with_prefix() {
        let k = plain("user:42", Some("cid")).unwrap();
        assert_eq!(k.app_key(), "user:42");
        assert_eq!(k.canonical(false), "cid:user:42");
        assert_eq!(k.canonical(true), "user:42");
        assert!(k.hashed().is_none());
        assert_eq!(k.derived(false), "cid:user:42");
    }

    #[test]
    fn test_rejects_empty_and_whitespace() {
        assert!(matches!(plain("", None), Err(Error::InvalidKey(_))));
        assert!(matches!(plain("a b", None), Err(Error::InvalidKey(_))));
        assert!(matches!(plain("a\tb", None), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_too_long_without_hashing() {
        let long = "k".repeat(300);
        let err = CacheKey::new(&long, None, false, false, 200, HashAlgo::SipHash24);
        assert!(matches!(err, Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_auto_hash_kicks_in_over_limit() {
        let long = "k".repeat(300);
        let k = CacheKey::new(&long, None, false, true, 200, HashAlgo::SipHash24).unwrap();
        let hashed = k.hashed().unwrap().to_string();
        assert_eq!(hashed.len(), 16);
        assert_eq!(k.derived(false), hashed);

        // Short keys stay unhashed under auto-hash.
        let short = CacheKey::new("short", None, false, true, 200, HashAlgo::SipHash24).unwrap();
        assert!(short.hashed().is_none());
    }

    #[test]
    fn test_force_hash() {
        let k = CacheKey::new("abc", Some("p"), true, false, 200, HashAlgo::SipHash24).unwrap();
        assert!(k.hashed().is_some());
        assert_eq!(k.derived(false), k.hashed().unwrap());
        assert_eq!(k.derived(true), k.hashed().unwrap());
    }

    #[test]
    fn test_digest_deterministic_per_algo() {
        let a = HashAlgo::SipHash24.digest("cid:user:42");
        let b = HashAlgo::SipHash24.digest("cid:user:42");
        assert_eq!(a, b);
        assert_ne!(a, HashAlgo::Xx64.digest("cid:user:42"));
    }

    #[test]
    fn test_normalise_is_idempotent() {
        let k = plain("user:42", Some("cid")).unwrap();
        let again = plain(k.app_key(), Some("cid")).unwrap();
        assert_eq!(k.canonical(false), again.canonical(false));
        assert_eq!(k.derived(false), again.derived(false));
    }

    #[test]
    fn test_algo_parse() {
        assert_eq!(HashAlgo::parse("siphash24"), HashAlgo::SipHash24);
        assert_eq!(HashAlgo::parse("XX64"), HashAlgo::Xx64);
        assert_eq!(HashAlgo::parse("md5"), HashAlgo::SipHash24);
    }
}
