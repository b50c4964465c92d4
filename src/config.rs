//! Live-reloadable configuration properties.
//!
//! Properties are plain string key/value pairs held in a process-wide store.
//! Typed handles re-read the store on every access, so an operator can flip
//! a flag (zone fallback, key hashing, near-cache use) without restarting the
//! application. Each handle walks an ordered key chain — most specific first
//! (`<app>.<prefix>.flag`), then the app-level key, then any global default —
//! and falls back to its built-in default when nothing parses.

use dashmap::DashMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Process-wide property store.
///
/// Shared between all clients of an application; injected at client
/// construction. Writes take effect on the next property read.
#[derive(Debug, Default)]
pub struct Properties {
    values: DashMap<String, String>,
}

impl Properties {
    /// Create an empty property store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set a property. Overwrites any existing value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Remove a property, restoring defaults for handles that read it.
    pub fn unset(&self, key: &str) {
        self.values.remove(key);
    }

    /// Raw lookup of a single key.
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Create a typed handle over an ordered key chain.
    pub fn prop<T>(self: &Arc<Self>, keys: Vec<String>, default: T) -> Prop<T>
    where
        T: FromStr + Clone + Debug,
    {
        Prop {
            store: Arc::clone(self),
            keys,
            default,
        }
    }
}

/// A typed, live-reloading view of one or more property keys.
///
/// `get` walks the key chain in order and returns the first value that
/// parses; unparseable values are skipped with a warning so a typo cannot
/// take the default down with it.
#[derive(Debug, Clone)]
pub struct Prop<T> {
    store: Arc<Properties>,
    keys: Vec<String>,
    default: T,
}

impl<T> Prop<T>
where
    T: FromStr + Clone + Debug,
{
    /// Current value of the property.
    pub fn get(&self) -> T {
        for key in &self.keys {
            if let Some(raw) = self.store.lookup(key) {
                match raw.parse::<T>() {
                    Ok(value) => return value,
                    Err(_) => {
                        warn!(key = %key, raw = %raw, "unparseable property value, skipping");
                    }
                }
            }
        }
        self.default.clone()
    }

    /// The key chain this handle reads, most specific first.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_when_unset() {
        let props = Properties::new();
        let p = props.prop(vec!["movies.fallback.zone".to_string()], true);
        assert!(p.get());
    }

    #[test]
    fn test_live_reload() {
        let props = Properties::new();
        let p = props.prop(vec!["movies.hash.key".to_string()], false);
        assert!(!p.get());

        props.set("movies.hash.key", "true");
        assert!(p.get());

        props.unset("movies.hash.key");
        assert!(!p.get());
    }

    #[test]
    fn test_key_chain_precedence() {
        let props = Properties::new();
        let p = props.prop(
            vec![
                "movies.cid.throw.exception".to_string(),
                "movies.throw.exception".to_string(),
            ],
            false,
        );

        props.set("movies.throw.exception", "true");
        assert!(p.get());

        // The per-prefix key wins over the app-level key.
        props.set("movies.cid.throw.exception", "false");
        assert!(!p.get());
    }

    #[test]
    fn test_unparseable_value_falls_through() {
        let props = Properties::new();
        let p = props.prop(
            vec![
                "movies.max.key.length".to_string(),
                "doppio.max.key.length".to_string(),
            ],
            200u32,
        );

        props.set("movies.max.key.length", "not-a-number");
        props.set("doppio.max.key.length", "120");
        assert_eq!(p.get(), 120);
    }
}
