// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The scope-keyed record map shared by all resolutions of a service.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{ScopeKey, ScopeKind, ScopedConfig};

/// Outcome of a hierarchical lookup.
pub(crate) enum Lookup<T> {
    /// `current` has a record of its own (or an alias published earlier).
    Hit(Arc<ScopedConfig<T>>),
    /// `current` had no record; the record of `from` was published for it.
    Alias { config: Arc<ScopedConfig<T>>, from: ScopeKey },
    /// Nothing in the chain resolved.
    Missing,
}

/// Maps scope keys to published records behind a reader/writer lock.
///
/// Records are inserted fully built and never modified; replacing a scope's record
/// swaps the pointer. Holders of a replaced or flushed record keep a consistent,
/// frozen snapshot.
pub(crate) struct ScopeStore<T> {
    map: RwLock<HashMap<ScopeKey, Arc<ScopedConfig<T>>>>,
}

impl<T> Default for ScopeStore<T> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> ScopeStore<T> {
    pub(crate) fn get(&self, key: ScopeKey) -> Option<Arc<ScopedConfig<T>>> {
        self.map.read().get(&key).cloned()
    }

    #[cfg(test)]
    pub(crate) fn put(&self, key: ScopeKey, config: Arc<ScopedConfig<T>>) {
        self.map.write().insert(key, config);
    }

    /// Publishes a batch of records under a single write lock.
    ///
    /// Aliases that may now resolve differently are dropped in the same step: those
    /// copied from a republished scope, and, when a website is republished, those
    /// copied from `Default`, since a store of that website may have fallen through to
    /// it. The next lookup of a dropped scope walks the chain again.
    pub(crate) fn put_all(&self, configs: impl IntoIterator<Item = (ScopeKey, Arc<ScopedConfig<T>>)>) {
        let configs: Vec<_> = configs.into_iter().collect();
        let website_changed = configs.iter().any(|(key, _)| key.kind() == Some(ScopeKind::Website));

        let mut map = self.map.write();
        map.retain(|key, config| {
            let origin = config.scope_key();
            origin == *key
                || !(configs.iter().any(|(published, _)| *published == origin)
                    || (website_changed && origin == ScopeKey::DEFAULT))
        });
        map.extend(configs);
    }

    /// Replaces the whole map, returning how many records were dropped.
    pub(crate) fn replace(&self, configs: impl IntoIterator<Item = (ScopeKey, Arc<ScopedConfig<T>>)>) -> usize {
        let fresh: HashMap<_, _> = configs.into_iter().collect();
        std::mem::replace(&mut *self.map.write(), fresh).len()
    }

    /// Drops every record, returning how many were dropped.
    #[cfg(test)]
    pub(crate) fn flush(&self) -> usize {
        self.replace(std::iter::empty())
    }

    pub(crate) fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns the current records ordered by scope key.
    pub(crate) fn snapshot(&self) -> BTreeMap<ScopeKey, Arc<ScopedConfig<T>>> {
        self.map
            .read()
            .iter()
            .map(|(key, config)| (*key, Arc::clone(config)))
            .collect()
    }

    /// Resolves `current`, walking `fallback` and then `Default` when it has no record.
    ///
    /// A record found up the chain is published under `current` as well, so the walk
    /// happens once per scope until the next flush. With no `fallback` only `current`
    /// is consulted.
    pub(crate) fn resolve(&self, current: ScopeKey, fallback: Option<ScopeKey>) -> Lookup<T> {
        if let Some(config) = self.get(current) {
            return Lookup::Hit(config);
        }
        let Some(fallback) = fallback else {
            return Lookup::Missing;
        };

        let mut map = self.map.write();

        // Another writer may have published `current` while we waited for the lock;
        // an alias must never replace it.
        if let Some(config) = map.get(&current) {
            return Lookup::Hit(Arc::clone(config));
        }

        if fallback.kind() == Some(ScopeKind::Website) {
            let website = map.get(&fallback).filter(|config| config.is_valid().is_ok()).cloned();
            if let Some(config) = website {
                map.insert(current, Arc::clone(&config));
                return Lookup::Alias { config, from: fallback };
            }
        }

        match map.get(&ScopeKey::DEFAULT).cloned() {
            Some(config) => {
                map.insert(current, Arc::clone(&config));
                Lookup::Alias {
                    config,
                    from: ScopeKey::DEFAULT,
                }
            }
            None => Lookup::Missing,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Scope};

    fn record(scope: Scope, payload: &str) -> Arc<ScopedConfig<String>> {
        let mut config = ScopedConfig::new(scope.key());
        *config.payload_mut() = payload.to_string();
        Arc::new(config)
    }

    fn seeded() -> ScopeStore<String> {
        let store = ScopeStore::default();
        store.put(ScopeKey::DEFAULT, record(Scope::DEFAULT, "Hello Default"));
        store.put(Scope::website(1).key(), record(Scope::website(1), "Website=1"));
        store
    }

    fn payload(lookup: &Lookup<String>) -> Option<&str> {
        match lookup {
            Lookup::Hit(config) | Lookup::Alias { config, .. } => Some(config.payload().as_str()),
            Lookup::Missing => None,
        }
    }

    #[test]
    fn get_put_flush() {
        let store = seeded();
        assert_eq!(store.len(), 2);
        assert!(store.get(ScopeKey::DEFAULT).is_some());

        let old = store.get(Scope::website(1).key()).expect("seeded");
        store.put(Scope::website(1).key(), record(Scope::website(1), "Website=1 v2"));
        assert_eq!(old.payload(), "Website=1", "replaced records stay intact for their holders");

        assert_eq!(store.flush(), 2);
        assert_eq!(store.len(), 0);
        assert!(store.get(ScopeKey::DEFAULT).is_none());
    }

    #[test]
    fn store_falls_back_to_website_and_aliases() {
        let store = seeded();
        let current = Scope::store(2).key();

        let lookup = store.resolve(current, Some(Scope::website(1).key()));
        assert!(matches!(lookup, Lookup::Alias { from, .. } if from == Scope::website(1).key()));
        assert_eq!(payload(&lookup), Some("Website=1"));

        // The alias is the very same record.
        let website = store.get(Scope::website(1).key()).expect("seeded");
        let aliased = store.get(current).expect("alias published");
        assert!(Arc::ptr_eq(&website, &aliased));

        assert!(matches!(store.resolve(current, Some(Scope::website(1).key())), Lookup::Hit(_)));
    }

    #[test]
    fn republishing_drops_stale_aliases() {
        let store = seeded();
        let website = Scope::website(1).key();
        let _ = store.resolve(Scope::store(2).key(), Some(website));
        let _ = store.resolve(Scope::store(5).key(), Some(Scope::website(9).key()));
        let _ = store.resolve(Scope::website(4).key(), Some(ScopeKey::DEFAULT));
        assert_eq!(store.len(), 5);

        store.put_all([(website, record(Scope::website(1), "Website=1 v2"))]);

        // Aliases of the website and of `Default` are gone, own records stay.
        assert_eq!(store.len(), 2);
        assert!(store.get(Scope::store(2).key()).is_none());
        assert!(store.get(Scope::store(5).key()).is_none());

        let lookup = store.resolve(Scope::store(2).key(), Some(website));
        assert_eq!(payload(&lookup), Some("Website=1 v2"));
    }

    #[test]
    fn store_record_keeps_unrelated_aliases() {
        let store = seeded();
        let _ = store.resolve(Scope::store(2).key(), Some(Scope::website(1).key()));

        store.put_all([(Scope::store(3).key(), record(Scope::store(3), "Store=3"))]);

        assert_eq!(store.len(), 4);
        assert!(store.get(Scope::store(2).key()).is_some());
    }

    #[test]
    fn unknown_website_falls_back_to_default() {
        let store = seeded();
        let lookup = store.resolve(Scope::store(5).key(), Some(Scope::website(9).key()));
        assert!(matches!(lookup, Lookup::Alias { from, .. } if from == ScopeKey::DEFAULT));
        assert_eq!(payload(&lookup), Some("Hello Default"));
    }

    #[test]
    fn invalid_website_is_skipped() {
        let store = seeded();
        store.put(
            Scope::website(3).key(),
            Arc::new(ScopedConfig::from_error(Scope::website(3).key(), Error::not_valid("broken"))),
        );

        let lookup = store.resolve(Scope::store(6).key(), Some(Scope::website(3).key()));
        assert_eq!(payload(&lookup), Some("Hello Default"));
    }

    #[test]
    fn no_fallback_means_no_walk() {
        let store = seeded();
        assert!(matches!(store.resolve(Scope::store(2).key(), None), Lookup::Missing));
        assert!(store.get(Scope::store(2).key()).is_none());
    }

    #[test]
    fn missing_default_is_not_found() {
        let store: ScopeStore<String> = ScopeStore::default();
        assert!(matches!(
            store.resolve(Scope::website(1).key(), Some(ScopeKey::DEFAULT)),
            Lookup::Missing
        ));
    }

    #[test]
    fn existing_record_is_returned_even_if_invalid() {
        let store = seeded();
        let key = Scope::store(8).key();
        store.put(key, Arc::new(ScopedConfig::from_error(key, Error::not_valid("bad"))));

        match store.resolve(key, Some(Scope::website(1).key())) {
            Lookup::Hit(config) => assert!(config.is_valid().is_err()),
            _ => panic!("expected the stored record"),
        }
    }

    #[test]
    fn snapshot_is_ordered() {
        let store = seeded();
        store.put(Scope::store(1).key(), record(Scope::store(1), "Store=1"));

        let keys: Vec<_> = store.snapshot().into_keys().collect();
        assert_eq!(keys, vec![ScopeKey::DEFAULT, Scope::website(1).key(), Scope::store(1).key()]);
    }

    #[test]
    fn replace_swaps_everything() {
        let store = seeded();
        let dropped = store.replace([(Scope::store(4).key(), record(Scope::store(4), "Store=4"))]);
        assert_eq!(dropped, 2);
        assert_eq!(store.len(), 1);

        store.put_all([
            (ScopeKey::DEFAULT, record(Scope::DEFAULT, "d")),
            (Scope::website(2).key(), record(Scope::website(2), "w")),
        ]);
        assert_eq!(store.len(), 3);
    }
}
