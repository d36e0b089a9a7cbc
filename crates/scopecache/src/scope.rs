// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tenant coordinates and their packed cache keys.
//!
//! A [`Scope`] names one level of the tenant hierarchy: the single `Default` scope,
//! a `Website`, or a `Store` that belongs to a website. A [`ScopeKey`] packs a scope
//! into one `u64` so it can be used as a map key, a coalescing key and a log token.

use std::fmt::{self, Display, Formatter};

/// The level of the tenant hierarchy a [`Scope`] lives on.
///
/// Levels are ordered from the most general to the most specific:
/// `Default < Website < Store`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScopeKind {
    /// The global scope every other scope falls back to.
    Default,
    /// A website; owns one or more stores.
    Website,
    /// A store view inside a website.
    Store,
}

impl ScopeKind {
    const fn code(self) -> u64 {
        match self {
            Self::Default => 1,
            Self::Website => 2,
            Self::Store => 3,
        }
    }

    const fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Default),
            2 => Some(Self::Website),
            3 => Some(Self::Store),
            _ => None,
        }
    }

    /// The kind of the next more general level, or `None` for `Default`.
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Default => None,
            Self::Website => Some(Self::Default),
            Self::Store => Some(Self::Website),
        }
    }
}

impl Display for ScopeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::Website => write!(f, "Website"),
            Self::Store => write!(f, "Store"),
        }
    }
}

/// A tenant coordinate: a hierarchy level plus a numeric id.
///
/// The `Default` scope always has id `0`; [`Scope::new`] enforces that.
///
/// # Examples
///
/// ```
/// use scopecache::{Scope, ScopeKind};
///
/// let store = Scope::store(2);
/// assert_eq!(store.kind(), ScopeKind::Store);
/// assert_eq!(store.id(), 2);
/// assert_eq!(Scope::new(ScopeKind::Default, 7), Scope::DEFAULT);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Scope {
    kind: ScopeKind,
    id: u32,
}

impl Scope {
    /// The `Default` scope.
    pub const DEFAULT: Self = Self {
        kind: ScopeKind::Default,
        id: 0,
    };

    /// Creates a scope. The id of a `Default` scope is always normalised to `0`.
    #[must_use]
    pub const fn new(kind: ScopeKind, id: u32) -> Self {
        match kind {
            ScopeKind::Default => Self::DEFAULT,
            _ => Self { kind, id },
        }
    }

    /// Creates a `Website` scope.
    #[must_use]
    pub const fn website(id: u32) -> Self {
        Self::new(ScopeKind::Website, id)
    }

    /// Creates a `Store` scope.
    #[must_use]
    pub const fn store(id: u32) -> Self {
        Self::new(ScopeKind::Store, id)
    }

    /// Returns the hierarchy level.
    #[must_use]
    pub const fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Returns the numeric id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Packs this scope into its cache key.
    #[must_use]
    pub const fn key(&self) -> ScopeKey {
        ScopeKey::new(self.kind, self.id)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.id)
    }
}

const KIND_SHIFT: u32 = 32;

/// An order-preserving `u64` encoding of a [`Scope`].
///
/// The kind occupies the upper 32 bits and the id the lower 32 bits, so keys sort by
/// level first and by id second. Two scopes are equal exactly when their keys are.
///
/// `ScopeKey::default()` is the *unset* key (`0`); it never names a real scope and a
/// configuration record carrying it is invalid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ScopeKey(u64);

impl ScopeKey {
    /// The key of the `Default` scope; the universal fallback target.
    pub const DEFAULT: Self = Self::new(ScopeKind::Default, 0);

    /// Packs a kind and id. Like [`Scope::new`], a `Default` id is normalised to `0`.
    #[must_use]
    pub const fn new(kind: ScopeKind, id: u32) -> Self {
        let id = match kind {
            ScopeKind::Default => 0,
            _ => id,
        };
        Self((kind.code() << KIND_SHIFT) | id as u64)
    }

    /// Returns `true` for the unset key.
    #[must_use]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }

    /// Returns the encoded kind, or `None` for the unset key.
    #[must_use]
    pub const fn kind(self) -> Option<ScopeKind> {
        ScopeKind::from_code(self.0 >> KIND_SHIFT)
    }

    /// Returns the encoded id.
    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "the lower half holds the id by construction")]
    pub const fn id(self) -> u32 {
        self.0 as u32
    }

    /// Decodes the key back into a [`Scope`], or `None` for the unset key.
    #[must_use]
    pub const fn scope(self) -> Option<Scope> {
        match self.kind() {
            Some(kind) => Some(Scope::new(kind, self.id())),
            None => None,
        }
    }

    /// Returns the key of the parent scope when it can be derived from the key alone.
    ///
    /// A website's parent is `Default` and `Default` has none. A store's owning website
    /// is not encoded in its key, so this returns `None` for stores; the website comes
    /// from [`ScopedGetter::parent`] instead.
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self.kind() {
            Some(ScopeKind::Website) => Some(Self::DEFAULT),
            _ => None,
        }
    }

    /// Returns the raw packed value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<Scope> for ScopeKey {
    fn from(scope: Scope) -> Self {
        scope.key()
    }
}

impl Display for ScopeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.scope() {
            Some(scope) => Display::fmt(&scope, f),
            None => write!(f, "Unset"),
        }
    }
}

/// Supplies the scope a request resolves configuration for, plus its parent.
///
/// Implemented by whatever maps an inbound request to a tenant; the engine never
/// decides tenant identity itself.
pub trait ScopedGetter {
    /// The most specific scope of the request.
    fn scope(&self) -> Scope;

    /// The scope one level up: the owning website for a store, `Default` otherwise.
    fn parent(&self) -> Scope;
}

impl<G: ScopedGetter + ?Sized> ScopedGetter for &G {
    fn scope(&self) -> Scope {
        (**self).scope()
    }

    fn parent(&self) -> Scope {
        (**self).parent()
    }
}

/// A website/store pair resolved for one request.
///
/// A store id of `0` means "no store", a website id of `0` means "no website";
/// the scope then degrades to the website or to `Default`.
///
/// # Examples
///
/// ```
/// use scopecache::{Scope, Scoped, ScopedGetter};
///
/// let scoped = Scoped::new(1, 2);
/// assert_eq!(scoped.scope(), Scope::store(2));
/// assert_eq!(scoped.parent(), Scope::website(1));
///
/// let website_only = Scoped::new(1, 0);
/// assert_eq!(website_only.scope(), Scope::website(1));
/// assert_eq!(website_only.parent(), Scope::DEFAULT);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Scoped {
    website_id: u32,
    store_id: u32,
}

impl Scoped {
    /// Creates a pair from a website id and a store id.
    #[must_use]
    pub const fn new(website_id: u32, store_id: u32) -> Self {
        Self { website_id, store_id }
    }

    /// Captures the scope and parent of any getter.
    ///
    /// Getters that do not follow the website/store shape are preserved as closely
    /// as the pair allows.
    #[must_use]
    pub fn from_getter<G: ScopedGetter + ?Sized>(getter: &G) -> Self {
        let scope = getter.scope();
        match scope.kind() {
            ScopeKind::Store => Self::new(getter.parent().id(), scope.id()),
            ScopeKind::Website => Self::new(scope.id(), 0),
            ScopeKind::Default => Self::default(),
        }
    }

    /// Returns the website id.
    #[must_use]
    pub const fn website_id(&self) -> u32 {
        self.website_id
    }

    /// Returns the store id.
    #[must_use]
    pub const fn store_id(&self) -> u32 {
        self.store_id
    }
}

impl ScopedGetter for Scoped {
    fn scope(&self) -> Scope {
        if self.store_id > 0 {
            Scope::store(self.store_id)
        } else if self.website_id > 0 {
            Scope::website(self.website_id)
        } else {
            Scope::DEFAULT
        }
    }

    fn parent(&self) -> Scope {
        if self.store_id > 0 && self.website_id > 0 {
            Scope::website(self.website_id)
        } else {
            Scope::DEFAULT
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ScopeKey: Copy, Send, Sync, Ord, std::hash::Hash);
    assert_impl_all!(Scoped: ScopedGetter, Copy, Send, Sync);

    #[rstest]
    #[case(Scope::DEFAULT, "Default(0)")]
    #[case(Scope::website(1), "Website(1)")]
    #[case(Scope::store(42), "Store(42)")]
    fn display_names_kind_and_id(#[case] scope: Scope, #[case] expected: &str) {
        assert_eq!(scope.to_string(), expected);
        assert_eq!(scope.key().to_string(), expected);
    }

    #[rstest]
    #[case(ScopeKind::Default, 0)]
    #[case(ScopeKind::Website, 1)]
    #[case(ScopeKind::Website, u32::MAX)]
    #[case(ScopeKind::Store, 7)]
    fn key_decodes_to_same_scope(#[case] kind: ScopeKind, #[case] id: u32) {
        let key = ScopeKey::new(kind, id);
        assert_eq!(key.kind(), Some(kind));
        assert_eq!(key.id(), id);
        assert_eq!(key.scope(), Some(Scope::new(kind, id)));
    }

    #[test]
    fn default_id_is_normalised() {
        assert_eq!(ScopeKey::new(ScopeKind::Default, 9), ScopeKey::DEFAULT);
        assert_eq!(Scope::new(ScopeKind::Default, 9).key(), ScopeKey::DEFAULT);
    }

    #[test]
    fn unset_key_is_distinct() {
        let unset = ScopeKey::default();
        assert!(unset.is_unset());
        assert!(!ScopeKey::DEFAULT.is_unset());
        assert_eq!(unset.kind(), None);
        assert_eq!(unset.scope(), None);
        assert_eq!(unset.to_string(), "Unset");
    }

    #[test]
    fn ordering_is_level_then_id() {
        let mut keys = vec![
            Scope::store(1).key(),
            Scope::website(9).key(),
            ScopeKey::DEFAULT,
            Scope::website(2).key(),
            Scope::store(0).key(),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ScopeKey::DEFAULT,
                Scope::website(2).key(),
                Scope::website(9).key(),
                Scope::store(0).key(),
                Scope::store(1).key(),
            ]
        );
    }

    #[test]
    fn parent_of_key() {
        assert_eq!(ScopeKey::DEFAULT.parent(), None);
        assert_eq!(Scope::website(3).key().parent(), Some(ScopeKey::DEFAULT));
        assert_eq!(Scope::store(3).key().parent(), None);
        assert_eq!(ScopeKind::Store.parent(), Some(ScopeKind::Website));
        assert_eq!(ScopeKind::Default.parent(), None);
    }

    #[rstest]
    #[case(Scoped::new(0, 0), Scope::DEFAULT, Scope::DEFAULT)]
    #[case(Scoped::new(4, 0), Scope::website(4), Scope::DEFAULT)]
    #[case(Scoped::new(4, 8), Scope::store(8), Scope::website(4))]
    #[case(Scoped::new(0, 8), Scope::store(8), Scope::DEFAULT)]
    fn scoped_pair_resolves(#[case] scoped: Scoped, #[case] scope: Scope, #[case] parent: Scope) {
        assert_eq!(scoped.scope(), scope);
        assert_eq!(scoped.parent(), parent);
    }

    #[test]
    fn from_getter_round_trips_pairs() {
        for scoped in [Scoped::new(0, 0), Scoped::new(3, 0), Scoped::new(3, 5)] {
            assert_eq!(Scoped::from_getter(&scoped), scoped);
        }
    }
}
