// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Options that build scoped configuration records and service settings.
//!
//! An option is a one-shot transformation. Applying a batch of options through
//! [`Service::options`](crate::Service::options) stages every change on private copies of
//! the affected records; the copies are published together once the whole batch
//! succeeded. Published records are never modified.
//!
//! Scoped options take a list of scopes: the first one is the target, the remaining
//! ones are parents, most specific first. A target without a record of its own starts
//! from a copy of the first parent that has one, then of the `Default` record.
//!
//! # Examples
//!
//! ```
//! use scopecache::{ConfigOption, Scope, Service, with_disable};
//!
//! fn with_greeting(scope: Scope, greeting: &str) -> ConfigOption<String> {
//!     let greeting = greeting.to_string();
//!     ConfigOption::scoped("greeting", [scope], move |config| {
//!         *config.payload_mut() = greeting;
//!         Ok(())
//!     })
//! }
//!
//! let service = Service::new([
//!     with_greeting(Scope::DEFAULT, "Hello Default"),
//!     with_disable(true, [Scope::store(3), Scope::website(1)]),
//! ])?;
//! # Ok::<(), scopecache::Error>(())
//! ```

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::iter;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::Dispatch;

use crate::service::Settings;
use crate::store::ScopeStore;
use crate::{ErrorHandler, Result, ScopeKey, Scoped, ScopedConfig};

type ScopedFn<T> = Box<dyn FnOnce(&mut ScopedConfig<T>) -> Result<()> + Send>;
type ServiceFn<T> = Box<dyn FnOnce(&mut Settings<T>) -> Result<()> + Send>;

enum OptionKind<T> {
    Scoped {
        target: ScopeKey,
        parents: Vec<ScopeKey>,
        apply: ScopedFn<T>,
    },
    Reset {
        target: ScopeKey,
    },
    Service(ServiceFn<T>),
}

/// A single configuration change, applied at most once.
///
/// Domain crates create their own options with [`ConfigOption::scoped`]; the engine
/// provides [`with_default_config`], [`with_disable`], [`with_mark_partially_applied`],
/// [`with_error_handler`], [`with_logger`] and [`with_option_factory`].
pub struct ConfigOption<T> {
    field: &'static str,
    kind: OptionKind<T>,
}

impl<T> ConfigOption<T> {
    /// Creates an option that modifies the record of the first scope in `scopes`.
    ///
    /// `field` names what the option sets; it prefixes any error `apply` returns,
    /// together with the target scope. An empty `scopes` list targets `Default`.
    #[must_use]
    pub fn scoped<S, F>(field: &'static str, scopes: impl IntoIterator<Item = S>, apply: F) -> Self
    where
        S: Into<ScopeKey>,
        F: FnOnce(&mut ScopedConfig<T>) -> Result<()> + Send + 'static,
    {
        let (target, parents) = split_scopes(scopes);
        Self {
            field,
            kind: OptionKind::Scoped {
                target,
                parents,
                apply: Box::new(apply),
            },
        }
    }

    fn service<F>(field: &'static str, apply: F) -> Self
    where
        F: FnOnce(&mut Settings<T>) -> Result<()> + Send + 'static,
    {
        Self {
            field,
            kind: OptionKind::Service(Box::new(apply)),
        }
    }

    /// Returns the name of the field this option sets.
    #[must_use]
    pub fn field(&self) -> &'static str {
        self.field
    }

    /// Returns the scope this option writes to, or `None` for service settings.
    #[must_use]
    pub fn target(&self) -> Option<ScopeKey> {
        match &self.kind {
            OptionKind::Scoped { target, .. } | OptionKind::Reset { target } => Some(*target),
            OptionKind::Service(_) => None,
        }
    }
}

impl<T> Debug for ConfigOption<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ConfigOption");
        debug.field("field", &self.field);
        if let Some(target) = self.target() {
            debug.field("target", &format_args!("{target}"));
        }
        debug.finish_non_exhaustive()
    }
}

fn split_scopes<S: Into<ScopeKey>>(scopes: impl IntoIterator<Item = S>) -> (ScopeKey, Vec<ScopeKey>) {
    let mut scopes = scopes.into_iter().map(Into::into);
    let target = scopes.next().unwrap_or(ScopeKey::DEFAULT);
    (target, scopes.collect())
}

/// Replaces the record of `scope` with an empty one.
///
/// Every service applies `with_default_config(Scope::DEFAULT)` first, so the `Default`
/// record always exists.
#[must_use]
pub fn with_default_config<T>(scope: impl Into<ScopeKey>) -> ConfigOption<T> {
    ConfigOption {
        field: "default_config",
        kind: OptionKind::Reset { target: scope.into() },
    }
}

/// Marks the target scope as disabled; its domain logic is skipped entirely.
///
/// A disabled record is still valid.
#[must_use]
pub fn with_disable<T: 'static, S: Into<ScopeKey>>(disabled: bool, scopes: impl IntoIterator<Item = S>) -> ConfigOption<T> {
    ConfigOption::scoped("disabled", scopes, move |config: &mut ScopedConfig<T>| {
        config.set_disabled(disabled);
        Ok(())
    })
}

/// Flags the target scope as incompletely loaded.
///
/// While set, validating the record reports a temporary error so callers retry.
#[must_use]
pub fn with_mark_partially_applied<T: 'static, S: Into<ScopeKey>>(partially_applied: bool, scopes: impl IntoIterator<Item = S>) -> ConfigOption<T> {
    ConfigOption::scoped("partially_applied", scopes, move |config: &mut ScopedConfig<T>| {
        config.set_partially_applied(partially_applied);
        Ok(())
    })
}

/// Sets the handler rendering the response when the target scope's configuration is
/// unusable.
#[must_use]
pub fn with_error_handler<T: 'static, S: Into<ScopeKey>>(handler: ErrorHandler, scopes: impl IntoIterator<Item = S>) -> ConfigOption<T> {
    ConfigOption::scoped("error_handler", scopes, move |config: &mut ScopedConfig<T>| {
        config.set_error_handler(handler);
        Ok(())
    })
}

/// Replaces the dispatcher the service logs to.
#[must_use]
pub fn with_logger<T: 'static>(log: Dispatch) -> ConfigOption<T> {
    ConfigOption::service("logger", move |settings| {
        settings.log = log;
        Ok(())
    })
}

/// Installs the factory used to load options for scopes missing from the cache.
#[must_use]
pub fn with_option_factory<T: 'static>(factory: OptionFactory<T>) -> ConfigOption<T> {
    ConfigOption::service("option_factory", move |settings| {
        settings.factory = Some(factory);
        Ok(())
    })
}

type LoadFn<T> = dyn Fn(Scoped) -> BoxFuture<'static, Result<Vec<ConfigOption<T>>>> + Send + Sync;

/// Derives options for one scope from a slow backend.
///
/// The service calls the factory at most once per scope and cache generation, with
/// concurrent requests for the same scope coalesced into a single call. The factory
/// receives the website/store pair of the request.
///
/// # Examples
///
/// ```
/// use scopecache::{ConfigOption, OptionFactory, ScopedGetter, Service, with_option_factory};
///
/// let factory = OptionFactory::new(|scoped: scopecache::Scoped| async move {
///     let scope = scoped.scope();
///     Ok::<_, scopecache::Error>(vec![ConfigOption::scoped("greeting", [scope], move |config| {
///         *config.payload_mut() = format!("Hello {scope}");
///         Ok(())
///     })])
/// });
///
/// let service: Service<String> = Service::new([with_option_factory(factory)])?;
/// # Ok::<(), scopecache::Error>(())
/// ```
pub struct OptionFactory<T>(Arc<LoadFn<T>>);

impl<T> OptionFactory<T> {
    /// Wraps an async loading function.
    #[must_use]
    pub fn new<F, Fut>(load: F) -> Self
    where
        F: Fn(Scoped) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ConfigOption<T>>>> + Send + 'static,
    {
        Self(Arc::new(move |scoped| load(scoped).boxed()))
    }

    pub(crate) fn load(&self, scoped: Scoped) -> BoxFuture<'static, Result<Vec<ConfigOption<T>>>> {
        (self.0)(scoped)
    }
}

impl<T> Clone for OptionFactory<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Debug for OptionFactory<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionFactory").finish_non_exhaustive()
    }
}

/// Changes staged by one batch of options, not yet visible to readers.
pub(crate) struct Batch<T> {
    pub(crate) records: BTreeMap<ScopeKey, ScopedConfig<T>>,
    pub(crate) settings: Option<Settings<T>>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            settings: None,
        }
    }
}

impl<T: Clone + Default> Batch<T> {
    /// Applies one option on top of `published` and the changes staged so far.
    ///
    /// # Errors
    ///
    /// Returns the option's error prefixed with its target scope and field.
    pub(crate) fn apply(&mut self, option: ConfigOption<T>, published: &ScopeStore<T>, settings: &Settings<T>) -> Result<()> {
        let ConfigOption { field, kind } = option;
        match kind {
            OptionKind::Scoped { target, parents, apply } => {
                let config = self.stage(target, &parents, published);
                apply(config).map_err(|error| error.context(format_args!("{target} {field}")))
            }
            OptionKind::Reset { target } => {
                self.records.insert(target, ScopedConfig::new(target));
                Ok(())
            }
            OptionKind::Service(apply) => {
                let staged = self.settings.get_or_insert_with(|| settings.clone());
                apply(staged).map_err(|error| error.context(field))
            }
        }
    }

    fn stage(&mut self, target: ScopeKey, parents: &[ScopeKey], published: &ScopeStore<T>) -> &mut ScopedConfig<T> {
        if !self.records.contains_key(&target) {
            let base = self.base(target, parents, published);
            self.records.insert(target, base);
        }
        self.records.entry(target).or_insert_with(|| ScopedConfig::new(target))
    }

    fn base(&self, target: ScopeKey, parents: &[ScopeKey], published: &ScopeStore<T>) -> ScopedConfig<T> {
        if let Some(own) = published.get(target) {
            // A record shared from a parent is copied, never written through.
            return if own.scope_key() == target {
                ScopedConfig::clone(&own)
            } else {
                own.inherit(target)
            };
        }

        for parent in parents.iter().copied().chain(iter::once(ScopeKey::DEFAULT)) {
            if parent == target {
                continue;
            }
            if let Some(staged) = self.records.get(&parent) {
                return staged.inherit(target);
            }
            if let Some(record) = published.get(parent) {
                return record.inherit(target);
            }
        }

        ScopedConfig::new(target)
    }
}
