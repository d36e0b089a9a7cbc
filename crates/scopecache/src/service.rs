// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The long-lived resolution engine.

use std::borrow::Cow;
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::Response;
use parking_lot::{Mutex, RwLock};
use tracing::{Dispatch, Level, event};

use crate::flight::Flight;
use crate::options::{Batch, OptionFactory, with_default_config};
use crate::store::{Lookup, ScopeStore};
use crate::{ConfigOption, Error, ErrorHandler, ErrorKind, Result, ScopeKey, Scoped, ScopedConfig, ScopedGetter};

const DEFAULT_NAME: &str = "scopecache";

/// Static settings of a [`Service`].
///
/// With the `serde` feature enabled this can be read from a configuration file;
/// missing fields take their default values.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use scopecache::ServiceConfig;
///
/// let config = ServiceConfig::default()
///     .with_name("cors")
///     .with_load_timeout(Duration::from_secs(2));
/// assert_eq!(config.name(), "cors");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ServiceConfig {
    name: Cow<'static, str>,
    load_timeout: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed(DEFAULT_NAME),
            load_timeout: None,
        }
    }
}

impl ServiceConfig {
    /// Sets the name the service reports in its log events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Bounds how long a single factory load may take.
    #[must_use]
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }

    /// Returns the service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the factory load timeout, if one is set.
    #[must_use]
    pub fn load_timeout(&self) -> Option<Duration> {
        self.load_timeout
    }
}

/// Mutable service-wide settings, replaced as a whole by service options.
pub(crate) struct Settings<T> {
    pub(crate) name: Cow<'static, str>,
    pub(crate) log: Dispatch,
    pub(crate) factory: Option<OptionFactory<T>>,
    pub(crate) error_handler: ErrorHandler,
    pub(crate) load_timeout: Option<Duration>,
}

impl<T> Settings<T> {
    fn emit(&self, f: impl FnOnce()) {
        tracing::dispatcher::with_default(&self.log, f);
    }
}

impl<T> Default for Settings<T> {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed(DEFAULT_NAME),
            log: Dispatch::none(),
            factory: None,
            error_handler: ErrorHandler::default(),
            load_timeout: None,
        }
    }
}

impl<T> Clone for Settings<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            log: self.log.clone(),
            factory: self.factory.clone(),
            error_handler: self.error_handler.clone(),
            load_timeout: self.load_timeout,
        }
    }
}

type Bootstrap<T> = Arc<dyn Fn() -> Vec<ConfigOption<T>> + Send + Sync>;

/// Resolves the currently valid configuration of a tenant scope.
///
/// A service owns a scope-keyed cache of [`ScopedConfig`] records. Lookups for a scope
/// without a record fall back to its website, then to `Default`, and the record found
/// is aliased under the requested scope so the walk happens once per scope. When an
/// [`OptionFactory`] is configured, missing scopes are loaded lazily; concurrent
/// requests for the same scope share a single load while other scopes proceed
/// independently.
///
/// The `Default` record always exists: it is created at construction and recreated by
/// [`Service::flush_cache`].
///
/// # Examples
///
/// ```
/// use scopecache::{ConfigOption, Scope, Scoped, Service};
///
/// fn with_greeting(scope: Scope, greeting: &'static str) -> ConfigOption<String> {
///     ConfigOption::scoped("greeting", [scope], move |config| {
///         *config.payload_mut() = greeting.to_string();
///         Ok(())
///     })
/// }
///
/// # async fn example() -> scopecache::Result<()> {
/// let service = Service::new([
///     with_greeting(Scope::DEFAULT, "Hello Default"),
///     with_greeting(Scope::website(1), "Website=1"),
/// ])?;
///
/// let config = service.config_by_scoped_getter(Scoped::new(1, 2)).await;
/// config.is_valid()?;
/// assert_eq!(config.payload(), "Website=1");
/// # Ok(())
/// # }
/// ```
pub struct Service<T> {
    store: ScopeStore<T>,
    flight: Flight<ScopeKey, Arc<ScopedConfig<T>>>,
    settings: RwLock<Arc<Settings<T>>>,
    apply_lock: Mutex<()>,
    bootstrap: Option<Bootstrap<T>>,
}

impl<T> Service<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    /// Creates a service with the `Default` record plus `options` applied.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by an option; nothing is published then.
    pub fn new(options: impl IntoIterator<Item = ConfigOption<T>>) -> Result<Self> {
        Self::builder().options(options).build()
    }

    /// Starts building a service.
    #[must_use]
    pub fn builder() -> ServiceBuilder<T> {
        ServiceBuilder::new()
    }

    /// Returns the service name used in log events.
    #[must_use]
    pub fn name(&self) -> String {
        self.settings().name.to_string()
    }

    /// Returns the number of cached scope entries, aliases included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns `true` when the cache holds no entries.
    ///
    /// A constructed service always holds the `Default` record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    fn settings(&self) -> Arc<Settings<T>> {
        Arc::clone(&self.settings.read())
    }

    /// Applies a batch of options.
    ///
    /// The options are applied in order to private copies of the affected records.
    /// Only when all of them succeed are the new records published, under a single
    /// write lock; records published earlier are never modified. Concurrent calls are
    /// applied one after another.
    ///
    /// # Errors
    ///
    /// Returns the first option error, prefixed with the scope and field that failed.
    /// Nothing from the batch is published then.
    pub fn options(&self, options: impl IntoIterator<Item = ConfigOption<T>>) -> Result<()> {
        let _serial = self.apply_lock.lock();
        let settings = self.settings();

        let mut batch = Batch::default();
        for option in options {
            batch.apply(option, &self.store, &settings)?;
        }
        let Batch { records, settings: staged } = batch;
        let scopes = records.len();
        self.store
            .put_all(records.into_iter().map(|(key, config)| (key, Arc::new(config))));
        let settings = self.install(staged, settings);

        settings.emit(|| {
            event!(
                Level::DEBUG,
                message = "options applied",
                cache.name = %settings.name,
                scopes,
            );
        });
        Ok(())
    }

    fn install(&self, staged: Option<Settings<T>>, current: Arc<Settings<T>>) -> Arc<Settings<T>> {
        match staged {
            Some(staged) => {
                let staged = Arc::new(staged);
                *self.settings.write() = Arc::clone(&staged);
                staged
            }
            None => current,
        }
    }

    /// Resolves the configuration for the scope of `getter`.
    ///
    /// Always returns a record; call [`ScopedConfig::is_valid`] on it before use. The
    /// lookup order is:
    ///
    /// 1. a valid record cached for the scope itself;
    /// 2. without a factory: the scope, its website, then `Default`;
    /// 3. with a factory: one coalesced factory load for the scope, then the same
    ///    fallback walk.
    ///
    /// Failed loads yield an error record that is not cached, so the next request loads
    /// again.
    pub async fn config_by_scoped_getter<G: ScopedGetter>(&self, getter: G) -> Arc<ScopedConfig<T>> {
        let current = getter.scope().key();
        let fallback = getter.parent().key();

        if let Some(config) = self.store.get(current).filter(|config| config.is_valid().is_ok()) {
            return config;
        }

        let settings = self.settings();
        let Some(factory) = settings.factory.clone() else {
            return self.config_by_scope_key(current, Some(fallback));
        };

        let scoped = Scoped::from_getter(&getter);
        let loaded = self
            .flight
            .work(current, || self.load(scoped, current, fallback, factory, &settings))
            .await;

        loaded.unwrap_or_else(|abandoned| {
            let error = Error::caused_by(
                ErrorKind::Fatal,
                format!("loading configuration for scope {current} did not deliver a result"),
                abandoned,
            );
            settings.emit(|| {
                event!(
                    Level::ERROR,
                    message = "configuration load abandoned",
                    cache.name = %settings.name,
                    scope = %current,
                    outcome = "fatal",
                );
            });
            Arc::new(ScopedConfig::from_error(current, error))
        })
    }

    async fn load(
        &self,
        scoped: Scoped,
        current: ScopeKey,
        fallback: ScopeKey,
        factory: OptionFactory<T>,
        settings: &Settings<T>,
    ) -> Arc<ScopedConfig<T>> {
        // A flight for this scope may have completed between our lookup and joining.
        if let Some(config) = self.store.get(current).filter(|config| config.is_valid().is_ok()) {
            return config;
        }

        let options = match settings.load_timeout {
            Some(timeout) => tokio::time::timeout(timeout, factory.load(scoped))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::temporary(format!(
                        "loading configuration for scope {current} timed out after {timeout:?}"
                    )))
                }),
            None => factory.load(scoped).await,
        };

        match options.and_then(|options| self.options(options)) {
            Ok(()) => self.config_by_scope_key(current, Some(fallback)),
            Err(error) => {
                settings.emit(|| {
                    event!(
                        Level::WARN,
                        message = "configuration load failed",
                        cache.name = %settings.name,
                        scope = %current,
                        outcome = %error.kind(),
                        error = %error,
                    );
                });
                Arc::new(ScopedConfig::from_error(current, error))
            }
        }
    }

    /// Resolves `current` from the cache alone.
    ///
    /// A record cached for `current` is returned whether valid or not. Otherwise, with
    /// a `fallback`, a valid record of that website and then the `Default` record are
    /// tried, and the first one found is published under `current` as well. Without a
    /// `fallback`, or when nothing is found, the result is a `NotFound` error record.
    pub fn config_by_scope_key(&self, current: ScopeKey, fallback: Option<ScopeKey>) -> Arc<ScopedConfig<T>> {
        match self.store.resolve(current, fallback) {
            Lookup::Hit(config) => config,
            Lookup::Alias { config, from } => {
                let settings = self.settings();
                settings.emit(|| {
                    event!(
                        Level::DEBUG,
                        message = "scope aliased",
                        cache.name = %settings.name,
                        scope = %current,
                        from = %from,
                        outcome = "alias",
                    );
                });
                config
            }
            Lookup::Missing => Arc::new(ScopedConfig::from_error(current, Error::not_found(current))),
        }
    }

    /// Resolves the configuration of a website/store pair and checks its validity.
    ///
    /// # Errors
    ///
    /// Returns the error of the resolved record, see [`ScopedConfig::is_valid`].
    pub async fn config_by_scope(&self, website_id: u32, store_id: u32) -> Result<Arc<ScopedConfig<T>>> {
        let config = self.config_by_scoped_getter(Scoped::new(website_id, store_id)).await;
        config.is_valid()?;
        Ok(config)
    }

    /// Drops every cached record and rebuilds the `Default` record plus the bootstrap
    /// options.
    ///
    /// Holders of previously resolved records keep using them; every scope is loaded
    /// again on its next resolution.
    ///
    /// # Errors
    ///
    /// Returns the first bootstrap option error; the cache is left untouched then.
    pub fn flush_cache(&self) -> Result<()> {
        let _serial = self.apply_lock.lock();
        let settings = self.settings();

        let empty = ScopeStore::default();
        let mut batch = Batch::default();
        batch.apply(with_default_config(ScopeKey::DEFAULT), &empty, &settings)?;
        if let Some(bootstrap) = &self.bootstrap {
            for option in bootstrap() {
                batch.apply(option, &empty, &settings)?;
            }
        }

        let Batch { records, settings: staged } = batch;
        let dropped = self
            .store
            .replace(records.into_iter().map(|(key, config)| (key, Arc::new(config))));
        let settings = self.install(staged, settings);

        settings.emit(|| {
            event!(
                Level::DEBUG,
                message = "cache flushed",
                cache.name = %settings.name,
                dropped,
            );
        });
        Ok(())
    }

    /// Renders the response for a request whose configuration is unusable.
    ///
    /// Uses the handler of `config` when it has one and the service default otherwise.
    #[must_use]
    pub fn error_response(&self, config: &ScopedConfig<T>, error: &Error) -> Response<String> {
        match config.error_handler() {
            Some(handler) => handler.call(error),
            None => self.settings().error_handler.call(error),
        }
    }
}

impl<T: Debug> Service<T> {
    /// Writes every cached entry, ordered by scope key, one per line.
    ///
    /// Aliases show the record they share, so its scope differs from the entry key.
    /// Meant for diagnostics only; the format is not stable.
    ///
    /// # Errors
    ///
    /// Returns any error raised by `writer`.
    pub fn debug_cache<W: io::Write>(&self, mut writer: W) -> io::Result<()> {
        for (key, config) in self.store.snapshot() {
            writeln!(writer, "{key} => {config:?}")?;
        }
        Ok(())
    }
}

impl<T> Debug for Service<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let settings = self.settings.read();
        f.debug_struct("Service")
            .field("name", &settings.name)
            .field("entries", &self.store.len())
            .field("flight", &self.flight)
            .field("factory", &settings.factory.is_some())
            .field("load_timeout", &settings.load_timeout)
            .finish_non_exhaustive()
    }
}

/// Builds a [`Service`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use scopecache::{ConfigOption, OptionFactory, Scope, Service, with_disable};
///
/// let service: Service<Vec<String>> = Service::builder()
///     .name("cors")
///     .load_timeout(Duration::from_millis(500))
///     .bootstrap(|| vec![with_disable(true, [Scope::website(9)])])
///     .option_factory(OptionFactory::new(|_scoped| async { Ok::<_, scopecache::Error>(Vec::new()) }))
///     .build()?;
/// assert_eq!(service.name(), "cors");
/// # Ok::<(), scopecache::Error>(())
/// ```
pub struct ServiceBuilder<T> {
    config: ServiceConfig,
    log: Dispatch,
    factory: Option<OptionFactory<T>>,
    error_handler: ErrorHandler,
    bootstrap: Option<Bootstrap<T>>,
    options: Vec<ConfigOption<T>>,
}

impl<T> ServiceBuilder<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            config: ServiceConfig::default(),
            log: Dispatch::none(),
            factory: None,
            error_handler: ErrorHandler::default(),
            bootstrap: None,
            options: Vec::new(),
        }
    }

    /// Replaces the static settings.
    #[must_use]
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the service name.
    #[must_use]
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Bounds how long a single factory load may take.
    ///
    /// A load exceeding the timeout yields a temporary error for every caller waiting
    /// on it, and nothing is cached.
    #[must_use]
    pub fn load_timeout(mut self, timeout: Duration) -> Self {
        self.config.load_timeout = Some(timeout);
        self
    }

    /// Sets the dispatcher log events go to. Events are discarded by default.
    #[must_use]
    pub fn logger(mut self, log: Dispatch) -> Self {
        self.log = log;
        self
    }

    /// Sets the handler used for records without their own.
    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    /// Sets the factory loading options for scopes missing from the cache.
    #[must_use]
    pub fn option_factory(mut self, factory: OptionFactory<T>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Registers options applied at construction and again after every flush.
    #[must_use]
    pub fn bootstrap<F>(mut self, bootstrap: F) -> Self
    where
        F: Fn() -> Vec<ConfigOption<T>> + Send + Sync + 'static,
    {
        self.bootstrap = Some(Arc::new(bootstrap));
        self
    }

    /// Adds an option applied once at construction.
    #[must_use]
    pub fn option(mut self, option: ConfigOption<T>) -> Self {
        self.options.push(option);
        self
    }

    /// Adds options applied once at construction.
    #[must_use]
    pub fn options(mut self, options: impl IntoIterator<Item = ConfigOption<T>>) -> Self {
        self.options.extend(options);
        self
    }

    /// Creates the service and applies `Default`, the bootstrap options and the added
    /// options as one batch.
    ///
    /// # Errors
    ///
    /// Returns the first option error.
    pub fn build(self) -> Result<Service<T>> {
        let settings = Settings {
            name: self.config.name,
            log: self.log,
            factory: self.factory,
            error_handler: self.error_handler,
            load_timeout: self.config.load_timeout,
        };

        let service = Service {
            store: ScopeStore::default(),
            flight: Flight::new(),
            settings: RwLock::new(Arc::new(settings)),
            apply_lock: Mutex::new(()),
            bootstrap: self.bootstrap,
        };

        let bootstrap = service.bootstrap.as_ref().map(|bootstrap| bootstrap()).unwrap_or_default();
        service.options(
            std::iter::once(with_default_config(ScopeKey::DEFAULT))
                .chain(bootstrap)
                .chain(self.options),
        )?;
        Ok(service)
    }
}

impl<T> Debug for ServiceBuilder<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("config", &self.config)
            .field("options", &self.options.len())
            .finish_non_exhaustive()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Scope, with_disable, with_error_handler, with_logger};

    assert_impl_all!(Service<String>: Send, Sync, Debug);
    assert_impl_all!(ServiceBuilder<String>: Send);

    fn greeting(scope: Scope, value: &'static str) -> ConfigOption<String> {
        ConfigOption::scoped("greeting", [scope], move |config| {
            *config.payload_mut() = value.to_string();
            Ok(())
        })
    }

    #[test]
    fn new_service_holds_default() {
        let service: Service<String> = Service::new([]).expect("service builds");
        assert_eq!(service.len(), 1);
        assert!(!service.is_empty());
        assert_eq!(service.name(), "scopecache");

        let config = service.config_by_scope_key(ScopeKey::DEFAULT, None);
        assert!(config.is_valid().is_ok());
    }

    #[test]
    fn failing_batch_publishes_nothing() {
        let service = Service::new([greeting(Scope::DEFAULT, "Hello Default")]).expect("service builds");

        let result = service.options([
            greeting(Scope::website(1), "Website=1"),
            ConfigOption::scoped("greeting", [Scope::store(2)], |_config: &mut ScopedConfig<String>| {
                Err(Error::not_valid("rejected"))
            }),
        ]);

        let error = result.expect_err("batch must fail");
        assert_eq!(error.message(), "Store(2) greeting: rejected");
        assert!(service.config_by_scope_key(Scope::website(1).key(), None).is_valid().is_err());
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn published_records_are_never_modified() {
        let service = Service::new([greeting(Scope::website(1), "Website=1")]).expect("service builds");
        let before = service.config_by_scope_key(Scope::website(1).key(), None);

        service.options([with_disable(true, [Scope::website(1)])]).expect("options apply");

        let after = service.config_by_scope_key(Scope::website(1).key(), None);
        assert!(!before.is_disabled());
        assert!(after.is_disabled());
        assert_eq!(after.payload(), "Website=1");
    }

    #[test]
    fn missing_scope_without_fallback_is_not_found() {
        let service: Service<String> = Service::new([]).expect("service builds");
        let config = service.config_by_scope_key(Scope::store(3).key(), None);
        assert!(config.is_valid().expect_err("not found").is_not_found());
        assert_eq!(service.len(), 1, "error records are not cached");
    }

    #[test]
    fn error_response_prefers_record_handler() {
        let service: Service<String> = Service::new([with_error_handler(
            ErrorHandler::new(|_error: &Error| Response::new("custom".to_string())),
            [Scope::store(7)],
        )])
        .expect("service builds");

        let error = Error::temporary("busy");
        let custom = service.config_by_scope_key(Scope::store(7).key(), None);
        assert_eq!(service.error_response(&custom, &error).body(), "custom");

        let plain = service.config_by_scope_key(ScopeKey::DEFAULT, None);
        let response = service.error_response(&plain, &error);
        assert_eq!(response.status(), http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn service_options_replace_settings() {
        let service: Service<String> = Service::builder().name("geoip").build().expect("service builds");
        service.options([with_logger(Dispatch::none())]).expect("options apply");
        assert_eq!(service.name(), "geoip");
        assert!(format!("{service:?}").contains("geoip"));
    }

    #[test]
    fn flush_keeps_default_and_bootstrap() {
        let service = Service::builder()
            .bootstrap(|| vec![greeting(Scope::DEFAULT, "Hello Default")])
            .option(greeting(Scope::website(1), "Website=1"))
            .build()
            .expect("service builds");
        assert_eq!(service.len(), 2);

        service.flush_cache().expect("flush succeeds");

        assert_eq!(service.len(), 1);
        let config = service.config_by_scope_key(ScopeKey::DEFAULT, None);
        assert_eq!(config.payload(), "Hello Default");
    }

    #[test]
    fn debug_cache_lists_entries_in_key_order() {
        let service = Service::new([
            greeting(Scope::store(1), "Store=1"),
            greeting(Scope::website(2), "Website=2"),
        ])
        .expect("service builds");

        let mut out = Vec::new();
        service.debug_cache(&mut out).expect("writes to a vec");
        let out = String::from_utf8(out).expect("utf-8");
        let keys: Vec<_> = out.lines().filter_map(|line| line.split(" => ").next()).collect();
        assert_eq!(keys, ["Default(0)", "Website(2)", "Store(1)"]);
    }

    #[test]
    fn config_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.name(), "scopecache");
        assert_eq!(config.load_timeout(), None);

        let config = config.with_name("cors").with_load_timeout(Duration::from_secs(1));
        assert_eq!(config.name(), "cors");
        assert_eq!(config.load_timeout(), Some(Duration::from_secs(1)));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_deserializes_with_defaults() {
        let config: ServiceConfig = serde_json::from_str(r#"{"name":"cors"}"#).expect("valid json");
        assert_eq!(config.name(), "cors");
        assert_eq!(config.load_timeout(), None);
    }
}
