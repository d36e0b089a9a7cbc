// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Resolves per-tenant configuration through a hierarchical, coalescing cache.
//!
//! Multi-tenant services vary their behavior per *scope*: a `Default` scope, websites,
//! and stores inside websites. Every request needs the currently valid configuration
//! of its scope, usually from a slow backend, without redundant, racing or stale loads.
//! This crate provides that engine once, generic over the domain payload, so each
//! scope-aware middleware (CORS, `GeoIP`, authentication, ...) only supplies its fields
//! and options.
//!
//! # Overview
//!
//! - [`Service`] owns the cache of [`ScopedConfig`] records and resolves requests.
//! - [`ConfigOption`] is a one-shot change to a scope's record or to the service;
//!   batches of options are applied atomically.
//! - [`OptionFactory`] loads the options of a scope on first use.
//! - [`ScopedGetter`] tells the service which scope a request belongs to.
//!
//! # Resolution
//!
//! [`Service::config_by_scoped_getter`] returns a valid record cached for the scope
//! directly. Otherwise it runs the factory once for that scope, coalescing concurrent
//! requests, and walks `Store → Website → Default`. The record found up the chain is
//! cached under the requested scope too, so the walk happens once per scope until the
//! next [`Service::flush_cache`].
//!
//! Records are immutable once published. Callers always get a record and check it
//! with [`ScopedConfig::is_valid`]; errors are classified by [`ErrorKind`] so
//! temporary conditions can be retried.
//!
//! # Example
//!
//! ```
//! use scopecache::{ConfigOption, OptionFactory, Scope, ScopedGetter, Service, with_option_factory};
//!
//! fn with_allowed_origins(scope: Scope, origins: Vec<String>) -> ConfigOption<Vec<String>> {
//!     ConfigOption::scoped("allowed_origins", [scope], move |config| {
//!         *config.payload_mut() = origins;
//!         Ok(())
//!     })
//! }
//!
//! # async fn example() -> scopecache::Result<()> {
//! let factory = OptionFactory::new(|scoped: scopecache::Scoped| async move {
//!     // Query the backend for this scope here.
//!     Ok::<_, scopecache::Error>(vec![with_allowed_origins(scoped.scope(), vec!["https://shop.example".into()])])
//! });
//!
//! let service = Service::new([with_option_factory(factory)])?;
//! let config = service.config_by_scope(1, 2).await?;
//! assert_eq!(config.payload(), &["https://shop.example"]);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
pub mod flight;
mod handler;
mod options;
mod scope;
mod service;
mod store;

pub use config::ScopedConfig;
pub use error::{Error, ErrorKind, Result};
pub use handler::{ErrorHandler, service_unavailable};
pub use options::{
    ConfigOption, OptionFactory, with_default_config, with_disable, with_error_handler, with_logger,
    with_mark_partially_applied, with_option_factory,
};
pub use scope::{Scope, ScopeKey, ScopeKind, Scoped, ScopedGetter};
pub use service::{Service, ServiceBuilder, ServiceConfig};
