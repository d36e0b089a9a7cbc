// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A CORS-style middleware built on `scopecache`.
//!
//! The payload holds the allowed origins of a tenant. A fake backend stores them per
//! scope and is queried lazily by the option factory; requests are answered with the
//! resolved configuration or with the scope's error response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::{Response, StatusCode};
use scopecache::{
    ConfigOption, Error, OptionFactory, Result, Scope, ScopeKey, Scoped, ScopedConfig, ScopedGetter, Service, with_disable, with_mark_partially_applied,
};
use tracing::Dispatch;

#[derive(Debug, Clone, Default)]
struct Cors {
    allowed_origins: Vec<String>,
    allow_credentials: bool,
}

fn with_allowed_origins(origins: Vec<String>, scopes: impl IntoIterator<Item = Scope>) -> ConfigOption<Cors> {
    ConfigOption::scoped("allowed_origins", scopes, move |config: &mut ScopedConfig<Cors>| {
        if let Some(origin) = origins.iter().find(|origin| !origin.starts_with("https://")) {
            return Err(Error::not_valid(format!("origin {origin:?} must use https")));
        }
        config.payload_mut().allowed_origins = origins;
        Ok(())
    })
}

fn with_allow_credentials(allow: bool, scopes: impl IntoIterator<Item = Scope>) -> ConfigOption<Cors> {
    ConfigOption::scoped("allow_credentials", scopes, move |config: &mut ScopedConfig<Cors>| {
        config.payload_mut().allow_credentials = allow;
        Ok(())
    })
}

/// Settings as a slow key-value backend would return them.
#[derive(Default)]
struct Backend {
    origins: HashMap<Scope, Vec<&'static str>>,
    disabled: Vec<Scope>,
}

impl Backend {
    async fn options(&self, scoped: Scoped) -> Result<Vec<ConfigOption<Cors>>> {
        tokio::time::sleep(Duration::from_millis(20)).await;

        let scope = scoped.scope();
        let scopes = [scope, scoped.parent()];
        let mut options = vec![with_mark_partially_applied(false, scopes)];
        if let Some(origins) = self.origins.get(&scope) {
            let origins = origins.iter().map(ToString::to_string).collect();
            options.push(with_allowed_origins(origins, scopes));
        }
        if self.disabled.contains(&scope) {
            options.push(with_disable(true, scopes));
        }
        Ok(options)
    }
}

async fn handle(service: &Service<Cors>, scoped: Scoped, origin: &str) -> Response<String> {
    let config = service.config_by_scoped_getter(scoped).await;
    if let Err(error) = config.is_valid() {
        return service.error_response(&config, &error);
    }
    if config.is_disabled() {
        return Response::new("no CORS headers".to_string());
    }

    let cors = config.payload();
    let mut response = Response::new(String::new());
    if cors.allowed_origins.iter().any(|allowed| allowed == origin) {
        *response.body_mut() = format!("allow {origin} (credentials: {})", cors.allow_credentials);
    } else {
        *response.status_mut() = StatusCode::FORBIDDEN;
        *response.body_mut() = format!("origin {origin} is not allowed");
    }
    response
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let backend = Arc::new(Backend {
        origins: HashMap::from([
            (Scope::website(1), vec!["https://shop.example"]),
            (Scope::store(2), vec!["https://de.shop.example"]),
            (Scope::store(3), vec!["http://insecure.example"]),
        ]),
        disabled: vec![Scope::website(4)],
    });

    let loader = Arc::clone(&backend);
    let service = Service::builder()
        .name("cors")
        .logger(Dispatch::new(tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).finish()))
        .load_timeout(Duration::from_secs(1))
        .bootstrap(|| {
            vec![
                with_allowed_origins(vec!["https://example.com".to_string()], [Scope::DEFAULT]),
                with_allow_credentials(false, [Scope::DEFAULT]),
            ]
        })
        .option_factory(OptionFactory::new(move |scoped| {
            let backend = Arc::clone(&loader);
            async move { backend.options(scoped).await }
        }))
        .build()?;

    let requests = [
        (Scoped::new(1, 0), "https://shop.example"),
        (Scoped::new(1, 2), "https://de.shop.example"),
        (Scoped::new(1, 2), "https://shop.example"),
        (Scoped::new(1, 3), "http://insecure.example"),
        (Scoped::new(4, 0), "https://anything.example"),
        (Scoped::new(9, 0), "https://example.com"),
    ];

    for (scoped, origin) in requests {
        let response = handle(&service, scoped, origin).await;
        println!("{} {origin}: {} {}", scoped.scope(), response.status(), response.body());
    }

    let mut dump = Vec::new();
    service.debug_cache(&mut dump).map_err(|error| Error::caused_by(scopecache::ErrorKind::Fatal, "cannot dump cache", error))?;
    println!("{}", String::from_utf8_lossy(&dump));

    service.flush_cache()?;
    let default = service.config_by_scope_key(ScopeKey::DEFAULT, None);
    println!("after flush: {:?}", default.payload());
    Ok(())
}
