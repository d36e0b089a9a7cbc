// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fallback responses for requests whose scoped configuration is unusable.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Response, StatusCode};

use crate::Error;

/// Renders the response served when a scope's configuration cannot be used.
///
/// Middleware calls the handler instead of continuing request processing whenever the
/// resolved configuration reports an error. The default handler answers
/// `503 Service Unavailable` with the error text as a plain-text body.
///
/// # Examples
///
/// ```
/// use http::StatusCode;
/// use scopecache::{Error, ErrorHandler};
///
/// let handler = ErrorHandler::new(|_error: &Error| {
///     let mut response = http::Response::new("try again later".to_string());
///     *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
///     response
/// });
///
/// let response = handler.call(&Error::temporary("reloading"));
/// assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
/// ```
#[derive(Clone)]
pub struct ErrorHandler(Arc<dyn Fn(&Error) -> Response<String> + Send + Sync>);

impl ErrorHandler {
    /// Wraps a rendering function.
    #[must_use]
    pub fn new<F>(render: F) -> Self
    where
        F: Fn(&Error) -> Response<String> + Send + Sync + 'static,
    {
        Self(Arc::new(render))
    }

    /// Renders the response for `error`.
    #[must_use]
    pub fn call(&self, error: &Error) -> Response<String> {
        (self.0)(error)
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(service_unavailable)
    }
}

impl Debug for ErrorHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler").finish_non_exhaustive()
    }
}

/// The default rendering: `503 Service Unavailable` with the error as body.
#[must_use]
pub fn service_unavailable(error: &Error) -> Response<String> {
    let mut response = Response::new(error.to_string());
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
