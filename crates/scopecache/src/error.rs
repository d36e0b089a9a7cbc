// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for scoped configuration resolution.

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use recoverable::{Recovery, RecoveryInfo};

use crate::ScopeKey;

/// Classification of a resolution failure.
///
/// # Handling Unknown Variants
///
/// This enum is `#[non_exhaustive]`; treat unrecognised variants like
/// [`ErrorKind::NotValid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// No record exists anywhere in the fallback chain.
    NotFound,
    /// A record exists but failed construction or validation.
    NotValid,
    /// The record is incomplete; retrying later may succeed.
    Temporary,
    /// An internal invariant was broken. Indicates a bug, not a data problem.
    Fatal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::NotValid => write!(f, "not valid"),
            Self::Temporary => write!(f, "temporary"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

type Source = Arc<dyn std::error::Error + Send + Sync>;

/// An error produced while applying options or resolving a scoped configuration.
///
/// Errors are cheap to clone so the same failure can be stored on a configuration
/// record and handed to every caller that observes it.
///
/// # Examples
///
/// ```
/// use scopecache::{Error, ErrorKind};
///
/// let error = Error::temporary("store is being reloaded");
/// assert_eq!(error.kind(), ErrorKind::Temporary);
/// assert!(error.is_temporary());
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[error("[scopecache] {kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: Cow<'static, str>,
    #[source]
    source: Option<Source>,
}

impl Error {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a [`ErrorKind::NotFound`] error for a scope.
    #[must_use]
    pub fn not_found(scope: ScopeKey) -> Self {
        Self::new(ErrorKind::NotFound, format!("no configuration for scope {scope}"))
    }

    /// Creates a [`ErrorKind::NotValid`] error.
    #[must_use]
    pub fn not_valid(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotValid, message)
    }

    /// Creates a [`ErrorKind::Temporary`] error.
    #[must_use]
    pub fn temporary(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Temporary, message)
    }

    /// Creates a [`ErrorKind::Fatal`] error.
    #[must_use]
    pub fn fatal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Wraps an underlying error, keeping it reachable through
    /// [`std::error::Error::source`].
    #[must_use]
    pub fn caused_by(
        kind: ErrorKind,
        message: impl Into<Cow<'static, str>>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Arc::from(source.into())),
        }
    }

    /// Prefixes the message with context, keeping kind and source.
    #[must_use]
    pub fn context(self, context: impl Display) -> Self {
        Self {
            message: Cow::Owned(format!("{context}: {}", self.message)),
            ..self
        }
    }

    /// Returns the classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` for [`ErrorKind::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Returns `true` for [`ErrorKind::NotValid`].
    #[must_use]
    pub fn is_not_valid(&self) -> bool {
        self.kind == ErrorKind::NotValid
    }

    /// Returns `true` for [`ErrorKind::Temporary`].
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.kind == ErrorKind::Temporary
    }

    /// Returns `true` for [`ErrorKind::Fatal`].
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }
}

impl Recovery for Error {
    fn recovery(&self) -> RecoveryInfo {
        match self.kind {
            ErrorKind::Temporary => RecoveryInfo::retry(),
            ErrorKind::NotFound | ErrorKind::NotValid => RecoveryInfo::never(),
            ErrorKind::Fatal => RecoveryInfo::unknown(),
        }
    }
}

/// A specialized [`Result`] type for scoped configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use recoverable::RecoveryKind;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Scope;

    assert_impl_all!(Error: Clone, Send, Sync, std::error::Error, Recovery);

    #[test]
    fn display_contains_kind_and_message() {
        let error = Error::not_valid("bad origin");
        assert_eq!(error.to_string(), "[scopecache] not valid: bad origin");
    }

    #[test]
    fn not_found_names_scope() {
        let error = Error::not_found(Scope::store(3).key());
        assert!(error.is_not_found());
        assert!(error.message().contains("Store(3)"), "got: {error}");
    }

    #[test]
    fn context_preserves_kind_and_source() {
        let error = Error::caused_by(ErrorKind::NotValid, "parse failed", "unexpected token")
            .context("Website(1)")
            .context("allowed_origins");

        assert_eq!(error.kind(), ErrorKind::NotValid);
        assert_eq!(error.message(), "allowed_origins: Website(1): parse failed");
        assert_eq!(error.source().map(ToString::to_string).as_deref(), Some("unexpected token"));
    }

    #[test]
    fn classification_maps_to_recovery() {
        assert_eq!(Error::temporary("x").recovery().kind(), RecoveryKind::Retry);
        assert_eq!(Error::not_valid("x").recovery().kind(), RecoveryKind::Never);
        assert_eq!(Error::not_found(ScopeKey::DEFAULT).recovery().kind(), RecoveryKind::Never);
        assert_eq!(Error::fatal("x").recovery().kind(), RecoveryKind::Unknown);
    }

    #[test]
    fn predicates_are_exclusive() {
        let error = Error::fatal("flight lost");
        assert!(error.is_fatal());
        assert!(!error.is_temporary());
        assert!(!error.is_not_found());
        assert!(!error.is_not_valid());
    }
}
