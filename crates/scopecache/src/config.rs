// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-scope configuration record.

use std::fmt::{self, Debug, Formatter};

use crate::{Error, ErrorHandler, Result, ScopeKey};

/// A configuration snapshot answering for one scope.
///
/// Records are built privately, published once and never changed afterwards; a new
/// configuration for a scope is always a new record. The same published record may
/// answer for several scopes: a store without its own configuration shares its
/// website's or the default record.
///
/// `T` is the domain payload (for example the allowed origins of a CORS middleware).
/// The generic fields around it describe whether the payload may be used at all.
///
/// # Validity
///
/// Call [`ScopedConfig::is_valid`] before using the payload. A disabled record is
/// valid; callers check [`ScopedConfig::is_disabled`] separately and skip their
/// domain logic for it.
#[derive(Clone)]
pub struct ScopedConfig<T> {
    scope_key: ScopeKey,
    parent_key: ScopeKey,
    last_err: Option<Error>,
    disabled: bool,
    partially_applied: bool,
    error_handler: Option<ErrorHandler>,
    payload: T,
}

impl<T: Default> ScopedConfig<T> {
    /// Creates an empty record for `scope_key` with a default payload.
    #[must_use]
    pub fn new(scope_key: ScopeKey) -> Self {
        Self {
            scope_key,
            parent_key: ScopeKey::default(),
            last_err: None,
            disabled: false,
            partially_applied: false,
            error_handler: None,
            payload: T::default(),
        }
    }

    /// Creates a terminal record carrying `error`.
    #[must_use]
    pub fn from_error(scope_key: ScopeKey, error: Error) -> Self {
        Self {
            last_err: Some(error),
            ..Self::new(scope_key)
        }
    }
}

impl<T> ScopedConfig<T> {
    /// Returns the scope this record was written for.
    ///
    /// For a shared record this is the scope that owns it, not the scope it was
    /// resolved for.
    #[must_use]
    pub fn scope_key(&self) -> ScopeKey {
        self.scope_key
    }

    /// Returns the scope this record inherited its initial values from, or the unset
    /// key if it was created from scratch.
    #[must_use]
    pub fn parent_key(&self) -> ScopeKey {
        self.parent_key
    }

    /// Returns the error recorded while building this record.
    #[must_use]
    pub fn last_err(&self) -> Option<&Error> {
        self.last_err.as_ref()
    }

    /// Returns `true` when the scope opted out of the domain logic.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns `true` while a multi-step load for this scope is incomplete.
    #[must_use]
    pub fn is_partially_applied(&self) -> bool {
        self.partially_applied
    }

    /// Returns the scope specific error handler, if one was configured.
    #[must_use]
    pub fn error_handler(&self) -> Option<&ErrorHandler> {
        self.error_handler.as_ref()
    }

    /// Returns the domain payload.
    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Returns the domain payload for modification.
    ///
    /// Only reachable while a record is being built by an option; published records
    /// are shared behind `Arc` and cannot be borrowed mutably.
    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }

    /// Checks whether the payload may be used.
    ///
    /// # Errors
    ///
    /// - the recorded error, if building the record failed;
    /// - [`ErrorKind::Temporary`](crate::ErrorKind::Temporary) while the record is
    ///   partially applied;
    /// - [`ErrorKind::NotValid`](crate::ErrorKind::NotValid) if the record was never
    ///   assigned a scope.
    pub fn is_valid(&self) -> Result<()> {
        if let Some(error) = &self.last_err {
            return Err(error.clone());
        }
        if self.partially_applied {
            return Err(Error::temporary(format!(
                "configuration for scope {} is partially applied",
                self.scope_key
            )));
        }
        if self.scope_key.is_unset() {
            return Err(Error::not_valid("configuration was never assigned a scope"));
        }
        Ok(())
    }

    pub(crate) fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    pub(crate) fn set_partially_applied(&mut self, partially_applied: bool) {
        self.partially_applied = partially_applied;
    }

    pub(crate) fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }
}

impl<T: Clone> ScopedConfig<T> {
    /// Copies this record as the starting point of a record for `target`.
    pub(crate) fn inherit(&self, target: ScopeKey) -> Self {
        Self {
            scope_key: target,
            parent_key: self.scope_key,
            ..self.clone()
        }
    }
}

impl<T: Debug> Debug for ScopedConfig<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedConfig")
            .field("scope", &format_args!("{}", self.scope_key))
            .field("parent", &format_args!("{}", self.parent_key))
            .field("last_err", &self.last_err.as_ref().map(ToString::to_string))
            .field("disabled", &self.disabled)
            .field("partially_applied", &self.partially_applied)
            .field("error_handler", &self.error_handler.is_some())
            .field("payload", &self.payload)
            .finish()
    }
}
