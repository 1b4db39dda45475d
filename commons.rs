//! Shared helpers used across the crate.

use derive_more::Display;

/// A program that has passed validation.  The analysis only accepts
/// validated programs, so anything wrapped in this type is known to have
/// no dangling names, no value-recursive structs, etc.
#[derive(Clone, Debug)]
pub struct Valid<T>(pub T);

/// A validation error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ValidationError(pub String);
impl std::error::Error for ValidationError {}
