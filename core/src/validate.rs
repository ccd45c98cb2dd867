//! Structural request validation.
//!
//! Requests opt in by implementing [`Validate`]. Implementations collect every
//! violation into [`ValidationErrors`] using the rule helpers on
//! [`ValidationErrors`], so a caller sees all problems at once:
//!
//! ```
//! use relay_core::validate::{Validate, ValidationErrors};
//!
//! struct SaveBookRequest {
//!     name: String,
//!     author_id: i64,
//! }
//!
//! impl Validate for SaveBookRequest {
//!     fn validate(&self) -> Result<(), ValidationErrors> {
//!         let mut errors = ValidationErrors::new();
//!         errors.name("name", &self.name);
//!         errors.id("author_id", self.author_id);
//!         errors.into_result()
//!     }
//! }
//!
//! let err = SaveBookRequest { name: "x".into(), author_id: 0 }.validate().unwrap_err();
//! assert_eq!(err.fields().len(), 2);
//! assert_eq!(err.fields()[0].message, "name must be between 2 and 100 characters");
//! ```

use crate::error::{AppError, PLATFORM_VALIDATION};
use serde::Serialize;
use std::fmt;

/// Minimum length of a name, after trimming.
pub const MIN_NAME_LENGTH: usize = 2;
/// Maximum length of a name, after trimming.
pub const MAX_NAME_LENGTH: usize = 100;
/// Smallest valid id.
pub const MIN_ID_VALUE: i64 = 1;

/// A request that can check its own structure.
pub trait Validate {
    /// Check the request.
    ///
    /// # Errors
    ///
    /// Returns every violated rule.
    fn validate(&self) -> Result<(), ValidationErrors>;
}

/// A single violated rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Field name as seen by clients.
    pub field: String,
    /// Rule tag (`required`, `name`, `id`, `name_format`, `name_no_special`).
    pub tag: &'static str,
    /// Human-readable message.
    pub message: String,
}

/// All rules violated by a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    fields: Vec<FieldError>,
}

impl ValidationErrors {
    /// Create an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Record a violation.
    pub fn add(&mut self, field: impl Into<String>, tag: &'static str, message: impl Into<String>) {
        self.fields.push(FieldError {
            field: field.into(),
            tag,
            message: message.into(),
        });
    }

    /// The recorded violations, in insertion order.
    #[must_use]
    pub fn fields(&self) -> &[FieldError] {
        &self.fields
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    ///
    /// # Errors
    ///
    /// Returns `self` when at least one violation was recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }

    /// `required`: the trimmed value is non-empty.
    pub fn required(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.add(field, "required", format!("{field} is a required field"));
        }
    }

    /// `name`: the trimmed value is between [`MIN_NAME_LENGTH`] and [`MAX_NAME_LENGTH`] characters.
    pub fn name(&mut self, field: &str, value: &str) {
        let len = value.trim().chars().count();
        if !(MIN_NAME_LENGTH..=MAX_NAME_LENGTH).contains(&len) {
            self.add(
                field,
                "name",
                format!("{field} must be between {MIN_NAME_LENGTH} and {MAX_NAME_LENGTH} characters"),
            );
        }
    }

    /// `id`: the value is at least [`MIN_ID_VALUE`].
    pub fn id(&mut self, field: &str, value: i64) {
        if value < MIN_ID_VALUE {
            self.add(field, "id", format!("{field} must be a positive number"));
        }
    }

    /// `name_format`: ASCII letters, digits, whitespace and `-_.,!?()`, 2 to 100 characters.
    pub fn name_format(&mut self, field: &str, value: &str) {
        let allowed = |c: char| c.is_ascii_alphanumeric() || c.is_whitespace() || "-_.,!?()".contains(c);
        let len = value.chars().count();
        if !(MIN_NAME_LENGTH..=MAX_NAME_LENGTH).contains(&len) || !value.chars().all(allowed) {
            self.add(field, "name_format", format!("{field} contains invalid characters"));
        }
    }

    /// `name_no_special`: non-empty, only ASCII letters, digits and whitespace.
    pub fn name_no_special(&mut self, field: &str, value: &str) {
        let plain = |c: char| c.is_ascii_alphanumeric() || c.is_whitespace();
        if value.is_empty() || !value.chars().all(plain) {
            self.add(
                field,
                "name_no_special",
                format!("{field} must not contain special characters"),
            );
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.fields.iter().map(|e| e.message.as_str()).collect();
        write!(f, "validation failed: {}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationErrors> for AppError {
    fn from(errors: ValidationErrors) -> Self {
        let fields = serde_json::to_value(&errors.fields).unwrap_or_default();
        Self::new(PLATFORM_VALIDATION)
            .with_metadata("fields", fields)
            .wrap(errors)
    }
}
