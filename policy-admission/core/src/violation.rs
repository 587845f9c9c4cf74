use std::fmt;

/// Classifies a violation. `Internal` carries a distinct meaning: the
/// policy could not be evaluated because of an external failure, not
/// because the object breached it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Invalid,
    NotSupported,
    Forbidden,
    Required,
    Internal,
}

/// A single field-level policy breach found during a review.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path into the reviewed object.
    pub field: String,

    /// The offending value, rendered for the denial message.
    pub bad_value: String,

    /// Human-readable explanation.
    pub detail: String,

    pub kind: ErrorKind,
}

impl Violation {
    pub fn invalid(
        field: impl Into<String>,
        bad_value: impl fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Invalid, field, bad_value, detail)
    }

    pub fn not_supported(
        field: impl Into<String>,
        bad_value: impl fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::NotSupported, field, bad_value, detail)
    }

    pub fn forbidden(
        field: impl Into<String>,
        bad_value: impl fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Forbidden, field, bad_value, detail)
    }

    pub fn required(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Required, field, "", detail)
    }

    /// Marks an evaluation failure. The field is the name of the
    /// authorizer that could not run.
    pub fn internal(authorizer: &str, detail: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, authorizer, "", detail.to_string())
    }

    pub fn is_internal(&self) -> bool {
        self.kind == ErrorKind::Internal
    }

    fn new(
        kind: ErrorKind,
        field: impl Into<String>,
        bad_value: impl fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            bad_value: bad_value.to_string(),
            detail: detail.into(),
            kind,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} : {}", self.field, self.bad_value, self.detail)
    }
}

/// Joins violations into the denial message returned to the orchestrator.
pub fn join_details(errs: &[Violation]) -> String {
    errs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
