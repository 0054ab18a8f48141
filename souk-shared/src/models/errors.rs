use serde::{Deserialize, Serialize};

/// Error body returned by the backend's REST surface.
///
/// Mirrors the `PostgREST` shape: a machine code, a message and optional
/// details/hint strings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ApiError {
    /// Backend error code (e.g. `"40001"` for a serialization conflict)
    #[serde(default)]
    pub code: Option<String>,
    /// The main error message
    pub message: String,
    /// Optional additional details about the error
    #[serde(default)]
    pub details: Option<String>,
    /// Optional hint for resolving the error
    #[serde(default)]
    pub hint: Option<String>,
}

impl ApiError {
    /// Creates a new error body with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            details: None,
            hint: None,
        }
    }

    /// Attaches a backend error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attaches details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Serialization failures and lock conflicts are reported with `PostgreSQL`
    /// class 40 codes; the caller may retry them.
    pub fn is_conflict(&self) -> bool {
        self.code.as_deref().is_some_and(|code| code.starts_with("40"))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, &self.details) {
            (Some(code), Some(details)) => write!(f, "[{code}] {}: {details}", self.message),
            (Some(code), None) => write!(f, "[{code}] {}", self.message),
            (None, Some(details)) => write!(f, "{}: {details}", self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ApiError {}
