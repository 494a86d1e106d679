//! Structured error bodies.
//!
//! A [`ProblemDetail`] is the machine-readable description of a failed call
//! (status + type/title/detail), serialized as `application/problem+json`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Media type of a serialized [`ProblemDetail`].
pub const PROBLEM_JSON: &str = "application/problem+json";

/// Structured error description carrying an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetail {
    /// URI reference identifying the problem type.
    #[serde(rename = "type", default = "about_blank")]
    pub kind: String,
    /// Short human-readable summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// HTTP status code.
    pub status: u16,
    /// Explanation specific to this occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// URI reference of this occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

fn about_blank() -> String {
    "about:blank".to_string()
}

impl ProblemDetail {
    /// Problem with the given status and no further detail.
    #[must_use]
    pub fn for_status(status: u16) -> Self {
        Self {
            kind: about_blank(),
            title: None,
            status,
            detail: None,
            instance: None,
        }
    }

    /// Problem with the given status and detail message.
    #[must_use]
    pub fn for_status_and_detail(status: u16, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::for_status(status)
        }
    }

    /// Set the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the instance.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

impl fmt::Display for ProblemDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.title.as_deref().unwrap_or(&self.kind))?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}
