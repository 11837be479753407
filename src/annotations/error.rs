//! Annotation extraction errors.

use thiserror::Error;

use crate::annotations::Group;

/// Errors produced while validating or parsing annotation groups.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnnotationError {
    /// The directive is not set. Absorbed by the extractor.
    #[error("annotation {0} is not set")]
    Missing(String),

    /// A present value could not be parsed.
    #[error("the annotation {annotation} does not contain a valid value ({value:?})")]
    InvalidContent { annotation: String, value: String },

    /// A value failed the group's safety checks.
    #[error("annotation group {group} contains risky annotation based on ingress configuration")]
    Risky { group: Group, annotation: String },

    /// Values are individually valid but cannot be honoured together.
    #[error("{0}")]
    NotSatisfiable(String),

    /// A referenced service does not exist or exposes no usable port.
    #[error("backend service {service} cannot be resolved in namespace {namespace}")]
    UnresolvedBackend { namespace: String, service: String },
}

impl AnnotationError {
    pub fn invalid(annotation: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidContent {
            annotation: annotation.into(),
            value: value.into(),
        }
    }

    /// Soft errors leave the group at its zero value.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing(_))
    }
}

pub type AnnotationResult<T> = Result<T, AnnotationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AnnotationError::invalid("x/allow-list", "bad");
        assert_eq!(
            err.to_string(),
            "the annotation x/allow-list does not contain a valid value (\"bad\")"
        );

        let err = AnnotationError::Risky {
            group: Group::Redirect,
            annotation: "x/redirect".into(),
        };
        assert!(err.to_string().contains("redirect"));
        assert!(!err.is_missing());
        assert!(AnnotationError::Missing("x".into()).is_missing());
    }
}
