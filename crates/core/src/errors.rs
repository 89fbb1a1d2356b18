use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::directory::DirectoryError;
use crate::domain::request::RequestStatus;

/// A single problem with submitted input, addressed by its JSON path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError::new(field, message));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|error| error.field.as_str())
    }

    pub fn into_result<T>(self, value: T) -> Result<T, ValidationErrors> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> =
            self.0.iter().map(|error| format!("{}: {}", error.field, error.message)).collect();
        f.write_str(&rendered.join("; "))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("configuration failure: {0}")]
    Configuration(String),
    #[error("approver `{approver_id}` is not eligible to decide at level {level_number}")]
    Unauthorized { approver_id: String, level_number: u32 },
    #[error("request `{request_id}` is {status} and accepts no further transitions")]
    InvalidState { request_id: String, status: RequestStatus },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
}

impl WorkflowError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(ValidationErrors(vec![FieldError::new(field, message)]))
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::Configuration(_) => "configuration",
            Self::Unauthorized { .. } => "unauthorized",
            Self::InvalidState { .. } => "invalid_state",
            Self::Persistence(_) => "persistence",
            Self::Integration(_) => "integration",
        }
    }
}

impl From<ValidationErrors> for WorkflowError {
    fn from(value: ValidationErrors) -> Self {
        Self::Validation(value)
    }
}

impl From<DirectoryError> for WorkflowError {
    fn from(value: DirectoryError) -> Self {
        Self::Integration(value.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("unprocessable input: {message}")]
    Unprocessable { message: String, fields: Vec<FieldError>, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("failed dependency: {message}")]
    FailedDependency { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Unprocessable { .. } => "The submitted data is invalid. Fix the listed fields and retry.",
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::Conflict { .. } => {
                "The action conflicts with the current state of the resource. Reload and retry."
            }
            Self::Forbidden { .. } => "You are not an eligible approver for this step.",
            Self::FailedDependency { .. } => {
                "The approval route could not be resolved. An administrator must fix the hierarchy."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Unprocessable { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::FailedDependency { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. } => correlation_id,
        }
    }
}

impl WorkflowError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::Unprocessable { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::FailedDependency { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<WorkflowError> for InterfaceError {
    fn from(value: WorkflowError) -> Self {
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            WorkflowError::Validation(errors) => {
                Self::Unprocessable { message, fields: errors.0, correlation_id }
            }
            WorkflowError::NotFound { .. } => Self::NotFound { message, correlation_id },
            WorkflowError::Conflict(_) | WorkflowError::InvalidState { .. } => {
                Self::Conflict { message, correlation_id }
            }
            WorkflowError::Unauthorized { .. } => Self::Forbidden { message, correlation_id },
            WorkflowError::Configuration(_) => Self::FailedDependency { message, correlation_id },
            WorkflowError::Persistence(_) | WorkflowError::Integration(_) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::request::RequestStatus;
    use crate::errors::{InterfaceError, ValidationErrors, WorkflowError};

    #[test]
    fn validation_error_keeps_field_detail_at_the_interface() {
        let mut errors = ValidationErrors::default();
        errors.push("name", "must not be empty");
        errors.push("levels[0].approverRole", "is required for ROLE_BASED levels");

        let interface = WorkflowError::from(errors).into_interface("req-1");

        match interface {
            InterfaceError::Unprocessable { ref fields, ref correlation_id, .. } => {
                assert_eq!(correlation_id, "req-1");
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[1].field, "levels[0].approverRole");
            }
            other => panic!("expected unprocessable, got {other:?}"),
        }
    }

    #[test]
    fn invalid_state_maps_to_conflict() {
        let interface = WorkflowError::InvalidState {
            request_id: "APR-1".to_owned(),
            status: RequestStatus::Approved,
        }
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::Conflict { .. }));
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn unauthorized_maps_to_forbidden_with_user_safe_message() {
        let interface =
            WorkflowError::Unauthorized { approver_id: "u-9".to_owned(), level_number: 2 }
                .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::Forbidden { .. }));
        assert_eq!(interface.user_message(), "You are not an eligible approver for this step.");
    }

    #[test]
    fn configuration_error_maps_to_failed_dependency() {
        let interface = WorkflowError::Configuration("no users hold FINANCE_TEAM".to_owned())
            .into_interface("req-4");

        assert!(matches!(interface, InterfaceError::FailedDependency { .. }));
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface =
            WorkflowError::Persistence("database lock timeout".to_owned()).into_interface("req-5");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }
}
