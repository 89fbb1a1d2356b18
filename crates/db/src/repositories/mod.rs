use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use tollgate_core::domain::hierarchy::{
    ApprovalHierarchy, EntityType, HierarchyFilter, HierarchyId, HierarchySummary,
};
use tollgate_core::domain::request::{
    ApprovalRequest, ApprovalRequestId, RequestFilter, RequestTransition,
};
use tollgate_core::errors::WorkflowError;

pub mod directory;
pub mod hierarchy;
pub mod memory;
pub mod request;

pub use directory::SqlApproverDirectory;
pub use hierarchy::SqlHierarchyRepository;
pub use memory::InMemoryApprovalStore;
pub use request::SqlApprovalRequestRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
}

impl RepositoryError {
    fn from_write(error: sqlx::Error, what: impl FnOnce() -> String) -> Self {
        match &error {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict(what()),
            _ => Self::Database(error),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<RepositoryError> for WorkflowError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Conflict(message) => Self::Conflict(message),
            RepositoryError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepositoryError::Database(_) | RepositoryError::Decode(_) => {
                Self::Persistence(value.to_string())
            }
        }
    }
}

#[async_trait]
pub trait HierarchyRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &HierarchyId,
    ) -> Result<Option<ApprovalHierarchy>, RepositoryError>;

    async fn find_active_default(
        &self,
        entity_type: EntityType,
    ) -> Result<Option<ApprovalHierarchy>, RepositoryError>;

    /// Matching hierarchies ordered by name, each with its request count.
    async fn list(&self, filter: &HierarchyFilter)
        -> Result<Vec<HierarchySummary>, RepositoryError>;

    /// Stores a new hierarchy. When it is the active default, every other
    /// hierarchy of the same entity type loses its default flag atomically.
    async fn insert(&self, hierarchy: ApprovalHierarchy) -> Result<(), RepositoryError>;

    /// Replaces a stored hierarchy whose version is `hierarchy.version - 1`.
    async fn update(&self, hierarchy: ApprovalHierarchy) -> Result<(), RepositoryError>;

    /// Removes the hierarchy and its levels unless a live request uses it.
    async fn delete(&self, id: &HierarchyId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ApprovalRequestRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError>;

    /// Matching requests, oldest first.
    async fn list(&self, filter: &RequestFilter) -> Result<Vec<ApprovalRequest>, RepositoryError>;

    /// In-progress requests with ids after `after`, in id order.
    async fn list_in_progress(
        &self,
        after: Option<&ApprovalRequestId>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError>;

    async fn insert(
        &self,
        request: ApprovalRequest,
        transitions: Vec<RequestTransition>,
    ) -> Result<(), RepositoryError>;

    /// Saves `request` only if the stored copy is still at `expected_state_version`.
    async fn update(
        &self,
        request: ApprovalRequest,
        expected_state_version: u32,
        transitions: Vec<RequestTransition>,
    ) -> Result<(), RepositoryError>;

    async fn list_transitions(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Vec<RequestTransition>, RepositoryError>;
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_optional_u32(
    column: &str,
    value: Option<i64>,
) -> Result<Option<u32>, RepositoryError> {
    value.map(|value| parse_u32(column, value)).transpose()
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
