//! JSON API over the approval workflow.
//!
//! Endpoints:
//! - `GET    /approval-hierarchies?entityType=&isActive=`
//! - `POST   /approval-hierarchies`
//! - `GET    /approval-hierarchies/{id}`
//! - `PUT    /approval-hierarchies/{id}`
//! - `DELETE /approval-hierarchies/{id}`
//! - `POST   /approval-requests/preview`
//! - `POST   /approval-requests`
//! - `GET    /approval-requests?status=&hierarchyId=&approverId=`
//! - `GET    /approval-requests/{id}`
//! - `GET    /approval-requests/{id}/transitions`
//! - `POST   /approval-requests/{id}/decide`
//! - `POST   /approval-requests/{id}/check-timeout`

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use tollgate_core::approvals::{ApprovalPlan, HierarchyDraft, HierarchyPatch};
use tollgate_core::domain::hierarchy::{
    ApprovalHierarchy, EntityType, HierarchyFilter, HierarchyId, HierarchySummary,
};
use tollgate_core::domain::request::{
    ApprovalRequest, ApprovalRequestId, RequestFilter, RequestStatus, RequestTransition,
};
use tollgate_core::domain::UserId;
use tollgate_core::errors::{FieldError, InterfaceError, ValidationErrors, WorkflowError};
use tollgate_db::{ApprovalWorkflow, DecisionInput, SubmissionInput};

const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    workflow: Arc<ApprovalWorkflow>,
}

impl ApiState {
    pub fn new(workflow: Arc<ApprovalWorkflow>) -> Self {
        Self { workflow }
    }
}

pub fn router(workflow: Arc<ApprovalWorkflow>) -> Router {
    Router::new()
        .route("/approval-hierarchies", get(list_hierarchies).post(create_hierarchy))
        .route(
            "/approval-hierarchies/{id}",
            get(get_hierarchy).put(update_hierarchy).delete(delete_hierarchy),
        )
        .route("/approval-requests/preview", post(preview_request))
        .route("/approval-requests", get(list_requests).post(submit_request))
        .route("/approval-requests/{id}", get(get_request))
        .route("/approval-requests/{id}/transitions", get(list_transitions))
        .route("/approval-requests/{id}/decide", post(decide))
        .route("/approval-requests/{id}/check-timeout", post(check_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState::new(workflow))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyListQuery {
    pub entity_type: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestListQuery {
    pub status: Option<String>,
    pub hierarchy_id: Option<String>,
    pub approver_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: &'static str,
    pub detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
    pub correlation_id: String,
}

/// Interface error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    fn from_workflow(error: WorkflowError, correlation_id: &str) -> Self {
        warn!(
            event_name = "api.request.failed",
            correlation_id = %correlation_id,
            error_class = error.error_class(),
            error = %error,
            "api request failed"
        );
        Self(error.into_interface(correlation_id))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            InterfaceError::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            InterfaceError::FailedDependency { .. } => StatusCode::FAILED_DEPENDENCY,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn body(&self) -> ErrorBody {
        let (error, detail, fields) = match &self.0 {
            InterfaceError::Unprocessable { message, fields, .. } => {
                ("unprocessable", message.clone(), fields.clone())
            }
            InterfaceError::NotFound { message, .. } => ("not_found", message.clone(), Vec::new()),
            InterfaceError::Conflict { message, .. } => ("conflict", message.clone(), Vec::new()),
            InterfaceError::Forbidden { message, .. } => ("forbidden", message.clone(), Vec::new()),
            InterfaceError::FailedDependency { message, .. } => {
                ("failed_dependency", message.clone(), Vec::new())
            }
            InterfaceError::ServiceUnavailable { message, .. } => {
                ("service_unavailable", message.clone(), Vec::new())
            }
        };
        ErrorBody {
            error,
            message: self.0.user_message(),
            detail,
            fields,
            correlation_id: self.0.correlation_id().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4()))
}

pub async fn list_hierarchies(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<HierarchyListQuery>,
) -> ApiResult<Json<Vec<HierarchySummary>>> {
    let correlation_id = correlation_id(&headers);
    let entity_type = match query.entity_type.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(EntityType::parse(raw).ok_or_else(|| {
            ApiError::from_workflow(
                WorkflowError::validation(
                    "entityType",
                    format!("`{raw}` is not a recognized entity type"),
                ),
                &correlation_id,
            )
        })?),
    };

    let filter = HierarchyFilter { entity_type, is_active: query.is_active };
    state
        .workflow
        .list_hierarchies(&filter)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn create_hierarchy(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(draft): Json<HierarchyDraft>,
) -> ApiResult<(StatusCode, Json<ApprovalHierarchy>)> {
    let correlation_id = correlation_id(&headers);
    state
        .workflow
        .create_hierarchy(draft, &correlation_id)
        .await
        .map(|hierarchy| (StatusCode::CREATED, Json(hierarchy)))
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn get_hierarchy(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ApprovalHierarchy>> {
    let correlation_id = correlation_id(&headers);
    state
        .workflow
        .get_hierarchy(&HierarchyId(id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn update_hierarchy(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<HierarchyPatch>,
) -> ApiResult<Json<ApprovalHierarchy>> {
    let correlation_id = correlation_id(&headers);
    state
        .workflow
        .update_hierarchy(&HierarchyId(id), patch, &correlation_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn delete_hierarchy(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let correlation_id = correlation_id(&headers);
    state
        .workflow
        .delete_hierarchy(&HierarchyId(id), &correlation_id)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn preview_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(input): Json<SubmissionInput>,
) -> ApiResult<Json<ApprovalPlan>> {
    let correlation_id = correlation_id(&headers);
    state
        .workflow
        .preview(input)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn submit_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(input): Json<SubmissionInput>,
) -> ApiResult<(StatusCode, Json<ApprovalRequest>)> {
    let correlation_id = correlation_id(&headers);
    state
        .workflow
        .submit(input, &correlation_id)
        .await
        .map(|request| (StatusCode::CREATED, Json(request)))
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn list_requests(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<RequestListQuery>,
) -> ApiResult<Json<Vec<ApprovalRequest>>> {
    let correlation_id = correlation_id(&headers);
    let filter = request_filter(query)
        .map_err(|errors| ApiError::from_workflow(errors.into(), &correlation_id))?;
    state
        .workflow
        .list_requests(&filter)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn get_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ApprovalRequest>> {
    let correlation_id = correlation_id(&headers);
    state
        .workflow
        .get_request(&ApprovalRequestId(id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn list_transitions(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<RequestTransition>>> {
    let correlation_id = correlation_id(&headers);
    state
        .workflow
        .list_transitions(&ApprovalRequestId(id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn decide(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(input): Json<DecisionInput>,
) -> ApiResult<Json<ApprovalRequest>> {
    let correlation_id = correlation_id(&headers);
    state
        .workflow
        .decide(&ApprovalRequestId(id), input, &correlation_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

pub async fn check_timeout(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ApprovalRequest>> {
    let correlation_id = correlation_id(&headers);
    state
        .workflow
        .check_timeout(&ApprovalRequestId(id), Utc::now(), &correlation_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_workflow(error, &correlation_id))
}

fn request_filter(query: RequestListQuery) -> Result<RequestFilter, ValidationErrors> {
    let mut errors = ValidationErrors::default();
    let status = match non_blank(query.status) {
        None => None,
        Some(raw) => {
            let parsed = RequestStatus::parse(&raw);
            if parsed.is_none() {
                errors.push("status", format!("`{raw}` is not a request status"));
            }
            parsed
        }
    };
    errors.into_result(RequestFilter {
        status,
        hierarchy_id: non_blank(query.hierarchy_id).map(HierarchyId),
        approver_id: non_blank(query.approver_id).map(UserId),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}
