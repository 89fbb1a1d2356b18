use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::hierarchy::HierarchyId;
use crate::domain::request::{
    ApprovalRequest, ApprovalRequestId, RequestStatus, RequestTransition, TransitionReason,
};
use crate::domain::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    LevelAdvanced,
    RequestApproved,
    RequestRejected,
    RequestExpired,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LevelAdvanced => "level_advanced",
            Self::RequestApproved => "request_approved",
            Self::RequestRejected => "request_rejected",
            Self::RequestExpired => "request_expired",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalNotification {
    pub notification_id: String,
    pub kind: NotificationKind,
    pub request_id: ApprovalRequestId,
    pub hierarchy_id: HierarchyId,
    pub entity_id: String,
    pub level_number: Option<u32>,
    pub status: RequestStatus,
    pub recipients: Vec<UserId>,
    pub correlation_id: String,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl ApprovalNotification {
    /// Builds the notification a transition warrants, if any.
    ///
    /// Entering a level notifies its pending approvers; a terminal disposition
    /// notifies the requester.
    pub fn from_transition(
        request: &ApprovalRequest,
        transition: &RequestTransition,
        correlation_id: impl Into<String>,
    ) -> Option<Self> {
        let (kind, recipients) = match transition.reason {
            TransitionReason::LevelEntered => (
                NotificationKind::LevelAdvanced,
                request.awaiting_approvers_at(transition.level_number?),
            ),
            TransitionReason::RequestApproved => {
                (NotificationKind::RequestApproved, vec![request.entity.requester_id.clone()])
            }
            TransitionReason::LevelRejected => {
                (NotificationKind::RequestRejected, vec![request.entity.requester_id.clone()])
            }
            TransitionReason::TimedOut => {
                (NotificationKind::RequestExpired, vec![request.entity.requester_id.clone()])
            }
            TransitionReason::Submitted
            | TransitionReason::LevelAutoApproved
            | TransitionReason::DecisionRecorded
            | TransitionReason::LevelApproved => return None,
        };

        Some(Self {
            notification_id: Uuid::new_v4().to_string(),
            kind,
            request_id: request.id.clone(),
            hierarchy_id: request.hierarchy_id.clone(),
            entity_id: request.entity.entity_id.clone(),
            level_number: transition.level_number,
            status: transition.to_status,
            recipients,
            correlation_id: correlation_id.into(),
            metadata: BTreeMap::new(),
            occurred_at: transition.occurred_at,
        }
        .with_metadata("entity_type", request.entity.entity_type.as_str())
        .with_metadata("actor_id", transition.actor_id.clone()))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Receives level advancement and terminal disposition events.
///
/// Delivery is fire-and-forget: implementations must not block and any
/// failure stays inside the notifier.
pub trait ApprovalNotifier: Send + Sync {
    fn notify(&self, notification: ApprovalNotification);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl ApprovalNotifier for NoopNotifier {
    fn notify(&self, _notification: ApprovalNotification) {}
}

#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    notifications: Arc<Mutex<Vec<ApprovalNotification>>>,
}

impl InMemoryNotifier {
    pub fn notifications(&self) -> Vec<ApprovalNotification> {
        match self.notifications.lock() {
            Ok(notifications) => notifications.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ApprovalNotifier for InMemoryNotifier {
    fn notify(&self, notification: ApprovalNotification) {
        match self.notifications.lock() {
            Ok(mut notifications) => notifications.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
    }
}
