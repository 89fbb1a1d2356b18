use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::hierarchy::{ApproverType, EntityType, HierarchyId};
use crate::domain::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalRequestId(pub String);

impl std::fmt::Display for ApprovalRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestTransitionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Expired)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Approve,
    Reject,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Reject => "REJECT",
        }
    }
}

/// What happens to a request when an approver rejects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionPolicy {
    /// Any rejection at the current level rejects the whole request.
    #[default]
    Veto,
    /// Rejections count against the level; it fails once the remaining
    /// undecided approvers can no longer reach the required approvals.
    Quorum,
}

impl RejectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Veto => "VETO",
            Self::Quorum => "QUORUM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "VETO" => Some(Self::Veto),
            "QUORUM" => Some(Self::Quorum),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LevelOutcome {
    Pending,
    AutoApproved,
    Approved,
    Rejected,
    Expired,
}

/// The submitted business object a request is about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub amount: Decimal,
    pub requester_id: UserId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub approver_id: UserId,
    pub decision: DecisionKind,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
    pub automatic: bool,
}

/// A level as pinned at submission, plus the decisions collected on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelProgress {
    pub level_number: u32,
    pub level_name: String,
    pub approver_type: ApproverType,
    pub eligible_approvers: BTreeSet<UserId>,
    pub required_approvals: u32,
    pub requires_all: bool,
    pub timeout_hours: Option<u32>,
    pub outcome: LevelOutcome,
    pub decisions: Vec<Decision>,
}

impl LevelProgress {
    pub fn is_eligible(&self, user_id: &UserId) -> bool {
        self.eligible_approvers.contains(user_id)
    }

    pub fn approvals(&self) -> usize {
        self.count(DecisionKind::Approve)
    }

    pub fn rejections(&self) -> usize {
        self.count(DecisionKind::Reject)
    }

    pub fn is_satisfied(&self) -> bool {
        if self.requires_all {
            return !self.eligible_approvers.is_empty()
                && self.eligible_approvers.iter().all(|user_id| self.approved_by(user_id));
        }
        self.approvals() >= self.required_approvals as usize
    }

    /// True once outstanding approvers cannot lift the level to its quorum.
    pub fn cannot_be_satisfied(&self) -> bool {
        let undecided = self
            .eligible_approvers
            .iter()
            .filter(|user_id| !self.decisions.iter().any(|d| &d.approver_id == *user_id))
            .count();
        let needed = if self.requires_all {
            self.eligible_approvers.len()
        } else {
            self.required_approvals as usize
        };
        self.approvals() + undecided < needed
    }

    pub fn pending_approvers(&self) -> Vec<UserId> {
        self.eligible_approvers
            .iter()
            .filter(|user_id| !self.decisions.iter().any(|d| &d.approver_id == *user_id))
            .cloned()
            .collect()
    }

    /// Replaces an earlier decision by the same approver instead of adding a second one.
    pub fn upsert_decision(&mut self, decision: Decision) {
        match self.decisions.iter_mut().find(|existing| existing.approver_id == decision.approver_id)
        {
            Some(existing) => *existing = decision,
            None => self.decisions.push(decision),
        }
    }

    fn approved_by(&self, user_id: &UserId) -> bool {
        self.decisions
            .iter()
            .any(|d| &d.approver_id == user_id && d.decision == DecisionKind::Approve)
    }

    fn count(&self, kind: DecisionKind) -> usize {
        self.decisions.iter().filter(|d| d.decision == kind).count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: ApprovalRequestId,
    pub hierarchy_id: HierarchyId,
    pub hierarchy_version: u32,
    pub entity: EntityRef,
    pub status: RequestStatus,
    pub current_level: Option<u32>,
    pub level_entered_at: Option<DateTime<Utc>>,
    pub levels: Vec<LevelProgress>,
    pub rejection_policy: RejectionPolicy,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current_level(&self) -> Option<&LevelProgress> {
        let number = self.current_level?;
        self.levels.iter().find(|level| level.level_number == number)
    }

    pub fn current_level_mut(&mut self) -> Option<&mut LevelProgress> {
        let number = self.current_level?;
        self.levels.iter_mut().find(|level| level.level_number == number)
    }

    pub fn awaiting_approvers_at(&self, level_number: u32) -> Vec<UserId> {
        self.levels
            .iter()
            .find(|level| level.level_number == level_number)
            .map(LevelProgress::pending_approvers)
            .unwrap_or_default()
    }

    /// Approvers who still owe a decision at the current level.
    pub fn awaiting_approvers(&self) -> Vec<UserId> {
        match (self.status, self.current_level()) {
            (RequestStatus::InProgress, Some(level)) => level.pending_approvers(),
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Submitted,
    LevelAutoApproved,
    LevelEntered,
    DecisionRecorded,
    LevelApproved,
    LevelRejected,
    RequestApproved,
    TimedOut,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::LevelAutoApproved => "level_auto_approved",
            Self::LevelEntered => "level_entered",
            Self::DecisionRecorded => "decision_recorded",
            Self::LevelApproved => "level_approved",
            Self::LevelRejected => "level_rejected",
            Self::RequestApproved => "request_approved",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "submitted" => Some(Self::Submitted),
            "level_auto_approved" => Some(Self::LevelAutoApproved),
            "level_entered" => Some(Self::LevelEntered),
            "decision_recorded" => Some(Self::DecisionRecorded),
            "level_approved" => Some(Self::LevelApproved),
            "level_rejected" => Some(Self::LevelRejected),
            "request_approved" => Some(Self::RequestApproved),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

/// Append-only record of one step in a request's life.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTransition {
    pub id: RequestTransitionId,
    pub request_id: ApprovalRequestId,
    pub from_status: Option<RequestStatus>,
    pub to_status: RequestStatus,
    pub level_number: Option<u32>,
    pub reason: TransitionReason,
    pub actor_id: String,
    pub context_json: String,
    pub state_version: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub hierarchy_id: Option<HierarchyId>,
    pub approver_id: Option<UserId>,
}

impl RequestFilter {
    pub fn matches(&self, request: &ApprovalRequest) -> bool {
        if self.status.is_some_and(|status| status != request.status) {
            return false;
        }
        if self.hierarchy_id.as_ref().is_some_and(|id| id != &request.hierarchy_id) {
            return false;
        }
        match &self.approver_id {
            Some(approver_id) => request.awaiting_approvers().contains(approver_id),
            None => true,
        }
    }
}
