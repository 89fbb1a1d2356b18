//! Request progression state machine.
//!
//! Every change to an [`ApprovalRequest`] goes through [`ProgressionEngine`],
//! which validates the move, bumps `state_version`, and emits one
//! [`RequestTransition`] per step so the request's history can be replayed.
//! The engine is pure: callers load, hand the request in, and persist what
//! comes back.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::approvals::evaluator::{ApprovalPlan, LevelDisposition, PlannedLevel};
use crate::domain::request::{
    ApprovalRequest, ApprovalRequestId, Decision, DecisionKind, LevelOutcome, LevelProgress,
    RejectionPolicy, RequestStatus, RequestTransition, RequestTransitionId, TransitionReason,
};
use crate::domain::UserId;
use crate::errors::WorkflowError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressionConfig {
    /// Policy pinned onto newly submitted requests.
    pub rejection_policy: RejectionPolicy,
    /// Actor recorded on automatic decisions and timeouts.
    pub system_actor: String,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self { rejection_policy: RejectionPolicy::Veto, system_actor: "system".to_string() }
    }
}

/// A request after one engine call, with the transitions that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressionResult {
    pub request: ApprovalRequest,
    pub transitions: Vec<RequestTransition>,
}

impl ProgressionResult {
    pub fn changed(&self) -> bool {
        !self.transitions.is_empty()
    }

    fn unchanged(request: ApprovalRequest) -> Self {
        Self { request, transitions: Vec::new() }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProgressionEngine {
    config: ProgressionConfig,
}

impl ProgressionEngine {
    pub fn new() -> Self {
        Self::with_config(ProgressionConfig::default())
    }

    pub fn with_config(config: ProgressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProgressionConfig {
        &self.config
    }

    /// Creates a request from an evaluated plan.
    ///
    /// Auto-approved levels receive a synthetic approval and are passed over.
    /// The request lands in `APPROVED` when nothing needs a human, otherwise
    /// in `IN_PROGRESS` at the first level awaiting a decision.
    pub fn submit(
        &self,
        id: ApprovalRequestId,
        plan: ApprovalPlan,
        now: DateTime<Utc>,
    ) -> ProgressionResult {
        let actor = plan.entity.requester_id.0.clone();
        let levels: Vec<LevelProgress> =
            plan.levels.iter().map(|level| self.snapshot_level(level, now)).collect();

        let mut request = ApprovalRequest {
            id,
            hierarchy_id: plan.hierarchy_id.clone(),
            hierarchy_version: plan.hierarchy_version,
            entity: plan.entity.clone(),
            status: RequestStatus::Pending,
            current_level: None,
            level_entered_at: None,
            levels,
            rejection_policy: self.config.rejection_policy,
            state_version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let mut transitions = vec![step(
            &mut request,
            RequestStatus::Pending,
            None,
            TransitionReason::Submitted,
            &actor,
            json!({
                "hierarchy_id": plan.hierarchy_id,
                "hierarchy_version": plan.hierarchy_version,
                "entity_type": plan.entity.entity_type.as_str(),
                "entity_id": plan.entity.entity_id,
                "amount": plan.entity.amount.to_string(),
                "rejection_policy": self.config.rejection_policy.as_str(),
            }),
            now,
        )];

        for level in plan.levels.iter().filter(|level| level.is_auto_approved()) {
            transitions.push(step(
                &mut request,
                RequestStatus::Pending,
                Some(level.level_number),
                TransitionReason::LevelAutoApproved,
                &self.config.system_actor,
                json!({ "level_name": level.level_name, "amount": plan.entity.amount.to_string() }),
                now,
            ));
        }

        match plan.first_pending_level().map(|level| level.level_number) {
            Some(level_number) => {
                transitions.push(self.enter_level(&mut request, level_number, &actor, now));
            }
            None => {
                transitions.push(self.finish_approved(&mut request, &self.config.system_actor, now));
            }
        }

        ProgressionResult { request, transitions }
    }

    /// Applies one approver's decision to the current level.
    ///
    /// A second decision from the same approver replaces the first.
    pub fn record_decision(
        &self,
        mut request: ApprovalRequest,
        approver_id: &UserId,
        decision: DecisionKind,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ProgressionResult, WorkflowError> {
        ensure_in_progress(&request)?;
        let policy = request.rejection_policy;
        let level_number = request.current_level.unwrap_or_default();

        let missing_level =
            WorkflowError::InvalidState { request_id: request.id.to_string(), status: request.status };
        let level = request.current_level_mut().ok_or(missing_level)?;
        if !level.is_eligible(approver_id) {
            return Err(WorkflowError::Unauthorized {
                approver_id: approver_id.0.clone(),
                level_number,
            });
        }

        level.upsert_decision(Decision {
            approver_id: approver_id.clone(),
            decision,
            comment: comment.clone(),
            decided_at: now,
            automatic: false,
        });
        let approvals = level.approvals();
        let rejections = level.rejections();
        let rejected = match policy {
            RejectionPolicy::Veto => rejections > 0,
            RejectionPolicy::Quorum => level.cannot_be_satisfied(),
        };
        let satisfied = !rejected && level.is_satisfied();
        if rejected {
            level.outcome = LevelOutcome::Rejected;
        } else if satisfied {
            level.outcome = LevelOutcome::Approved;
        }

        let actor = approver_id.0.clone();
        let mut transitions = vec![step(
            &mut request,
            RequestStatus::InProgress,
            Some(level_number),
            TransitionReason::DecisionRecorded,
            &actor,
            json!({
                "decision": decision.as_str(),
                "comment": comment,
                "approvals": approvals,
                "rejections": rejections,
            }),
            now,
        )];

        if rejected {
            transitions.push(step(
                &mut request,
                RequestStatus::Rejected,
                Some(level_number),
                TransitionReason::LevelRejected,
                &actor,
                json!({ "rejection_policy": policy.as_str(), "rejections": rejections }),
                now,
            ));
            request.current_level = None;
            request.completed_at = Some(now);
        } else if satisfied {
            transitions.push(step(
                &mut request,
                RequestStatus::InProgress,
                Some(level_number),
                TransitionReason::LevelApproved,
                &actor,
                json!({ "approvals": approvals }),
                now,
            ));
            match next_pending_level(&request, level_number) {
                Some(next) => transitions.push(self.enter_level(&mut request, next, &actor, now)),
                None => transitions.push(self.finish_approved(&mut request, &actor, now)),
            }
        }

        Ok(ProgressionResult { request, transitions })
    }

    /// Expires the request once its current level has waited strictly longer
    /// than the level's timeout. Otherwise returns the request untouched.
    pub fn check_timeout(
        &self,
        mut request: ApprovalRequest,
        now: DateTime<Utc>,
    ) -> Result<ProgressionResult, WorkflowError> {
        if request.is_terminal() {
            return Err(WorkflowError::InvalidState {
                request_id: request.id.to_string(),
                status: request.status,
            });
        }
        let Some(deadline) = deadline(&request) else {
            return Ok(ProgressionResult::unchanged(request));
        };
        if now <= deadline {
            return Ok(ProgressionResult::unchanged(request));
        }

        let level_number = request.current_level;
        let entered_at = request.level_entered_at;
        if let Some(level) = request.current_level_mut() {
            level.outcome = LevelOutcome::Expired;
        }
        let actor = self.config.system_actor.clone();
        let transition = step(
            &mut request,
            RequestStatus::Expired,
            level_number,
            TransitionReason::TimedOut,
            &actor,
            json!({
                "level_entered_at": entered_at.map(|at| at.to_rfc3339()),
                "deadline": deadline.to_rfc3339(),
                "checked_at": now.to_rfc3339(),
            }),
            now,
        );
        request.current_level = None;
        request.completed_at = Some(now);

        Ok(ProgressionResult { request, transitions: vec![transition] })
    }

    fn snapshot_level(&self, level: &PlannedLevel, now: DateTime<Utc>) -> LevelProgress {
        let (eligible_approvers, required_approvals, outcome, decisions) = match &level.disposition
        {
            LevelDisposition::AutoApproved => (
                Default::default(),
                0,
                LevelOutcome::AutoApproved,
                vec![Decision {
                    approver_id: UserId::new(self.config.system_actor.as_str()),
                    decision: DecisionKind::Approve,
                    comment: Some("amount within auto-approve threshold".to_string()),
                    decided_at: now,
                    automatic: true,
                }],
            ),
            LevelDisposition::AwaitingDecision { eligible_approvers, required_approvals } => {
                (eligible_approvers.clone(), *required_approvals, LevelOutcome::Pending, Vec::new())
            }
        };
        LevelProgress {
            level_number: level.level_number,
            level_name: level.level_name.clone(),
            approver_type: level.approver_type,
            eligible_approvers,
            required_approvals,
            requires_all: level.requires_all,
            timeout_hours: level.timeout_hours,
            outcome,
            decisions,
        }
    }

    fn enter_level(
        &self,
        request: &mut ApprovalRequest,
        level_number: u32,
        actor: &str,
        now: DateTime<Utc>,
    ) -> RequestTransition {
        request.current_level = Some(level_number);
        request.level_entered_at = Some(now);
        let awaiting = request.awaiting_approvers_at(level_number);
        step(
            request,
            RequestStatus::InProgress,
            Some(level_number),
            TransitionReason::LevelEntered,
            actor,
            json!({ "awaiting_approvers": awaiting }),
            now,
        )
    }

    fn finish_approved(
        &self,
        request: &mut ApprovalRequest,
        actor: &str,
        now: DateTime<Utc>,
    ) -> RequestTransition {
        request.current_level = None;
        request.completed_at = Some(now);
        let decided_levels = request.levels.len();
        step(
            request,
            RequestStatus::Approved,
            None,
            TransitionReason::RequestApproved,
            actor,
            json!({ "levels": decided_levels }),
            now,
        )
    }
}

/// The moment the current level times out, if it has a timeout.
///
/// A timeout too large to land on the calendar is treated as no timeout.
pub fn deadline(request: &ApprovalRequest) -> Option<DateTime<Utc>> {
    let hours = request.current_level()?.timeout_hours?;
    let entered_at = request.level_entered_at?;
    entered_at.checked_add_signed(Duration::try_hours(i64::from(hours))?)
}

pub fn is_overdue(request: &ApprovalRequest, now: DateTime<Utc>) -> bool {
    request.status == RequestStatus::InProgress && deadline(request).is_some_and(|at| now > at)
}

fn ensure_in_progress(request: &ApprovalRequest) -> Result<(), WorkflowError> {
    if request.status == RequestStatus::InProgress {
        Ok(())
    } else {
        Err(WorkflowError::InvalidState {
            request_id: request.id.to_string(),
            status: request.status,
        })
    }
}

fn next_pending_level(request: &ApprovalRequest, after: u32) -> Option<u32> {
    request
        .levels
        .iter()
        .filter(|level| level.level_number > after && level.outcome == LevelOutcome::Pending)
        .map(|level| level.level_number)
        .min()
}

fn step(
    request: &mut ApprovalRequest,
    to_status: RequestStatus,
    level_number: Option<u32>,
    reason: TransitionReason,
    actor_id: &str,
    context: serde_json::Value,
    now: DateTime<Utc>,
) -> RequestTransition {
    let from_status = match reason {
        TransitionReason::Submitted => None,
        _ => Some(request.status),
    };
    request.status = to_status;
    request.state_version += 1;
    request.updated_at = now;

    RequestTransition {
        id: RequestTransitionId(Uuid::new_v4().to_string()),
        request_id: request.id.clone(),
        from_status,
        to_status,
        level_number,
        reason,
        actor_id: actor_id.to_string(),
        context_json: context.to_string(),
        state_version: request.state_version,
        occurred_at: now,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{deadline, is_overdue, ProgressionConfig, ProgressionEngine};
    use crate::approvals::evaluator::{ApprovalPlan, LevelDisposition, PlannedLevel};
    use crate::domain::hierarchy::{ApproverType, EntityType, HierarchyId};
    use crate::domain::request::{
        ApprovalRequestId, DecisionKind, EntityRef, LevelOutcome, RejectionPolicy, RequestStatus,
        TransitionReason,
    };
    use crate::domain::UserId;
    use crate::errors::WorkflowError;

    fn awaiting(number: u32, name: &str, approvers: &[&str], required: u32) -> PlannedLevel {
        PlannedLevel {
            level_number: number,
            level_name: name.to_string(),
            approver_type: ApproverType::RoleBased,
            requires_all: false,
            timeout_hours: None,
            disposition: LevelDisposition::AwaitingDecision {
                eligible_approvers: approvers.iter().map(|id| UserId::new(*id)).collect::<BTreeSet<_>>(),
                required_approvals: required,
            },
        }
    }

    fn auto(number: u32, name: &str) -> PlannedLevel {
        PlannedLevel {
            level_number: number,
            level_name: name.to_string(),
            approver_type: ApproverType::CenterDirector,
            requires_all: false,
            timeout_hours: None,
            disposition: LevelDisposition::AutoApproved,
        }
    }

    fn plan(levels: Vec<PlannedLevel>) -> ApprovalPlan {
        ApprovalPlan {
            hierarchy_id: HierarchyId("H-PO".to_string()),
            hierarchy_version: 1,
            hierarchy_name: "Standard PO Approval".to_string(),
            entity: EntityRef {
                entity_type: EntityType::PurchaseOrder,
                entity_id: "PO-100".to_string(),
                amount: Decimal::new(5_000, 0),
                requester_id: UserId::new("u-req"),
            },
            levels,
        }
    }

    fn submitted_at() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid timestamp")
    }

    fn reasons(transitions: &[crate::domain::request::RequestTransition]) -> Vec<TransitionReason> {
        transitions.iter().map(|transition| transition.reason).collect()
    }

    #[test]
    fn auto_approved_first_level_advances_straight_to_the_next() {
        let engine = ProgressionEngine::new();
        let result = engine.submit(
            ApprovalRequestId("APR-1".to_string()),
            plan(vec![auto(1, "Center Director"), awaiting(2, "Finance", &["u-fin"], 1)]),
            submitted_at(),
        );

        assert_eq!(result.request.status, RequestStatus::InProgress);
        assert_eq!(result.request.current_level, Some(2));
        assert_eq!(result.request.levels[0].outcome, LevelOutcome::AutoApproved);
        assert!(result.request.levels[0].decisions[0].automatic);
        assert_eq!(
            reasons(&result.transitions),
            vec![
                TransitionReason::Submitted,
                TransitionReason::LevelAutoApproved,
                TransitionReason::LevelEntered
            ]
        );
        assert_eq!(result.request.state_version, 3);

        let approved = engine
            .record_decision(
                result.request,
                &UserId::new("u-fin"),
                DecisionKind::Approve,
                None,
                submitted_at() + Duration::hours(1),
            )
            .expect("finance approves");
        assert_eq!(approved.request.status, RequestStatus::Approved);
        assert!(approved.request.completed_at.is_some());
        assert_eq!(approved.transitions.last().map(|t| t.reason), Some(TransitionReason::RequestApproved));
    }

    #[test]
    fn all_levels_auto_approved_completes_on_submit() {
        let result = ProgressionEngine::new().submit(
            ApprovalRequestId("APR-2".to_string()),
            plan(vec![auto(1, "Director"), auto(2, "Finance")]),
            submitted_at(),
        );

        assert_eq!(result.request.status, RequestStatus::Approved);
        assert_eq!(result.request.current_level, None);
        assert_eq!(result.transitions.first().and_then(|t| t.from_status), None);
    }

    #[test]
    fn veto_rejection_ends_the_request_before_later_levels() {
        let engine = ProgressionEngine::new();
        let submitted = engine.submit(
            ApprovalRequestId("APR-3".to_string()),
            plan(vec![awaiting(1, "Director", &["u-dir"], 1), awaiting(2, "Finance", &["u-fin"], 1)]),
            submitted_at(),
        );

        let result = engine
            .record_decision(
                submitted.request,
                &UserId::new("u-dir"),
                DecisionKind::Reject,
                Some("over budget".to_string()),
                submitted_at(),
            )
            .expect("reject");

        assert_eq!(result.request.status, RequestStatus::Rejected);
        assert_eq!(result.request.levels[0].outcome, LevelOutcome::Rejected);
        assert_eq!(result.request.levels[1].outcome, LevelOutcome::Pending);
        assert!(result.request.levels[1].decisions.is_empty());
    }

    #[test]
    fn quorum_policy_tolerates_rejections_until_quorum_is_unreachable() {
        let engine = ProgressionEngine::with_config(ProgressionConfig {
            rejection_policy: RejectionPolicy::Quorum,
            ..ProgressionConfig::default()
        });
        let submitted = engine.submit(
            ApprovalRequestId("APR-4".to_string()),
            plan(vec![awaiting(1, "Panel", &["u-1", "u-2", "u-3"], 2)]),
            submitted_at(),
        );
        assert_eq!(submitted.request.rejection_policy, RejectionPolicy::Quorum);

        let after_one = engine
            .record_decision(submitted.request, &UserId::new("u-1"), DecisionKind::Reject, None, submitted_at())
            .expect("first rejection");
        assert_eq!(after_one.request.status, RequestStatus::InProgress);

        let after_two = engine
            .record_decision(after_one.request, &UserId::new("u-2"), DecisionKind::Reject, None, submitted_at())
            .expect("second rejection");
        assert_eq!(after_two.request.status, RequestStatus::Rejected);
    }

    #[test]
    fn ineligible_approver_is_refused() {
        let engine = ProgressionEngine::new();
        let submitted = engine.submit(
            ApprovalRequestId("APR-5".to_string()),
            plan(vec![awaiting(1, "Finance", &["u-fin"], 1)]),
            submitted_at(),
        );

        let error = engine
            .record_decision(
                submitted.request.clone(),
                &UserId::new("u-intruder"),
                DecisionKind::Approve,
                None,
                submitted_at(),
            )
            .expect_err("not eligible");

        assert_eq!(
            error,
            WorkflowError::Unauthorized { approver_id: "u-intruder".to_string(), level_number: 1 }
        );
    }

    #[test]
    fn terminal_request_rejects_further_decisions() {
        let engine = ProgressionEngine::new();
        let approved = engine.submit(
            ApprovalRequestId("APR-6".to_string()),
            plan(vec![auto(1, "Director")]),
            submitted_at(),
        );

        let error = engine
            .record_decision(approved.request, &UserId::new("u-fin"), DecisionKind::Approve, None, submitted_at())
            .expect_err("terminal");

        assert!(matches!(error, WorkflowError::InvalidState { status: RequestStatus::Approved, .. }));
    }

    #[test]
    fn timeout_expires_only_after_the_deadline_passes() {
        let engine = ProgressionEngine::new();
        let mut level = awaiting(1, "Finance", &["u-fin"], 1);
        level.timeout_hours = Some(24);
        let submitted = engine.submit(ApprovalRequestId("APR-7".to_string()), plan(vec![level]), submitted_at());
        let due = deadline(&submitted.request).expect("deadline");
        assert_eq!(due, submitted_at() + Duration::hours(24));

        let on_time = engine.check_timeout(submitted.request, due).expect("check");
        assert!(!on_time.changed());
        assert_eq!(on_time.request.status, RequestStatus::InProgress);
        assert!(!is_overdue(&on_time.request, due));

        let late = due + Duration::seconds(1);
        assert!(is_overdue(&on_time.request, late));
        let expired = engine.check_timeout(on_time.request, late).expect("check");
        assert_eq!(expired.request.status, RequestStatus::Expired);
        assert_eq!(expired.request.levels[0].outcome, LevelOutcome::Expired);

        let error = engine.check_timeout(expired.request, late).expect_err("already expired");
        assert!(matches!(error, WorkflowError::InvalidState { .. }));
    }

    #[test]
    fn unrepresentable_timeout_never_expires() {
        let engine = ProgressionEngine::new();
        let mut level = awaiting(1, "Finance", &["u-fin"], 1);
        level.timeout_hours = Some(u32::MAX);
        let submitted = engine.submit(ApprovalRequestId("APR-9".to_string()), plan(vec![level]), submitted_at());
        let far_future = Utc.with_ymd_and_hms(9999, 1, 1, 0, 0, 0).single().expect("valid timestamp");

        assert_eq!(deadline(&submitted.request), None);
        assert!(!is_overdue(&submitted.request, far_future));
        let checked = engine.check_timeout(submitted.request, far_future).expect("check");
        assert!(!checked.changed());
        assert_eq!(checked.request.status, RequestStatus::InProgress);
    }

    #[test]
    fn state_version_matches_the_last_transition() {
        let engine = ProgressionEngine::new();
        let submitted = engine.submit(
            ApprovalRequestId("APR-8".to_string()),
            plan(vec![awaiting(1, "Finance", &["u-a", "u-b"], 2)]),
            submitted_at(),
        );
        let decided = engine
            .record_decision(submitted.request, &UserId::new("u-a"), DecisionKind::Approve, None, submitted_at())
            .expect("approve");

        assert_eq!(decided.request.status, RequestStatus::InProgress);
        assert_eq!(
            decided.transitions.last().map(|t| t.state_version),
            Some(decided.request.state_version)
        );
    }
}
