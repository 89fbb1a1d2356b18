//! Approval workflow service.
//!
//! Ties the hierarchy store, the level evaluator and the progression engine
//! to the repositories. Every request mutation runs under a per-request lock
//! and is saved with an expected `state_version`, so two decisions racing on
//! the same request never both land.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use tollgate_core::approvals::{
    apply_patch, build_hierarchy, ApprovalPlan, ApproverDirectory, HierarchyDraft, HierarchyPatch,
    LevelEvaluator,
};
use tollgate_core::config::WorkflowConfig;
use tollgate_core::domain::hierarchy::{
    ApprovalHierarchy, EntityType, HierarchyFilter, HierarchyId, HierarchySummary,
};
use tollgate_core::domain::request::{
    ApprovalRequest, ApprovalRequestId, DecisionKind, EntityRef, RequestFilter,
    RequestTransition,
};
use tollgate_core::domain::UserId;
use tollgate_core::errors::{ValidationErrors, WorkflowError};
use tollgate_core::notify::{ApprovalNotification, ApprovalNotifier};
use tollgate_core::progression::{is_overdue, ProgressionConfig, ProgressionEngine, ProgressionResult};

use crate::repositories::{
    ApprovalRequestRepository, HierarchyRepository, SqlApprovalRequestRepository,
    SqlApproverDirectory, SqlHierarchyRepository,
};
use crate::DbPool;

const DEFAULT_SWEEP_BATCH_SIZE: u32 = 500;

/// A business object handed in for approval.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubmissionInput {
    /// Explicit hierarchy; the entity type's active default when absent.
    pub hierarchy_id: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub amount: Decimal,
    pub requester_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionInput {
    pub approver_id: String,
    pub decision: DecisionKind,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: u32,
    pub expired: u32,
    pub failed: u32,
    pub failed_request_ids: Vec<ApprovalRequestId>,
}

type RequestLocks = Arc<StdMutex<HashMap<String, LockSlot>>>;

struct LockSlot {
    lock: Arc<Mutex<()>>,
    holders: usize,
}

/// A claim on one request's lock. The map entry goes away when the last
/// claim drops, including claims dropped by a cancelled future.
struct RequestLock {
    locks: RequestLocks,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl RequestLock {
    fn register(locks: &RequestLocks, key: &str) -> Self {
        let mut map = locks.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = map
            .entry(key.to_string())
            .or_insert_with(|| LockSlot { lock: Arc::new(Mutex::new(())), holders: 0 });
        slot.holders += 1;
        Self { locks: Arc::clone(locks), key: key.to_string(), lock: Arc::clone(&slot.lock) }
    }

    async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for RequestLock {
    fn drop(&mut self) {
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = map.get_mut(&self.key) {
            slot.holders = slot.holders.saturating_sub(1);
            if slot.holders == 0 {
                map.remove(&self.key);
            }
        }
    }
}

pub struct ApprovalWorkflow {
    hierarchies: Arc<dyn HierarchyRepository>,
    requests: Arc<dyn ApprovalRequestRepository>,
    evaluator: LevelEvaluator<Arc<dyn ApproverDirectory>>,
    engine: ProgressionEngine,
    notifier: Arc<dyn ApprovalNotifier>,
    sweep_batch_size: u32,
    request_locks: RequestLocks,
}

impl ApprovalWorkflow {
    pub fn new(
        hierarchies: Arc<dyn HierarchyRepository>,
        requests: Arc<dyn ApprovalRequestRepository>,
        directory: Arc<dyn ApproverDirectory>,
        notifier: Arc<dyn ApprovalNotifier>,
    ) -> Self {
        Self {
            hierarchies,
            requests,
            evaluator: LevelEvaluator::new(directory),
            engine: ProgressionEngine::new(),
            notifier,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            request_locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// SQL repositories and directory over one pool.
    pub fn from_pool(
        pool: DbPool,
        config: &WorkflowConfig,
        notifier: Arc<dyn ApprovalNotifier>,
    ) -> Self {
        Self::new(
            Arc::new(SqlHierarchyRepository::new(pool.clone())),
            Arc::new(SqlApprovalRequestRepository::new(pool.clone())),
            Arc::new(SqlApproverDirectory::new(pool)),
            notifier,
        )
        .with_progression(config.progression())
        .with_sweep_batch_size(config.sweep_batch_size)
    }

    pub fn with_progression(mut self, config: ProgressionConfig) -> Self {
        self.engine = ProgressionEngine::with_config(config);
        self
    }

    pub fn with_sweep_batch_size(mut self, batch_size: u32) -> Self {
        self.sweep_batch_size = batch_size.max(1);
        self
    }

    pub async fn create_hierarchy(
        &self,
        draft: HierarchyDraft,
        correlation_id: &str,
    ) -> Result<ApprovalHierarchy, WorkflowError> {
        let id = HierarchyId(Uuid::new_v4().to_string());
        let hierarchy = build_hierarchy(id, draft, Utc::now())?;
        self.hierarchies.insert(hierarchy.clone()).await?;

        info!(
            event_name = "approval.hierarchy.created",
            correlation_id = %correlation_id,
            hierarchy_id = %hierarchy.id,
            entity_type = hierarchy.entity_type.as_str(),
            is_default = hierarchy.is_default,
            levels = hierarchy.levels.len(),
            "approval hierarchy created"
        );
        Ok(hierarchy)
    }

    pub async fn update_hierarchy(
        &self,
        id: &HierarchyId,
        patch: HierarchyPatch,
        correlation_id: &str,
    ) -> Result<ApprovalHierarchy, WorkflowError> {
        let current = self.get_hierarchy(id).await?;
        let updated = apply_patch(&current, patch, Utc::now())?;
        self.hierarchies.update(updated.clone()).await?;

        info!(
            event_name = "approval.hierarchy.updated",
            correlation_id = %correlation_id,
            hierarchy_id = %updated.id,
            version = updated.version,
            levels = updated.levels.len(),
            "approval hierarchy updated"
        );
        Ok(updated)
    }

    pub async fn delete_hierarchy(
        &self,
        id: &HierarchyId,
        correlation_id: &str,
    ) -> Result<(), WorkflowError> {
        self.hierarchies.delete(id).await?;
        info!(
            event_name = "approval.hierarchy.deleted",
            correlation_id = %correlation_id,
            hierarchy_id = %id,
            "approval hierarchy deleted"
        );
        Ok(())
    }

    pub async fn get_hierarchy(&self, id: &HierarchyId) -> Result<ApprovalHierarchy, WorkflowError> {
        self.hierarchies
            .find_by_id(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("approval hierarchy", id.0.clone()))
    }

    pub async fn list_hierarchies(
        &self,
        filter: &HierarchyFilter,
    ) -> Result<Vec<HierarchySummary>, WorkflowError> {
        Ok(self.hierarchies.list(filter).await?)
    }

    /// Evaluates the route a submission would take without creating a request.
    pub async fn preview(&self, input: SubmissionInput) -> Result<ApprovalPlan, WorkflowError> {
        let (hierarchy, entity) = self.resolve_submission(input).await?;
        self.evaluator.plan(&hierarchy, &entity).await
    }

    pub async fn submit(
        &self,
        input: SubmissionInput,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, WorkflowError> {
        let (hierarchy, entity) = self.resolve_submission(input).await?;
        let plan = self.evaluator.plan(&hierarchy, &entity).await?;

        let id = ApprovalRequestId(Uuid::new_v4().to_string());
        let ProgressionResult { request, transitions } = self.engine.submit(id, plan, Utc::now());
        self.requests.insert(request.clone(), transitions.clone()).await?;

        info!(
            event_name = "approval.request.submitted",
            correlation_id = %correlation_id,
            request_id = %request.id,
            hierarchy_id = %request.hierarchy_id,
            hierarchy_version = request.hierarchy_version,
            status = request.status.as_str(),
            current_level = ?request.current_level,
            "approval request submitted"
        );
        self.publish(&request, &transitions, correlation_id);
        Ok(request)
    }

    pub async fn decide(
        &self,
        request_id: &ApprovalRequestId,
        input: DecisionInput,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, WorkflowError> {
        let approver_id = UserId::new(input.approver_id.trim());
        if approver_id.as_str().is_empty() {
            return Err(WorkflowError::validation("approverId", "is required"));
        }

        let lock = RequestLock::register(&self.request_locks, &request_id.0);
        let result = {
            let _guard = lock.acquire().await;
            self.decide_locked(request_id, &approver_id, input, correlation_id).await
        };
        drop(lock);

        if let Err(error) = &result {
            warn!(
                event_name = "approval.request.decision_refused",
                correlation_id = %correlation_id,
                request_id = %request_id,
                approver_id = %approver_id,
                error_class = error.error_class(),
                error = %error,
                "decision refused"
            );
        }
        result
    }

    /// Expires the request if its current level is overdue at `now`.
    pub async fn check_timeout(
        &self,
        request_id: &ApprovalRequestId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, WorkflowError> {
        let lock = RequestLock::register(&self.request_locks, &request_id.0);
        let _guard = lock.acquire().await;
        self.check_timeout_locked(request_id, now, correlation_id).await
    }

    /// Runs [`Self::check_timeout`] over every overdue in-progress request.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<SweepReport, WorkflowError> {
        let correlation_id = format!("sweep-{}", Uuid::new_v4());
        let mut report = SweepReport::default();
        let mut after: Option<ApprovalRequestId> = None;

        loop {
            let page = self.requests.list_in_progress(after.as_ref(), self.sweep_batch_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            let page_len = page.len();

            for request in page {
                report.scanned += 1;
                if !is_overdue(&request, now) {
                    continue;
                }
                match self.check_timeout(&request.id, now, &correlation_id).await {
                    Ok(checked) if checked.is_terminal() => report.expired += 1,
                    Ok(_) => {}
                    // decided or expired by someone else since the page was read
                    Err(WorkflowError::InvalidState { .. }) => {}
                    Err(error) => {
                        report.failed += 1;
                        warn!(
                            event_name = "approval.sweep.request_failed",
                            correlation_id = %correlation_id,
                            request_id = %request.id,
                            error_class = error.error_class(),
                            error = %error,
                            "timeout check failed during sweep"
                        );
                        report.failed_request_ids.push(request.id.clone());
                    }
                }
            }

            if page_len < self.sweep_batch_size as usize {
                break;
            }
        }

        info!(
            event_name = "approval.sweep.completed",
            correlation_id = %correlation_id,
            scanned = report.scanned,
            expired = report.expired,
            failed = report.failed,
            "timeout sweep completed"
        );
        Ok(report)
    }

    pub async fn get_request(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<ApprovalRequest, WorkflowError> {
        self.requests
            .find_by_id(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("approval request", id.0.clone()))
    }

    pub async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ApprovalRequest>, WorkflowError> {
        Ok(self.requests.list(filter).await?)
    }

    pub async fn list_transitions(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Vec<RequestTransition>, WorkflowError> {
        self.get_request(id).await?;
        Ok(self.requests.list_transitions(id).await?)
    }

    async fn decide_locked(
        &self,
        request_id: &ApprovalRequestId,
        approver_id: &UserId,
        input: DecisionInput,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, WorkflowError> {
        let request = self.get_request(request_id).await?;
        let expected = request.state_version;
        let outcome = self.engine.record_decision(
            request,
            approver_id,
            input.decision,
            input.comment,
            Utc::now(),
        )?;
        self.save(outcome, expected, correlation_id).await
    }

    async fn check_timeout_locked(
        &self,
        request_id: &ApprovalRequestId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, WorkflowError> {
        let request = self.get_request(request_id).await?;
        let expected = request.state_version;
        let outcome = self.engine.check_timeout(request, now)?;
        if !outcome.changed() {
            return Ok(outcome.request);
        }
        self.save(outcome, expected, correlation_id).await
    }

    async fn resolve_submission(
        &self,
        input: SubmissionInput,
    ) -> Result<(ApprovalHierarchy, EntityRef), WorkflowError> {
        let mut errors = ValidationErrors::default();
        let entity_type = EntityType::parse(&input.entity_type);
        if entity_type.is_none() {
            errors.push(
                "entityType",
                format!("`{}` is not a recognized entity type", input.entity_type.trim()),
            );
        }
        if input.entity_id.trim().is_empty() {
            errors.push("entityId", "is required");
        }
        if input.requester_id.trim().is_empty() {
            errors.push("requesterId", "is required");
        }
        if input.amount < Decimal::ZERO {
            errors.push("amount", "must not be negative");
        }
        let Some(entity_type) = entity_type.filter(|_| errors.is_empty()) else {
            return Err(errors.into());
        };

        let hierarchy = match input.hierarchy_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => self.get_hierarchy(&HierarchyId(id.to_string())).await?,
            _ => self.hierarchies.find_active_default(entity_type).await?.ok_or_else(|| {
                WorkflowError::not_found("default approval hierarchy", entity_type.as_str())
            })?,
        };

        let entity = EntityRef {
            entity_type,
            entity_id: input.entity_id.trim().to_string(),
            amount: input.amount,
            requester_id: UserId::new(input.requester_id.trim()),
        };
        Ok((hierarchy, entity))
    }

    async fn save(
        &self,
        outcome: ProgressionResult,
        expected_state_version: u32,
        correlation_id: &str,
    ) -> Result<ApprovalRequest, WorkflowError> {
        let ProgressionResult { request, transitions } = outcome;
        self.requests
            .update(request.clone(), expected_state_version, transitions.clone())
            .await?;

        info!(
            event_name = "approval.request.progressed",
            correlation_id = %correlation_id,
            request_id = %request.id,
            hierarchy_id = %request.hierarchy_id,
            status = request.status.as_str(),
            current_level = ?request.current_level,
            state_version = request.state_version,
            transitions = transitions.len(),
            "approval request progressed"
        );
        self.publish(&request, &transitions, correlation_id);
        Ok(request)
    }

    fn publish(
        &self,
        request: &ApprovalRequest,
        transitions: &[RequestTransition],
        correlation_id: &str,
    ) {
        for transition in transitions {
            if let Some(notification) =
                ApprovalNotification::from_transition(request, transition, correlation_id)
            {
                self.notifier.notify(notification);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use tollgate_core::approvals::{
        HierarchyDraft, HierarchyPatch, InMemoryApproverDirectory, LevelDraft, LevelEdit,
    };
    use tollgate_core::domain::directory::DirectoryUser;
    use tollgate_core::domain::hierarchy::{HierarchyFilter, HierarchyId, SystemRole};
    use tollgate_core::domain::request::{
        DecisionKind, LevelOutcome, RejectionPolicy, RequestFilter, RequestStatus,
        TransitionReason,
    };
    use tollgate_core::domain::UserId;
    use tollgate_core::errors::WorkflowError;
    use tollgate_core::notify::{InMemoryNotifier, NotificationKind};
    use tollgate_core::progression::ProgressionConfig;

    use super::{ApprovalWorkflow, DecisionInput, RequestLock, SubmissionInput};
    use crate::repositories::{ApprovalRequestRepository, InMemoryApprovalStore};

    fn person(id: &str, role: SystemRole) -> DirectoryUser {
        DirectoryUser {
            id: UserId::new(id),
            display_name: id.to_string(),
            role,
            manager_id: None,
            department_id: None,
            center_id: None,
            active: true,
        }
    }

    fn directory() -> InMemoryApproverDirectory {
        InMemoryApproverDirectory::default()
            .with_user(person("u-director", SystemRole::CenterDirector))
            .with_user(person("u-fin-1", SystemRole::FinanceTeam))
            .with_user(person("u-fin-2", SystemRole::FinanceTeam))
            .with_user(person("u-fin-3", SystemRole::FinanceTeam))
            .with_user(person("u-requester", SystemRole::ProcurementOfficer))
    }

    fn workflow(notifier: InMemoryNotifier) -> ApprovalWorkflow {
        let store = Arc::new(InMemoryApprovalStore::default());
        ApprovalWorkflow::new(store.clone(), store, Arc::new(directory()), Arc::new(notifier))
    }

    fn role_level(name: &str, role: &str) -> LevelDraft {
        LevelDraft {
            level_name: name.to_string(),
            approver_type: "ROLE_BASED".to_string(),
            approver_role: Some(role.to_string()),
            ..LevelDraft::default()
        }
    }

    fn standard_po() -> HierarchyDraft {
        HierarchyDraft {
            name: "Standard PO Approval".to_string(),
            entity_type: Some("PURCHASE_ORDER".to_string()),
            is_default: true,
            levels: vec![
                LevelDraft {
                    auto_approve_amount: Some(Decimal::new(10_000, 0)),
                    ..role_level("Center Director", "CENTER_DIRECTOR")
                },
                role_level("Finance", "FINANCE_TEAM"),
            ],
            ..HierarchyDraft::default()
        }
    }

    fn purchase_order(amount: i64) -> SubmissionInput {
        SubmissionInput {
            entity_type: "PURCHASE_ORDER".to_string(),
            entity_id: "PO-1001".to_string(),
            amount: Decimal::new(amount, 0),
            requester_id: "u-requester".to_string(),
            ..SubmissionInput::default()
        }
    }

    fn decision(approver: &str, kind: DecisionKind) -> DecisionInput {
        DecisionInput { approver_id: approver.to_string(), decision: kind, comment: None }
    }

    fn two_person_finance() -> HierarchyDraft {
        let mut draft = standard_po();
        draft.levels[1] = LevelDraft { min_approvals: Some(2), ..role_level("Finance", "FINANCE_TEAM") };
        draft
    }

    fn tracked_locks(workflow: &ApprovalWorkflow) -> usize {
        workflow.request_locks.lock().expect("lock map").len()
    }

    #[tokio::test]
    async fn small_purchase_order_skips_director_and_needs_one_finance_approval() {
        let notifier = InMemoryNotifier::default();
        let workflow = workflow(notifier.clone());
        workflow.create_hierarchy(standard_po(), "test").await.expect("create");

        let submitted = workflow.submit(purchase_order(5_000), "test").await.expect("submit");
        assert_eq!(submitted.status, RequestStatus::InProgress);
        assert_eq!(submitted.current_level, Some(2));
        assert_eq!(submitted.levels[0].outcome, LevelOutcome::AutoApproved);

        let approved = workflow
            .decide(&submitted.id, decision("u-fin-2", DecisionKind::Approve), "test")
            .await
            .expect("decide");
        assert_eq!(approved.status, RequestStatus::Approved);

        let kinds: Vec<NotificationKind> =
            notifier.notifications().into_iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::LevelAdvanced, NotificationKind::RequestApproved]);
    }

    #[tokio::test]
    async fn rejection_at_director_level_rejects_without_reaching_finance() {
        let workflow = workflow(InMemoryNotifier::default());
        workflow.create_hierarchy(standard_po(), "test").await.expect("create");

        let submitted = workflow.submit(purchase_order(50_000), "test").await.expect("submit");
        assert_eq!(submitted.current_level, Some(1));

        let rejected = workflow
            .decide(&submitted.id, decision("u-director", DecisionKind::Reject), "test")
            .await
            .expect("decide");
        assert_eq!(rejected.status, RequestStatus::Rejected);
        assert_eq!(rejected.levels[1].outcome, LevelOutcome::Pending);
        assert!(rejected.levels[1].decisions.is_empty());

        let error = workflow
            .decide(&submitted.id, decision("u-fin-1", DecisionKind::Approve), "test")
            .await
            .expect_err("terminal request");
        assert!(matches!(error, WorkflowError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn removing_the_only_level_is_refused() {
        let workflow = workflow(InMemoryNotifier::default());
        let hierarchy = workflow
            .create_hierarchy(
                HierarchyDraft {
                    name: "Leave".to_string(),
                    entity_type: Some("LEAVE_APPLICATION".to_string()),
                    levels: vec![role_level("HR", "HR_TEAM")],
                    ..HierarchyDraft::default()
                },
                "test",
            )
            .await
            .expect("create");

        let error = workflow
            .update_hierarchy(
                &hierarchy.id,
                HierarchyPatch {
                    level_edits: vec![LevelEdit::Remove { level_number: 1 }],
                    ..HierarchyPatch::default()
                },
                "test",
            )
            .await
            .expect_err("last level");
        assert!(matches!(error, WorkflowError::Validation(_)));

        let stored = workflow.get_hierarchy(&hierarchy.id).await.expect("get");
        assert_eq!(stored.levels.len(), 1);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn second_budget_default_takes_over() {
        let workflow = workflow(InMemoryNotifier::default());
        let budget = |name: &str| HierarchyDraft {
            name: name.to_string(),
            entity_type: Some("BUDGET".to_string()),
            is_default: true,
            levels: vec![role_level("Finance", "FINANCE_TEAM")],
            ..HierarchyDraft::default()
        };
        let a = workflow.create_hierarchy(budget("A"), "test").await.expect("create A");
        let b = workflow.create_hierarchy(budget("B"), "test").await.expect("create B");

        assert!(!workflow.get_hierarchy(&a.id).await.expect("A").is_default);
        let defaults: Vec<HierarchyId> = workflow
            .list_hierarchies(&HierarchyFilter::default())
            .await
            .expect("list")
            .into_iter()
            .filter(|summary| summary.hierarchy.is_default)
            .map(|summary| summary.hierarchy.id)
            .collect();
        assert_eq!(defaults, vec![b.id]);
    }

    #[tokio::test]
    async fn in_flight_request_keeps_its_pinned_levels_after_hierarchy_edit() {
        let workflow = workflow(InMemoryNotifier::default());
        let hierarchy = workflow.create_hierarchy(standard_po(), "test").await.expect("create");
        let submitted = workflow.submit(purchase_order(5_000), "test").await.expect("submit");

        workflow
            .update_hierarchy(
                &hierarchy.id,
                HierarchyPatch {
                    level_edits: vec![LevelEdit::Replace {
                        level_number: 2,
                        level: LevelDraft { requires_all: true, ..role_level("Finance", "FINANCE_TEAM") },
                    }],
                    ..HierarchyPatch::default()
                },
                "test",
            )
            .await
            .expect("update");

        let approved = workflow
            .decide(&submitted.id, decision("u-fin-1", DecisionKind::Approve), "test")
            .await
            .expect("decide");
        assert_eq!(approved.hierarchy_version, 1);
        assert_eq!(approved.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn ineligible_approver_leaves_request_untouched_and_repeat_decisions_replace() {
        let workflow = workflow(InMemoryNotifier::default());
        let mut draft = standard_po();
        draft.levels[1] = LevelDraft { min_approvals: Some(2), ..role_level("Finance", "FINANCE_TEAM") };
        workflow.create_hierarchy(draft, "test").await.expect("create");
        let submitted = workflow.submit(purchase_order(100), "test").await.expect("submit");

        let error = workflow
            .decide(&submitted.id, decision("u-director", DecisionKind::Approve), "test")
            .await
            .expect_err("not on the finance team");
        assert!(matches!(error, WorkflowError::Unauthorized { .. }));
        assert_eq!(workflow.get_request(&submitted.id).await.expect("get"), submitted);

        workflow
            .decide(&submitted.id, decision("u-fin-1", DecisionKind::Approve), "test")
            .await
            .expect("first");
        let repeated = workflow
            .decide(&submitted.id, decision("u-fin-1", DecisionKind::Approve), "test")
            .await
            .expect("repeat");
        assert_eq!(repeated.status, RequestStatus::InProgress);
        assert_eq!(repeated.current_level().map(|level| level.decisions.len()), Some(1));

        let inbox = workflow
            .list_requests(&RequestFilter {
                approver_id: Some(UserId::new("u-fin-3")),
                ..RequestFilter::default()
            })
            .await
            .expect("inbox");
        assert_eq!(inbox.len(), 1);
    }

    #[tokio::test]
    async fn quorum_policy_tolerates_one_rejection_out_of_three() {
        let store = Arc::new(InMemoryApprovalStore::default());
        let workflow = ApprovalWorkflow::new(
            store.clone(),
            store,
            Arc::new(directory()),
            Arc::new(InMemoryNotifier::default()),
        )
        .with_progression(ProgressionConfig {
            rejection_policy: RejectionPolicy::Quorum,
            ..ProgressionConfig::default()
        });
        let mut draft = standard_po();
        draft.levels[1] = LevelDraft { min_approvals: Some(2), ..role_level("Finance", "FINANCE_TEAM") };
        workflow.create_hierarchy(draft, "test").await.expect("create");
        let submitted = workflow.submit(purchase_order(100), "test").await.expect("submit");

        let after_one = workflow
            .decide(&submitted.id, decision("u-fin-1", DecisionKind::Reject), "test")
            .await
            .expect("first rejection");
        assert_eq!(after_one.status, RequestStatus::InProgress);

        let after_two = workflow
            .decide(&submitted.id, decision("u-fin-2", DecisionKind::Reject), "test")
            .await
            .expect("second rejection");
        assert_eq!(after_two.status, RequestStatus::Rejected);
    }

    #[tokio::test]
    async fn timeouts_expire_only_after_the_deadline() {
        let workflow = workflow(InMemoryNotifier::default());
        let mut draft = standard_po();
        draft.levels[1].timeout_hours = Some(48);
        workflow.create_hierarchy(draft, "test").await.expect("create");
        let submitted = workflow.submit(purchase_order(100), "test").await.expect("submit");
        let entered = submitted.level_entered_at.expect("entered");

        let early = workflow
            .check_timeout(&submitted.id, entered + Duration::hours(48), "test")
            .await
            .expect("check");
        assert_eq!(early, submitted);

        let report = workflow.sweep_timeouts(entered + Duration::hours(49)).await.expect("sweep");
        assert_eq!((report.scanned, report.expired, report.failed), (1, 1, 0));

        let expired = workflow.get_request(&submitted.id).await.expect("get");
        assert_eq!(expired.status, RequestStatus::Expired);
        let history = workflow.list_transitions(&submitted.id).await.expect("history");
        assert_eq!(history.last().map(|t| t.reason), Some(TransitionReason::TimedOut));

        let error = workflow
            .check_timeout(&submitted.id, Utc::now() + Duration::days(10), "test")
            .await
            .expect_err("terminal");
        assert!(matches!(error, WorkflowError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn submission_without_default_or_with_bad_input_fails_cleanly() {
        let workflow = workflow(InMemoryNotifier::default());

        let missing = workflow.submit(purchase_order(100), "test").await.expect_err("no default");
        assert!(matches!(missing, WorkflowError::NotFound { .. }));

        let invalid = workflow
            .preview(SubmissionInput {
                entity_type: "SPACESHIP".to_string(),
                amount: Decimal::new(-1, 0),
                ..SubmissionInput::default()
            })
            .await
            .expect_err("invalid");
        let WorkflowError::Validation(errors) = invalid else {
            panic!("expected validation error, got {invalid:?}");
        };
        let fields: Vec<&str> = errors.fields().collect();
        assert_eq!(fields, vec!["entityType", "entityId", "requesterId", "amount"]);
    }

    #[tokio::test]
    async fn preview_reports_the_route_without_storing_anything() {
        let workflow = workflow(InMemoryNotifier::default());
        workflow.create_hierarchy(standard_po(), "test").await.expect("create");

        let plan = workflow.preview(purchase_order(5_000)).await.expect("preview");
        assert!(plan.levels[0].is_auto_approved());
        assert_eq!(plan.first_pending_level().map(|level| level.level_number), Some(2));
        assert!(workflow.list_requests(&RequestFilter::default()).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn sweep_skips_levels_whose_timeout_overflows_the_calendar() {
        let store = Arc::new(InMemoryApprovalStore::default());
        let workflow = ApprovalWorkflow::new(
            store.clone(),
            store.clone(),
            Arc::new(directory()),
            Arc::new(InMemoryNotifier::default()),
        );
        let mut draft = standard_po();
        draft.levels[1].timeout_hours = Some(48);
        workflow.create_hierarchy(draft, "test").await.expect("create");
        let mut submitted = workflow.submit(purchase_order(100), "test").await.expect("submit");

        // stored before the upper bound on timeouts existed
        submitted.levels[1].timeout_hours = Some(u32::MAX);
        let version = submitted.state_version;
        ApprovalRequestRepository::update(store.as_ref(), submitted.clone(), version, Vec::new())
            .await
            .expect("rewrite level");

        let report = workflow.sweep_timeouts(chrono::DateTime::<Utc>::MAX_UTC).await.expect("sweep");
        assert_eq!((report.scanned, report.expired, report.failed), (1, 0, 0));
        let checked = workflow
            .check_timeout(&submitted.id, Utc::now() + Duration::days(365 * 100), "test")
            .await
            .expect("check");
        assert_eq!(checked.status, RequestStatus::InProgress);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_approvals_are_applied_one_at_a_time() {
        let workflow = Arc::new(workflow(InMemoryNotifier::default()));
        workflow.create_hierarchy(two_person_finance(), "test").await.expect("create");
        let submitted = workflow.submit(purchase_order(100), "test").await.expect("submit");

        let tasks: Vec<_> = ["u-fin-1", "u-fin-2", "u-fin-1", "u-fin-2"]
            .into_iter()
            .map(|approver| {
                let workflow = Arc::clone(&workflow);
                let id = submitted.id.clone();
                tokio::spawn(async move {
                    workflow.decide(&id, decision(approver, DecisionKind::Approve), "race").await
                })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            match task.await.expect("task") {
                Ok(_) => accepted += 1,
                Err(WorkflowError::InvalidState { .. }) => {}
                Err(other) => panic!("decision should be serialized, got {other:?}"),
            }
        }

        let stored = workflow.get_request(&submitted.id).await.expect("get");
        assert_eq!(stored.status, RequestStatus::Approved);
        let mut approvers: Vec<&str> =
            stored.levels[1].decisions.iter().map(|d| d.approver_id.as_str()).collect();
        approvers.sort_unstable();
        assert_eq!(approvers, vec!["u-fin-1", "u-fin-2"]);

        let history = workflow.list_transitions(&submitted.id).await.expect("history");
        let versions: Vec<u32> = history.iter().map(|t| t.state_version).collect();
        assert_eq!(versions, (1..=stored.state_version).collect::<Vec<_>>());
        let count = |reason: TransitionReason| history.iter().filter(|t| t.reason == reason).count();
        assert_eq!(count(TransitionReason::DecisionRecorded), accepted);
        assert_eq!(count(TransitionReason::RequestApproved), 1);
        assert_eq!(tracked_locks(&workflow), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_approve_and_reject_from_one_approver_ends_rejected() {
        let workflow = Arc::new(workflow(InMemoryNotifier::default()));
        workflow.create_hierarchy(two_person_finance(), "test").await.expect("create");
        let submitted = workflow.submit(purchase_order(100), "test").await.expect("submit");

        let spawn_decision = |kind: DecisionKind| {
            let workflow = Arc::clone(&workflow);
            let id = submitted.id.clone();
            tokio::spawn(async move { workflow.decide(&id, decision("u-fin-1", kind), "race").await })
        };
        let approve = spawn_decision(DecisionKind::Approve);
        let reject = spawn_decision(DecisionKind::Reject);

        let rejected = reject.await.expect("task").expect("reject always lands");
        assert_eq!(rejected.status, RequestStatus::Rejected);
        match approve.await.expect("task") {
            Ok(_) | Err(WorkflowError::InvalidState { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }

        let stored = workflow.get_request(&submitted.id).await.expect("get");
        assert_eq!(stored.status, RequestStatus::Rejected);
        let decisions: Vec<DecisionKind> =
            stored.levels[1].decisions.iter().map(|d| d.decision).collect();
        assert_eq!(decisions, vec![DecisionKind::Reject]);
        let history = workflow.list_transitions(&submitted.id).await.expect("history");
        assert_eq!(history.len() as u32, stored.state_version);
    }

    #[tokio::test]
    async fn cancelled_decision_does_not_leak_its_lock_entry() {
        let workflow = workflow(InMemoryNotifier::default());
        workflow.create_hierarchy(standard_po(), "test").await.expect("create");
        let submitted = workflow.submit(purchase_order(100), "test").await.expect("submit");

        let held = RequestLock::register(&workflow.request_locks, &submitted.id.0);
        let guard = held.acquire().await;
        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            workflow.decide(&submitted.id, decision("u-fin-1", DecisionKind::Approve), "test"),
        )
        .await;
        assert!(waiting.is_err(), "decision should still be waiting on the lock");
        assert_eq!(tracked_locks(&workflow), 1);

        drop(guard);
        drop(held);
        assert_eq!(tracked_locks(&workflow), 0);

        let approved = workflow
            .decide(&submitted.id, decision("u-fin-1", DecisionKind::Approve), "test")
            .await
            .expect("decide");
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(tracked_locks(&workflow), 0);
    }

    #[tokio::test]
    async fn negative_zero_amount_is_accepted() {
        let workflow = workflow(InMemoryNotifier::default());
        workflow.create_hierarchy(standard_po(), "test").await.expect("create");
        let mut zero = Decimal::ZERO;
        zero.set_sign_negative(true);
        assert!(zero.is_sign_negative());

        let submitted = workflow
            .submit(SubmissionInput { amount: zero, ..purchase_order(0) }, "test")
            .await
            .expect("zero is not negative");
        assert_eq!(submitted.current_level, Some(2));
    }
}
