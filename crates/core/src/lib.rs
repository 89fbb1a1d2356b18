pub mod approvals;
pub mod config;
pub mod domain;
pub mod errors;
pub mod notify;
pub mod progression;

pub use approvals::{
    ApprovalPlan, ApproverDirectory, HierarchyDraft, HierarchyPatch, LevelDraft, LevelEdit,
    LevelEvaluator,
};
pub use domain::hierarchy::{ApprovalHierarchy, ApprovalLevel, ApproverRule, EntityType, HierarchyId};
pub use domain::request::{ApprovalRequest, ApprovalRequestId, RequestStatus};
pub use domain::UserId;
pub use errors::{InterfaceError, ValidationErrors, WorkflowError};
pub use notify::{ApprovalNotification, ApprovalNotifier};
pub use progression::{ProgressionConfig, ProgressionEngine, ProgressionResult};
