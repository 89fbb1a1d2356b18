pub mod directory;
pub mod evaluator;
pub mod hierarchy;

pub use directory::{ApproverDirectory, DirectoryError, InMemoryApproverDirectory};
pub use evaluator::{check_applicable, ApprovalPlan, LevelDisposition, LevelEvaluator, PlannedLevel};
pub use hierarchy::{
    apply_patch, build_hierarchy, check_numbering, renumber, HierarchyDraft, HierarchyPatch,
    LevelDraft, LevelEdit,
};
