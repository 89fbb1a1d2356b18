//! Validation and level editing for approval hierarchy definitions.
//!
//! Input arrives as loosely typed drafts (the shape an HTTP form submits) and
//! leaves as a fully typed [`ApprovalHierarchy`] whose levels are numbered
//! `1..=N` with no gaps.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::hierarchy::{
    ApprovalHierarchy, ApprovalLevel, ApproverRule, ApproverType, EntityType, HierarchyId,
    SystemRole,
};
use crate::domain::UserId;
use crate::errors::{FieldError, ValidationErrors};

/// Ten years.
pub const MAX_TIMEOUT_HOURS: u32 = 87_600;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LevelDraft {
    pub level_name: String,
    pub description: Option<String>,
    pub approver_type: String,
    pub approver_role: Option<String>,
    pub specific_approvers: Vec<String>,
    pub min_approvals: Option<u32>,
    pub requires_all: bool,
    pub auto_approve_amount: Option<Decimal>,
    pub timeout_hours: Option<u32>,
    pub is_active: Option<bool>,
}

impl LevelDraft {
    pub fn from_level(level: &ApprovalLevel) -> Self {
        Self {
            level_name: level.level_name.clone(),
            description: level.description.clone(),
            approver_type: level.approver.approver_type().as_str().to_string(),
            approver_role: level.approver.role().map(|role| role.as_str().to_string()),
            specific_approvers: level
                .approver
                .specific_users()
                .map(|users| users.iter().map(|user| user.0.clone()).collect())
                .unwrap_or_default(),
            min_approvals: Some(level.min_approvals),
            requires_all: level.requires_all,
            auto_approve_amount: level.auto_approve_amount,
            timeout_hours: level.timeout_hours,
            is_active: Some(level.is_active),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HierarchyDraft {
    pub name: String,
    pub description: Option<String>,
    pub entity_type: Option<String>,
    pub is_active: Option<bool>,
    pub is_default: bool,
    pub levels: Vec<LevelDraft>,
}

/// One structural edit to a hierarchy's level list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum LevelEdit {
    /// Insert at 1-based `position`, or append when absent.
    #[serde(rename_all = "camelCase")]
    Add { position: Option<u32>, level: LevelDraft },
    #[serde(rename_all = "camelCase")]
    Replace { level_number: u32, level: LevelDraft },
    #[serde(rename_all = "camelCase")]
    Remove { level_number: u32 },
    /// `order` lists the current level numbers in their new sequence.
    Reorder { order: Vec<u32> },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HierarchyPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub entity_type: Option<String>,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
    /// Replaces the whole level list before `level_edits` run.
    pub levels: Option<Vec<LevelDraft>>,
    pub level_edits: Vec<LevelEdit>,
}

/// Builds a new hierarchy at version 1.
pub fn build_hierarchy(
    id: HierarchyId,
    draft: HierarchyDraft,
    now: DateTime<Utc>,
) -> Result<ApprovalHierarchy, ValidationErrors> {
    let mut errors = ValidationErrors::default();

    let name = draft.name.trim().to_string();
    if name.is_empty() {
        errors.push("name", "must not be empty");
    }

    let entity_type = match draft.entity_type.as_deref().map(str::trim) {
        None | Some("") => {
            errors.push("entityType", "is required");
            None
        }
        Some(raw) => {
            let parsed = EntityType::parse(raw);
            if parsed.is_none() {
                errors.push("entityType", format!("`{raw}` is not a recognized entity type"));
            }
            parsed
        }
    };

    if draft.levels.is_empty() {
        errors.push("levels", "a hierarchy needs at least one level");
    }
    let levels = build_levels("levels", &draft.levels, &mut errors);

    match (entity_type, errors.is_empty()) {
        (Some(entity_type), true) => Ok(ApprovalHierarchy {
            id,
            name,
            description: normalize_optional(draft.description),
            entity_type,
            is_active: draft.is_active.unwrap_or(true),
            is_default: draft.is_default,
            version: 1,
            levels,
            created_at: now,
            updated_at: now,
        }),
        _ => Err(errors),
    }
}

/// Applies `patch` to `current`, returning the next version.
pub fn apply_patch(
    current: &ApprovalHierarchy,
    patch: HierarchyPatch,
    now: DateTime<Utc>,
) -> Result<ApprovalHierarchy, ValidationErrors> {
    let mut errors = ValidationErrors::default();
    let mut next = current.clone();

    if let Some(name) = patch.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            errors.push("name", "must not be empty");
        }
        next.name = name;
    }
    if let Some(description) = patch.description {
        next.description = normalize_optional(Some(description));
    }
    if let Some(raw) = patch.entity_type {
        match EntityType::parse(&raw) {
            Some(entity_type) => next.entity_type = entity_type,
            None => errors.push("entityType", format!("`{raw}` is not a recognized entity type")),
        }
    }
    if let Some(is_active) = patch.is_active {
        next.is_active = is_active;
    }
    if let Some(is_default) = patch.is_default {
        next.is_default = is_default;
    }

    if let Some(drafts) = patch.levels {
        if drafts.is_empty() {
            errors.push("levels", "a hierarchy needs at least one level");
        }
        next.levels = build_levels("levels", &drafts, &mut errors);
    }

    for (index, edit) in patch.level_edits.into_iter().enumerate() {
        let field = format!("levelEdits[{index}]");
        if let Err(error) = apply_edit(&mut next.levels, edit, &field, &mut errors) {
            errors.0.push(error);
        }
    }

    if next.levels.is_empty() {
        errors.push("levels", "cannot remove the last remaining level");
    }
    renumber(&mut next.levels);
    if let Err(error) = check_numbering(&next.levels) {
        errors.0.push(error);
    }

    next.version = current.version + 1;
    next.updated_at = now;
    errors.into_result(next)
}

/// Rewrites level numbers to `1..=N` in list order.
pub fn renumber(levels: &mut [ApprovalLevel]) {
    for (index, level) in levels.iter_mut().enumerate() {
        level.level_number = index as u32 + 1;
    }
}

pub fn check_numbering(levels: &[ApprovalLevel]) -> Result<(), FieldError> {
    let mut numbers: Vec<u32> = levels.iter().map(|level| level.level_number).collect();
    numbers.sort_unstable();
    let contiguous = numbers.iter().enumerate().all(|(index, number)| *number == index as u32 + 1);
    if contiguous {
        Ok(())
    } else {
        Err(FieldError::new(
            "levels",
            format!("level numbers must be contiguous from 1, found {numbers:?}"),
        ))
    }
}

fn apply_edit(
    levels: &mut Vec<ApprovalLevel>,
    edit: LevelEdit,
    field: &str,
    errors: &mut ValidationErrors,
) -> Result<(), FieldError> {
    match edit {
        LevelEdit::Add { position, level } => {
            let Some(built) = build_level(&format!("{field}.level"), &level, 0, errors) else {
                return Ok(());
            };
            let index = match position {
                None => levels.len(),
                Some(position) if position >= 1 && position as usize <= levels.len() + 1 => {
                    position as usize - 1
                }
                Some(position) => {
                    return Err(FieldError::new(
                        format!("{field}.position"),
                        format!("must be between 1 and {}, got {position}", levels.len() + 1),
                    ));
                }
            };
            levels.insert(index, built);
        }
        LevelEdit::Replace { level_number, level } => {
            let index = position_of(levels, level_number, field)?;
            if let Some(built) = build_level(&format!("{field}.level"), &level, level_number, errors)
            {
                levels[index] = built;
            }
        }
        LevelEdit::Remove { level_number } => {
            let index = position_of(levels, level_number, field)?;
            if levels.len() == 1 {
                return Err(FieldError::new(field, "cannot remove the last remaining level"));
            }
            levels.remove(index);
        }
        LevelEdit::Reorder { order } => {
            let expected: BTreeSet<u32> = levels.iter().map(|level| level.level_number).collect();
            let given: BTreeSet<u32> = order.iter().copied().collect();
            if order.len() != levels.len() || given != expected {
                return Err(FieldError::new(
                    format!("{field}.order"),
                    format!("must list each of {expected:?} exactly once"),
                ));
            }
            let mut reordered = Vec::with_capacity(levels.len());
            for number in order {
                let index = position_of(levels, number, field)?;
                reordered.push(levels[index].clone());
            }
            *levels = reordered;
        }
    }
    renumber(levels);
    Ok(())
}

fn position_of(levels: &[ApprovalLevel], level_number: u32, field: &str) -> Result<usize, FieldError> {
    levels.iter().position(|level| level.level_number == level_number).ok_or_else(|| {
        FieldError::new(format!("{field}.levelNumber"), format!("level {level_number} does not exist"))
    })
}

fn build_levels(
    field: &str,
    drafts: &[LevelDraft],
    errors: &mut ValidationErrors,
) -> Vec<ApprovalLevel> {
    drafts
        .iter()
        .enumerate()
        .filter_map(|(index, draft)| {
            build_level(&format!("{field}[{index}]"), draft, index as u32 + 1, errors)
        })
        .collect()
}

fn build_level(
    field: &str,
    draft: &LevelDraft,
    level_number: u32,
    errors: &mut ValidationErrors,
) -> Option<ApprovalLevel> {
    let before = errors.0.len();

    let level_name = draft.level_name.trim().to_string();
    if level_name.is_empty() {
        errors.push(format!("{field}.levelName"), "must not be empty");
    }

    let min_approvals = draft.min_approvals.unwrap_or(1);
    if min_approvals < 1 {
        errors.push(format!("{field}.minApprovals"), "must be at least 1");
    }

    match draft.timeout_hours {
        Some(0) => errors.push(format!("{field}.timeoutHours"), "must be at least 1 hour when set"),
        Some(hours) if hours > MAX_TIMEOUT_HOURS => errors.push(
            format!("{field}.timeoutHours"),
            format!("must not exceed {MAX_TIMEOUT_HOURS} hours"),
        ),
        _ => {}
    }

    if draft.auto_approve_amount.is_some_and(|amount| amount < Decimal::ZERO) {
        errors.push(format!("{field}.autoApproveAmount"), "must not be negative");
    }

    let approver = build_rule(field, draft, min_approvals, errors);

    if errors.0.len() > before {
        return None;
    }
    Some(ApprovalLevel {
        level_number,
        level_name,
        description: normalize_optional(draft.description.clone()),
        approver: approver?,
        min_approvals,
        requires_all: draft.requires_all,
        auto_approve_amount: draft.auto_approve_amount,
        timeout_hours: draft.timeout_hours,
        is_active: draft.is_active.unwrap_or(true),
    })
}

fn build_rule(
    field: &str,
    draft: &LevelDraft,
    min_approvals: u32,
    errors: &mut ValidationErrors,
) -> Option<ApproverRule> {
    let raw_type = draft.approver_type.trim();
    let Some(approver_type) = ApproverType::parse(raw_type) else {
        let message = if raw_type.is_empty() {
            "is required".to_string()
        } else {
            format!("`{raw_type}` is not a recognized approver type")
        };
        errors.push(format!("{field}.approverType"), message);
        return None;
    };

    let rule = match approver_type {
        ApproverType::RoleBased => {
            let raw_role = draft.approver_role.as_deref().map(str::trim).unwrap_or_default();
            if raw_role.is_empty() {
                errors.push(format!("{field}.approverRole"), "is required for ROLE_BASED levels");
                return None;
            }
            let Some(role) = SystemRole::parse(raw_role) else {
                errors.push(
                    format!("{field}.approverRole"),
                    format!("`{raw_role}` is not a recognized system role"),
                );
                return None;
            };
            ApproverRule::RoleBased { role }
        }
        ApproverType::SpecificUsers => {
            let user_ids: BTreeSet<UserId> = draft
                .specific_approvers
                .iter()
                .map(|id| id.trim())
                .filter(|id| !id.is_empty())
                .map(UserId::new)
                .collect();
            if user_ids.is_empty() {
                errors.push(
                    format!("{field}.specificApprovers"),
                    "must list at least one user for SPECIFIC_USERS levels",
                );
                return None;
            }
            if !draft.requires_all && min_approvals as usize > user_ids.len() {
                errors.push(
                    format!("{field}.minApprovals"),
                    format!("cannot exceed the {} listed approvers", user_ids.len()),
                );
                return None;
            }
            ApproverRule::SpecificUsers { user_ids }
        }
        ApproverType::ReportingManager => ApproverRule::ReportingManager,
        ApproverType::DepartmentHead => ApproverRule::DepartmentHead,
        ApproverType::CenterDirector => ApproverRule::CenterDirector,
        ApproverType::FinanceTeam => ApproverRule::FinanceTeam,
        ApproverType::HrTeam => ApproverRule::HrTeam,
    };
    Some(rule)
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}
