use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::approvals::directory::ApproverDirectory;
use crate::domain::directory::Team;
use crate::domain::hierarchy::{
    ApprovalHierarchy, ApprovalLevel, ApproverRule, ApproverType, EntityType, HierarchyId,
};
use crate::domain::request::EntityRef;
use crate::domain::UserId;
use crate::errors::WorkflowError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LevelDisposition {
    AutoApproved,
    #[serde(rename_all = "camelCase")]
    AwaitingDecision { eligible_approvers: BTreeSet<UserId>, required_approvals: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedLevel {
    pub level_number: u32,
    pub level_name: String,
    pub approver_type: ApproverType,
    pub requires_all: bool,
    pub timeout_hours: Option<u32>,
    #[serde(flatten)]
    pub disposition: LevelDisposition,
}

impl PlannedLevel {
    pub fn is_auto_approved(&self) -> bool {
        matches!(self.disposition, LevelDisposition::AutoApproved)
    }
}

/// The route a submission takes through a hierarchy, resolved up front.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPlan {
    pub hierarchy_id: HierarchyId,
    pub hierarchy_version: u32,
    pub hierarchy_name: String,
    pub entity: EntityRef,
    pub levels: Vec<PlannedLevel>,
}

impl ApprovalPlan {
    pub fn first_pending_level(&self) -> Option<&PlannedLevel> {
        self.levels.iter().find(|level| !level.is_auto_approved())
    }

    pub fn is_fully_auto_approved(&self) -> bool {
        self.first_pending_level().is_none()
    }
}

#[derive(Clone, Debug)]
pub struct LevelEvaluator<D> {
    directory: D,
}

impl<D> LevelEvaluator<D>
where
    D: ApproverDirectory,
{
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    pub async fn plan(
        &self,
        hierarchy: &ApprovalHierarchy,
        entity: &EntityRef,
    ) -> Result<ApprovalPlan, WorkflowError> {
        check_applicable(hierarchy, entity.entity_type)?;

        let active_levels = hierarchy.active_levels();
        if active_levels.is_empty() {
            return Err(WorkflowError::Configuration(format!(
                "hierarchy `{}` has no active levels",
                hierarchy.id
            )));
        }

        let mut levels = Vec::with_capacity(active_levels.len());
        for level in active_levels {
            let disposition = if level.auto_approves(entity.amount) {
                LevelDisposition::AutoApproved
            } else {
                self.awaiting_decision(hierarchy, level, &entity.requester_id).await?
            };
            levels.push(PlannedLevel {
                level_number: level.level_number,
                level_name: level.level_name.clone(),
                approver_type: level.approver.approver_type(),
                requires_all: level.requires_all,
                timeout_hours: level.timeout_hours,
                disposition,
            });
        }

        Ok(ApprovalPlan {
            hierarchy_id: hierarchy.id.clone(),
            hierarchy_version: hierarchy.version,
            hierarchy_name: hierarchy.name.clone(),
            entity: entity.clone(),
            levels,
        })
    }

    pub async fn resolve_eligible(
        &self,
        rule: &ApproverRule,
        requester_id: &UserId,
    ) -> Result<BTreeSet<UserId>, WorkflowError> {
        let resolved: Vec<UserId> = match rule {
            ApproverRule::RoleBased { role } => self.directory.users_with_role(*role).await?,
            ApproverRule::SpecificUsers { user_ids } => return Ok(user_ids.clone()),
            ApproverRule::ReportingManager => {
                self.directory.reporting_manager(requester_id).await?.into_iter().collect()
            }
            ApproverRule::DepartmentHead => {
                self.directory.department_head(requester_id).await?.into_iter().collect()
            }
            ApproverRule::CenterDirector => {
                self.directory.center_director(requester_id).await?.into_iter().collect()
            }
            ApproverRule::FinanceTeam => self.directory.team_members(Team::Finance).await?,
            ApproverRule::HrTeam => self.directory.team_members(Team::Hr).await?,
        };
        Ok(resolved.into_iter().collect())
    }

    async fn awaiting_decision(
        &self,
        hierarchy: &ApprovalHierarchy,
        level: &ApprovalLevel,
        requester_id: &UserId,
    ) -> Result<LevelDisposition, WorkflowError> {
        let eligible_approvers = self.resolve_eligible(&level.approver, requester_id).await?;
        if eligible_approvers.is_empty() {
            return Err(WorkflowError::Configuration(format!(
                "level {} ({}) of hierarchy `{}` resolves to no eligible {} approvers",
                level.level_number,
                level.level_name,
                hierarchy.id,
                rule_label(&level.approver)
            )));
        }

        let required_approvals = if level.requires_all {
            eligible_approvers.len() as u32
        } else {
            level.min_approvals
        };
        if required_approvals as usize > eligible_approvers.len() {
            return Err(WorkflowError::Configuration(format!(
                "level {} ({}) of hierarchy `{}` needs {} approvals but only {} approvers are eligible",
                level.level_number,
                level.level_name,
                hierarchy.id,
                required_approvals,
                eligible_approvers.len()
            )));
        }

        Ok(LevelDisposition::AwaitingDecision { eligible_approvers, required_approvals })
    }
}

/// Fails unless `hierarchy` can take new submissions of `entity_type`.
pub fn check_applicable(
    hierarchy: &ApprovalHierarchy,
    entity_type: EntityType,
) -> Result<(), WorkflowError> {
    if !hierarchy.is_active {
        return Err(WorkflowError::validation(
            "hierarchyId",
            format!("hierarchy `{}` is inactive", hierarchy.id),
        ));
    }
    if hierarchy.entity_type != entity_type {
        return Err(WorkflowError::validation(
            "hierarchyId",
            format!(
                "hierarchy `{}` governs {} and cannot route {}",
                hierarchy.id,
                hierarchy.entity_type.as_str(),
                entity_type.as_str()
            ),
        ));
    }
    Ok(())
}

fn rule_label(rule: &ApproverRule) -> &'static str {
    match rule {
        ApproverRule::RoleBased { role } => role.as_str(),
        other => other.approver_type().as_str(),
    }
}
