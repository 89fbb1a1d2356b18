use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HierarchyId(pub String);

impl std::fmt::Display for HierarchyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Business object category a hierarchy governs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    PurchaseOrder,
    Budget,
    BudgetPeriod,
    Purchase,
    Expense,
    Payment,
    LeaveApplication,
    SalaryRevision,
    AssetAllocation,
    InventoryTransfer,
    VendorCreation,
}

impl EntityType {
    pub const ALL: [EntityType; 11] = [
        Self::PurchaseOrder,
        Self::Budget,
        Self::BudgetPeriod,
        Self::Purchase,
        Self::Expense,
        Self::Payment,
        Self::LeaveApplication,
        Self::SalaryRevision,
        Self::AssetAllocation,
        Self::InventoryTransfer,
        Self::VendorCreation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PurchaseOrder => "PURCHASE_ORDER",
            Self::Budget => "BUDGET",
            Self::BudgetPeriod => "BUDGET_PERIOD",
            Self::Purchase => "PURCHASE",
            Self::Expense => "EXPENSE",
            Self::Payment => "PAYMENT",
            Self::LeaveApplication => "LEAVE_APPLICATION",
            Self::SalaryRevision => "SALARY_REVISION",
            Self::AssetAllocation => "ASSET_ALLOCATION",
            Self::InventoryTransfer => "INVENTORY_TRANSFER",
            Self::VendorCreation => "VENDOR_CREATION",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let key = normalize_tag(value);
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == key)
    }
}

/// Roles recognized by the identity service for role-based levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemRole {
    SuperAdmin,
    Admin,
    CenterDirector,
    DepartmentHead,
    Manager,
    FinanceTeam,
    HrTeam,
    ProcurementOfficer,
    Accountant,
    Teacher,
    Employee,
}

impl SystemRole {
    pub const ALL: [SystemRole; 11] = [
        Self::SuperAdmin,
        Self::Admin,
        Self::CenterDirector,
        Self::DepartmentHead,
        Self::Manager,
        Self::FinanceTeam,
        Self::HrTeam,
        Self::ProcurementOfficer,
        Self::Accountant,
        Self::Teacher,
        Self::Employee,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "SUPER_ADMIN",
            Self::Admin => "ADMIN",
            Self::CenterDirector => "CENTER_DIRECTOR",
            Self::DepartmentHead => "DEPARTMENT_HEAD",
            Self::Manager => "MANAGER",
            Self::FinanceTeam => "FINANCE_TEAM",
            Self::HrTeam => "HR_TEAM",
            Self::ProcurementOfficer => "PROCUREMENT_OFFICER",
            Self::Accountant => "ACCOUNTANT",
            Self::Teacher => "TEACHER",
            Self::Employee => "EMPLOYEE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let key = normalize_tag(value);
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApproverType {
    RoleBased,
    SpecificUsers,
    ReportingManager,
    DepartmentHead,
    CenterDirector,
    FinanceTeam,
    HrTeam,
}

impl ApproverType {
    pub const ALL: [ApproverType; 7] = [
        Self::RoleBased,
        Self::SpecificUsers,
        Self::ReportingManager,
        Self::DepartmentHead,
        Self::CenterDirector,
        Self::FinanceTeam,
        Self::HrTeam,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoleBased => "ROLE_BASED",
            Self::SpecificUsers => "SPECIFIC_USERS",
            Self::ReportingManager => "REPORTING_MANAGER",
            Self::DepartmentHead => "DEPARTMENT_HEAD",
            Self::CenterDirector => "CENTER_DIRECTOR",
            Self::FinanceTeam => "FINANCE_TEAM",
            Self::HrTeam => "HR_TEAM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let key = normalize_tag(value);
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == key)
    }
}

/// Who may decide at a level. Each variant carries only the data it needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "approverType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApproverRule {
    RoleBased {
        #[serde(rename = "approverRole")]
        role: SystemRole,
    },
    SpecificUsers {
        #[serde(rename = "specificApprovers")]
        user_ids: BTreeSet<UserId>,
    },
    ReportingManager,
    DepartmentHead,
    CenterDirector,
    FinanceTeam,
    HrTeam,
}

impl ApproverRule {
    pub fn approver_type(&self) -> ApproverType {
        match self {
            Self::RoleBased { .. } => ApproverType::RoleBased,
            Self::SpecificUsers { .. } => ApproverType::SpecificUsers,
            Self::ReportingManager => ApproverType::ReportingManager,
            Self::DepartmentHead => ApproverType::DepartmentHead,
            Self::CenterDirector => ApproverType::CenterDirector,
            Self::FinanceTeam => ApproverType::FinanceTeam,
            Self::HrTeam => ApproverType::HrTeam,
        }
    }

    pub fn role(&self) -> Option<SystemRole> {
        match self {
            Self::RoleBased { role } => Some(*role),
            _ => None,
        }
    }

    pub fn specific_users(&self) -> Option<&BTreeSet<UserId>> {
        match self {
            Self::SpecificUsers { user_ids } => Some(user_ids),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalLevel {
    pub level_number: u32,
    pub level_name: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub approver: ApproverRule,
    pub min_approvals: u32,
    pub requires_all: bool,
    pub auto_approve_amount: Option<Decimal>,
    pub timeout_hours: Option<u32>,
    pub is_active: bool,
}

impl ApprovalLevel {
    /// Amounts at or below the threshold skip the level.
    pub fn auto_approves(&self, amount: Decimal) -> bool {
        self.auto_approve_amount.is_some_and(|threshold| amount <= threshold)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalHierarchy {
    pub id: HierarchyId,
    pub name: String,
    pub description: Option<String>,
    pub entity_type: EntityType,
    pub is_active: bool,
    pub is_default: bool,
    pub version: u32,
    pub levels: Vec<ApprovalLevel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalHierarchy {
    /// Active levels in ascending level order.
    pub fn active_levels(&self) -> Vec<&ApprovalLevel> {
        let mut levels: Vec<&ApprovalLevel> =
            self.levels.iter().filter(|level| level.is_active).collect();
        levels.sort_by_key(|level| level.level_number);
        levels
    }

    pub fn is_active_default(&self) -> bool {
        self.is_active && self.is_default
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchySummary {
    #[serde(flatten)]
    pub hierarchy: ApprovalHierarchy,
    pub request_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyFilter {
    pub entity_type: Option<EntityType>,
    pub is_active: Option<bool>,
}

impl HierarchyFilter {
    pub fn matches(&self, hierarchy: &ApprovalHierarchy) -> bool {
        self.entity_type.map_or(true, |entity_type| hierarchy.entity_type == entity_type)
            && self.is_active.map_or(true, |is_active| hierarchy.is_active == is_active)
    }
}

fn normalize_tag(value: &str) -> String {
    value.trim().replace(['-', ' '], "_").to_ascii_uppercase()
}
