use serde::{Deserialize, Serialize};

use crate::domain::hierarchy::SystemRole;
use crate::domain::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    pub id: UserId,
    pub display_name: String,
    pub role: SystemRole,
    pub manager_id: Option<UserId>,
    pub department_id: Option<String>,
    pub center_id: Option<String>,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    pub id: String,
    pub name: String,
    pub head_user_id: Option<UserId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Center {
    pub id: String,
    pub name: String,
    pub director_user_id: Option<UserId>,
}

/// Role groups resolved as a whole rather than relative to the requester.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Team {
    Finance,
    Hr,
}

impl Team {
    pub fn member_role(&self) -> SystemRole {
        match self {
            Self::Finance => SystemRole::FinanceTeam,
            Self::Hr => SystemRole::HrTeam,
        }
    }
}
