use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::directory::{Center, Department, DirectoryUser, Team};
use crate::domain::hierarchy::SystemRole;
use crate::domain::UserId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("approver directory lookup failed: {0}")]
    Lookup(String),
}

/// Read-only view of the identity service and org chart.
#[async_trait]
pub trait ApproverDirectory: Send + Sync {
    /// Active users holding `role`.
    async fn users_with_role(&self, role: SystemRole) -> Result<Vec<UserId>, DirectoryError>;

    async fn reporting_manager(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError>;

    async fn department_head(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError>;

    async fn center_director(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError>;

    async fn team_members(&self, team: Team) -> Result<Vec<UserId>, DirectoryError> {
        self.users_with_role(team.member_role()).await
    }
}

#[async_trait]
impl<T> ApproverDirectory for Arc<T>
where
    T: ApproverDirectory + ?Sized,
{
    async fn users_with_role(&self, role: SystemRole) -> Result<Vec<UserId>, DirectoryError> {
        (**self).users_with_role(role).await
    }

    async fn reporting_manager(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        (**self).reporting_manager(user_id).await
    }

    async fn department_head(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        (**self).department_head(user_id).await
    }

    async fn center_director(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        (**self).center_director(user_id).await
    }

    async fn team_members(&self, team: Team) -> Result<Vec<UserId>, DirectoryError> {
        (**self).team_members(team).await
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryApproverDirectory {
    users: HashMap<UserId, DirectoryUser>,
    departments: HashMap<String, Department>,
    centers: HashMap<String, Center>,
}

impl InMemoryApproverDirectory {
    pub fn with_user(mut self, user: DirectoryUser) -> Self {
        self.users.insert(user.id.clone(), user);
        self
    }

    pub fn with_department(mut self, department: Department) -> Self {
        self.departments.insert(department.id.clone(), department);
        self
    }

    pub fn with_center(mut self, center: Center) -> Self {
        self.centers.insert(center.id.clone(), center);
        self
    }

    fn active_user(&self, user_id: &UserId) -> Option<&DirectoryUser> {
        self.users.get(user_id).filter(|user| user.active)
    }

    fn keep_active(&self, user_id: Option<&UserId>) -> Option<UserId> {
        user_id.and_then(|id| self.active_user(id)).map(|user| user.id.clone())
    }
}

#[async_trait]
impl ApproverDirectory for InMemoryApproverDirectory {
    async fn users_with_role(&self, role: SystemRole) -> Result<Vec<UserId>, DirectoryError> {
        let mut users: Vec<UserId> = self
            .users
            .values()
            .filter(|user| user.active && user.role == role)
            .map(|user| user.id.clone())
            .collect();
        users.sort();
        Ok(users)
    }

    async fn reporting_manager(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        let manager = self.users.get(user_id).and_then(|user| user.manager_id.as_ref());
        Ok(self.keep_active(manager))
    }

    async fn department_head(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        let head = self
            .users
            .get(user_id)
            .and_then(|user| user.department_id.as_ref())
            .and_then(|department_id| self.departments.get(department_id))
            .and_then(|department| department.head_user_id.as_ref());
        Ok(self.keep_active(head))
    }

    async fn center_director(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        let director = self
            .users
            .get(user_id)
            .and_then(|user| user.center_id.as_ref())
            .and_then(|center_id| self.centers.get(center_id))
            .and_then(|center| center.director_user_id.as_ref());
        Ok(self.keep_active(director))
    }
}
