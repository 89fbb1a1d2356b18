use async_trait::async_trait;
use sqlx::Row;

use tollgate_core::approvals::directory::{ApproverDirectory, DirectoryError};
use tollgate_core::domain::directory::{Center, Department, DirectoryUser};
use tollgate_core::domain::hierarchy::SystemRole;
use tollgate_core::domain::UserId;

use super::RepositoryError;
use crate::DbPool;

/// Org chart backed by the local `directory_*` tables.
pub struct SqlApproverDirectory {
    pool: DbPool,
}

impl SqlApproverDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn save_user(&self, user: &DirectoryUser) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO directory_user
                (id, display_name, role, manager_id, department_id, center_id, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                role = excluded.role,
                manager_id = excluded.manager_id,
                department_id = excluded.department_id,
                center_id = excluded.center_id,
                is_active = excluded.is_active",
        )
        .bind(user.id.as_str())
        .bind(&user.display_name)
        .bind(user.role.as_str())
        .bind(user.manager_id.as_ref().map(UserId::as_str))
        .bind(&user.department_id)
        .bind(&user.center_id)
        .bind(user.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_department(&self, department: &Department) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO directory_department (id, name, head_user_id) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                head_user_id = excluded.head_user_id",
        )
        .bind(&department.id)
        .bind(&department.name)
        .bind(department.head_user_id.as_ref().map(UserId::as_str))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_center(&self, center: &Center) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO directory_center (id, name, director_user_id) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                director_user_id = excluded.director_user_id",
        )
        .bind(&center.id)
        .bind(&center.name)
        .bind(center.director_user_id.as_ref().map(UserId::as_str))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_user_via(
        &self,
        query: &str,
        requester_id: &UserId,
    ) -> Result<Option<UserId>, DirectoryError> {
        let row = sqlx::query(query)
            .bind(requester_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(lookup_failed)?;
        row.map(|row| row.try_get::<String, _>("id").map(UserId))
            .transpose()
            .map_err(lookup_failed)
    }
}

fn lookup_failed(error: sqlx::Error) -> DirectoryError {
    DirectoryError::Lookup(error.to_string())
}

#[async_trait]
impl ApproverDirectory for SqlApproverDirectory {
    async fn users_with_role(&self, role: SystemRole) -> Result<Vec<UserId>, DirectoryError> {
        let rows = sqlx::query(
            "SELECT id FROM directory_user WHERE role = ? AND is_active = 1 ORDER BY id ASC",
        )
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(lookup_failed)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map(UserId))
            .collect::<Result<Vec<_>, _>>()
            .map_err(lookup_failed)
    }

    async fn reporting_manager(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        self.active_user_via(
            "SELECT m.id AS id
             FROM directory_user u
             JOIN directory_user m ON m.id = u.manager_id
             WHERE u.id = ? AND m.is_active = 1",
            user_id,
        )
        .await
    }

    async fn department_head(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        self.active_user_via(
            "SELECT h.id AS id
             FROM directory_user u
             JOIN directory_department d ON d.id = u.department_id
             JOIN directory_user h ON h.id = d.head_user_id
             WHERE u.id = ? AND h.is_active = 1",
            user_id,
        )
        .await
    }

    async fn center_director(&self, user_id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        self.active_user_via(
            "SELECT c_dir.id AS id
             FROM directory_user u
             JOIN directory_center c ON c.id = u.center_id
             JOIN directory_user c_dir ON c_dir.id = c.director_user_id
             WHERE u.id = ? AND c_dir.is_active = 1",
            user_id,
        )
        .await
    }
}
