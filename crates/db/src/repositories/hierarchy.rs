use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};

use tollgate_core::domain::hierarchy::{
    ApprovalHierarchy, ApprovalLevel, ApproverRule, ApproverType, EntityType, HierarchyFilter,
    HierarchyId, HierarchySummary, SystemRole,
};
use tollgate_core::domain::UserId;

use super::{parse_optional_u32, parse_timestamp, parse_u32, HierarchyRepository, RepositoryError};
use crate::DbPool;

const HIERARCHY_COLUMNS: &str =
    "id, name, description, entity_type, is_active, is_default, version, created_at, updated_at";

const LEVEL_COLUMNS: &str = "hierarchy_id, level_number, level_name, description, approver_type,
    approver_role, specific_approvers_json, min_approvals, requires_all, auto_approve_amount,
    timeout_hours, is_active";

const LIVE_STATUSES: &str = "('PENDING', 'IN_PROGRESS')";

pub struct SqlHierarchyRepository {
    pool: DbPool,
}

impl SqlHierarchyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Levels for every hierarchy in `ids`, in one query.
    async fn load_levels(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<ApprovalLevel>>, RepositoryError> {
        let mut by_hierarchy: HashMap<String, Vec<ApprovalLevel>> = HashMap::new();
        if ids.is_empty() {
            return Ok(by_hierarchy);
        }

        let rows = sqlx::query(&format!(
            "SELECT {LEVEL_COLUMNS} FROM approval_level
             WHERE hierarchy_id IN (SELECT value FROM json_each(?))
             ORDER BY hierarchy_id ASC, level_number ASC"
        ))
        .bind(serde_json::to_string(ids)?)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let hierarchy_id: String = row.try_get("hierarchy_id")?;
            by_hierarchy.entry(hierarchy_id).or_default().push(level_from_row(row)?);
        }
        Ok(by_hierarchy)
    }

    async fn hydrate(&self, rows: Vec<SqliteRow>) -> Result<Vec<ApprovalHierarchy>, RepositoryError> {
        let ids: Vec<String> =
            rows.iter().map(|row| row.try_get::<String, _>("id")).collect::<Result<_, _>>()?;
        let mut levels = self.load_levels(&ids).await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                hierarchy_from_row(row, levels.remove(&id).unwrap_or_default())
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl HierarchyRepository for SqlHierarchyRepository {
    async fn find_by_id(
        &self,
        id: &HierarchyId,
    ) -> Result<Option<ApprovalHierarchy>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {HIERARCHY_COLUMNS} FROM approval_hierarchy WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_active_default(
        &self,
        entity_type: EntityType,
    ) -> Result<Option<ApprovalHierarchy>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {HIERARCHY_COLUMNS} FROM approval_hierarchy
             WHERE entity_type = ? AND is_active = 1 AND is_default = 1"
        ))
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        filter: &HierarchyFilter,
    ) -> Result<Vec<HierarchySummary>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {HIERARCHY_COLUMNS},
                    (SELECT COUNT(*) FROM approval_request r WHERE r.hierarchy_id = h.id)
                        AS request_count
             FROM approval_hierarchy h
             WHERE (?1 IS NULL OR entity_type = ?1)
               AND (?2 IS NULL OR is_active = ?2)
             ORDER BY name ASC, id ASC"
        ))
        .bind(filter.entity_type.map(|entity_type| entity_type.as_str()))
        .bind(filter.is_active)
        .fetch_all(&self.pool)
        .await?;

        let counts = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("request_count"))
            .collect::<Result<Vec<_>, _>>()?;
        let hierarchies = self.hydrate(rows).await?;

        Ok(hierarchies
            .into_iter()
            .zip(counts)
            .map(|(hierarchy, count)| HierarchySummary {
                hierarchy,
                request_count: u64::try_from(count).unwrap_or_default(),
            })
            .collect())
    }

    async fn insert(&self, hierarchy: ApprovalHierarchy) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        clear_competing_defaults(&mut tx, &hierarchy).await?;

        sqlx::query(
            "INSERT INTO approval_hierarchy
                (id, name, description, entity_type, is_active, is_default, version,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&hierarchy.id.0)
        .bind(&hierarchy.name)
        .bind(&hierarchy.description)
        .bind(hierarchy.entity_type.as_str())
        .bind(hierarchy.is_active)
        .bind(hierarchy.is_default)
        .bind(i64::from(hierarchy.version))
        .bind(hierarchy.created_at.to_rfc3339())
        .bind(hierarchy.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|error| {
            RepositoryError::from_write(error, || {
                format!("approval hierarchy `{}` already exists", hierarchy.id)
            })
        })?;

        insert_levels(&mut tx, &hierarchy).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, hierarchy: ApprovalHierarchy) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        clear_competing_defaults(&mut tx, &hierarchy).await?;

        let updated = sqlx::query(
            "UPDATE approval_hierarchy
             SET name = ?, description = ?, entity_type = ?, is_active = ?, is_default = ?,
                 version = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&hierarchy.name)
        .bind(&hierarchy.description)
        .bind(hierarchy.entity_type.as_str())
        .bind(hierarchy.is_active)
        .bind(hierarchy.is_default)
        .bind(i64::from(hierarchy.version))
        .bind(hierarchy.updated_at.to_rfc3339())
        .bind(&hierarchy.id.0)
        .bind(i64::from(hierarchy.version.saturating_sub(1)))
        .execute(&mut *tx)
        .await
        .map_err(|error| {
            RepositoryError::from_write(error, || {
                format!("approval hierarchy `{}` collides with another default", hierarchy.id)
            })
        })?;

        if updated.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM approval_hierarchy WHERE id = ?")
                .bind(&hierarchy.id.0)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            return Err(if exists {
                RepositoryError::Conflict(format!(
                    "approval hierarchy `{}` was modified concurrently",
                    hierarchy.id
                ))
            } else {
                RepositoryError::NotFound { entity: "approval hierarchy", id: hierarchy.id.0 }
            });
        }

        sqlx::query("DELETE FROM approval_level WHERE hierarchy_id = ?")
            .bind(&hierarchy.id.0)
            .execute(&mut *tx)
            .await?;
        insert_levels(&mut tx, &hierarchy).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, id: &HierarchyId) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // guarded delete; request inserts check for the hierarchy the same way
        let deleted = sqlx::query(&format!(
            "DELETE FROM approval_hierarchy
             WHERE id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM approval_request
                   WHERE hierarchy_id = ?1 AND status IN {LIVE_STATUSES}
               )"
        ))
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            let live: i64 = sqlx::query(&format!(
                "SELECT COUNT(*) AS count FROM approval_request
                 WHERE hierarchy_id = ? AND status IN {LIVE_STATUSES}"
            ))
            .bind(&id.0)
            .fetch_one(&mut *tx)
            .await?
            .try_get("count")?;
            return Err(if live > 0 {
                RepositoryError::Conflict(format!(
                    "approval hierarchy `{id}` has {live} request(s) still awaiting decisions"
                ))
            } else {
                RepositoryError::NotFound { entity: "approval hierarchy", id: id.0.clone() }
            });
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn clear_competing_defaults(
    tx: &mut Transaction<'_, Sqlite>,
    hierarchy: &ApprovalHierarchy,
) -> Result<(), RepositoryError> {
    if !hierarchy.is_active_default() {
        return Ok(());
    }
    sqlx::query(
        "UPDATE approval_hierarchy SET is_default = 0, updated_at = ?
         WHERE entity_type = ? AND id <> ? AND is_default = 1",
    )
    .bind(hierarchy.updated_at.to_rfc3339())
    .bind(hierarchy.entity_type.as_str())
    .bind(&hierarchy.id.0)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_levels(
    tx: &mut Transaction<'_, Sqlite>,
    hierarchy: &ApprovalHierarchy,
) -> Result<(), RepositoryError> {
    for level in &hierarchy.levels {
        let specific: Vec<&str> = level
            .approver
            .specific_users()
            .map(|users| users.iter().map(UserId::as_str).collect())
            .unwrap_or_default();

        sqlx::query(&format!(
            "INSERT INTO approval_level ({LEVEL_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&hierarchy.id.0)
        .bind(i64::from(level.level_number))
        .bind(&level.level_name)
        .bind(&level.description)
        .bind(level.approver.approver_type().as_str())
        .bind(level.approver.role().map(|role| role.as_str()))
        .bind(serde_json::to_string(&specific)?)
        .bind(i64::from(level.min_approvals))
        .bind(level.requires_all)
        .bind(level.auto_approve_amount.map(|amount| amount.to_string()))
        .bind(level.timeout_hours.map(i64::from))
        .bind(level.is_active)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn hierarchy_from_row(
    row: &SqliteRow,
    levels: Vec<ApprovalLevel>,
) -> Result<ApprovalHierarchy, RepositoryError> {
    let entity_type_raw = row.try_get::<String, _>("entity_type")?;
    let entity_type = EntityType::parse(&entity_type_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown entity type `{entity_type_raw}`"))
    })?;

    Ok(ApprovalHierarchy {
        id: HierarchyId(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        entity_type,
        is_active: row.try_get("is_active")?,
        is_default: row.try_get("is_default")?,
        version: parse_u32("version", row.try_get("version")?)?,
        levels,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn level_from_row(row: &SqliteRow) -> Result<ApprovalLevel, RepositoryError> {
    let type_raw = row.try_get::<String, _>("approver_type")?;
    let approver_type = ApproverType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approver type `{type_raw}`")))?;

    let approver = match approver_type {
        ApproverType::RoleBased => {
            let role_raw = row.try_get::<Option<String>, _>("approver_role")?.unwrap_or_default();
            let role = SystemRole::parse(&role_raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown approver role `{role_raw}`"))
            })?;
            ApproverRule::RoleBased { role }
        }
        ApproverType::SpecificUsers => {
            let raw: String = row.try_get("specific_approvers_json")?;
            let ids: Vec<String> = serde_json::from_str(&raw)?;
            ApproverRule::SpecificUsers {
                user_ids: ids.into_iter().map(UserId).collect::<BTreeSet<_>>(),
            }
        }
        ApproverType::ReportingManager => ApproverRule::ReportingManager,
        ApproverType::DepartmentHead => ApproverRule::DepartmentHead,
        ApproverType::CenterDirector => ApproverRule::CenterDirector,
        ApproverType::FinanceTeam => ApproverRule::FinanceTeam,
        ApproverType::HrTeam => ApproverRule::HrTeam,
    };

    let auto_approve_amount = row
        .try_get::<Option<String>, _>("auto_approve_amount")?
        .map(|raw| {
            Decimal::from_str(&raw).map_err(|error| {
                RepositoryError::Decode(format!("invalid auto_approve_amount `{raw}` ({error})"))
            })
        })
        .transpose()?;

    Ok(ApprovalLevel {
        level_number: parse_u32("level_number", row.try_get("level_number")?)?,
        level_name: row.try_get("level_name")?,
        description: row.try_get("description")?,
        approver,
        min_approvals: parse_u32("min_approvals", row.try_get("min_approvals")?)?,
        requires_all: row.try_get("requires_all")?,
        auto_approve_amount,
        timeout_hours: parse_optional_u32("timeout_hours", row.try_get("timeout_hours")?)?,
        is_active: row.try_get("is_active")?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use tollgate_core::approvals::hierarchy::{build_hierarchy, HierarchyDraft, LevelDraft};
    use tollgate_core::domain::hierarchy::{
        ApprovalHierarchy, ApproverRule, EntityType, HierarchyFilter, HierarchyId,
    };

    use super::SqlHierarchyRepository;
    use crate::repositories::{HierarchyRepository, RepositoryError};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn budget_hierarchy(id: &str, name: &str, is_default: bool) -> ApprovalHierarchy {
        build_hierarchy(
            HierarchyId(id.to_string()),
            HierarchyDraft {
                name: name.to_string(),
                entity_type: Some("BUDGET".to_string()),
                is_default,
                levels: vec![
                    LevelDraft {
                        level_name: "Department head".to_string(),
                        approver_type: "DEPARTMENT_HEAD".to_string(),
                        auto_approve_amount: Some(Decimal::new(250_050, 2)),
                        timeout_hours: Some(48),
                        ..LevelDraft::default()
                    },
                    LevelDraft {
                        level_name: "Board".to_string(),
                        approver_type: "SPECIFIC_USERS".to_string(),
                        specific_approvers: vec!["u-b1".to_string(), "u-b2".to_string()],
                        requires_all: true,
                        ..LevelDraft::default()
                    },
                ],
                ..HierarchyDraft::default()
            },
            Utc::now(),
        )
        .expect("valid hierarchy")
    }

    #[tokio::test]
    async fn insert_and_find_round_trips_levels() {
        let repo = SqlHierarchyRepository::new(setup().await);
        let hierarchy = budget_hierarchy("H-1", "Budget", false);

        repo.insert(hierarchy.clone()).await.expect("insert");
        let found = repo
            .find_by_id(&HierarchyId("H-1".to_string()))
            .await
            .expect("find")
            .expect("should exist");

        assert_eq!(found.levels.len(), 2);
        assert_eq!(found.levels[0].auto_approve_amount, Some(Decimal::new(250_050, 2)));
        assert_eq!(found.levels[0].timeout_hours, Some(48));
        assert!(matches!(
            &found.levels[1].approver,
            ApproverRule::SpecificUsers { user_ids } if user_ids.len() == 2
        ));
        assert!(found.levels[1].requires_all);
    }

    #[tokio::test]
    async fn new_default_clears_the_previous_one() {
        let repo = SqlHierarchyRepository::new(setup().await);
        repo.insert(budget_hierarchy("H-A", "Budget A", true)).await.expect("insert A");
        repo.insert(budget_hierarchy("H-B", "Budget B", true)).await.expect("insert B");

        let a = repo.find_by_id(&HierarchyId("H-A".to_string())).await.expect("find A");
        let default =
            repo.find_active_default(EntityType::Budget).await.expect("default").expect("one");

        assert_eq!(a.map(|hierarchy| hierarchy.is_default), Some(false));
        assert_eq!(default.id.0, "H-B");
    }

    #[tokio::test]
    async fn stale_version_update_is_a_conflict() {
        let repo = SqlHierarchyRepository::new(setup().await);
        let hierarchy = budget_hierarchy("H-1", "Budget", false);
        repo.insert(hierarchy.clone()).await.expect("insert");

        let mut next = hierarchy.clone();
        next.version = 2;
        next.name = "Budget v2".to_string();
        repo.update(next.clone()).await.expect("first update");

        let error = repo.update(next).await.expect_err("same version twice");
        assert!(matches!(error, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_filters_and_orders_by_name_with_request_counts() {
        let pool = setup().await;
        let repo = SqlHierarchyRepository::new(pool.clone());
        repo.insert(budget_hierarchy("H-2", "Zeta budget", false)).await.expect("insert");
        repo.insert(budget_hierarchy("H-1", "Alpha budget", false)).await.expect("insert");

        sqlx::query(
            "INSERT INTO approval_request
                (id, hierarchy_id, hierarchy_version, entity_type, entity_id, amount, requester_id,
                 status, rejection_policy, levels_json, state_version, created_at, updated_at)
             VALUES ('APR-1', 'H-2', 1, 'BUDGET', 'B-1', '10', 'u-1', 'APPROVED', 'VETO', '[]', 3,
                     '2026-03-01T00:00:00Z', '2026-03-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert request");

        let listed = repo
            .list(&HierarchyFilter { entity_type: Some(EntityType::Budget), is_active: Some(true) })
            .await
            .expect("list");
        let names: Vec<&str> = listed.iter().map(|summary| summary.hierarchy.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha budget", "Zeta budget"]);
        assert_eq!(listed[1].request_count, 1);
        for summary in &listed {
            let numbers: Vec<u32> =
                summary.hierarchy.levels.iter().map(|level| level.level_number).collect();
            assert_eq!(numbers, vec![1, 2], "levels of {}", summary.hierarchy.id);
        }

        let none = repo
            .list(&HierarchyFilter { entity_type: Some(EntityType::Payment), is_active: None })
            .await
            .expect("list");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn delete_is_blocked_by_live_requests_only() {
        let pool = setup().await;
        let repo = SqlHierarchyRepository::new(pool.clone());
        repo.insert(budget_hierarchy("H-1", "Budget", false)).await.expect("insert");

        sqlx::query(
            "INSERT INTO approval_request
                (id, hierarchy_id, hierarchy_version, entity_type, entity_id, amount, requester_id,
                 status, rejection_policy, levels_json, state_version, created_at, updated_at)
             VALUES ('APR-1', 'H-1', 1, 'BUDGET', 'B-1', '10', 'u-1', 'IN_PROGRESS', 'VETO', '[]', 2,
                     '2026-03-01T00:00:00Z', '2026-03-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert request");

        let id = HierarchyId("H-1".to_string());
        let error = repo.delete(&id).await.expect_err("live request blocks delete");
        assert!(matches!(error, RepositoryError::Conflict(_)));

        sqlx::query("UPDATE approval_request SET status = 'REJECTED' WHERE id = 'APR-1'")
            .execute(&pool)
            .await
            .expect("finish request");
        repo.delete(&id).await.expect("delete after terminal");

        let level_rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM approval_level WHERE hierarchy_id = 'H-1'")
                .fetch_one(&pool)
                .await
                .expect("count levels");
        assert_eq!(level_rows, 0);
        assert!(matches!(
            repo.delete(&id).await,
            Err(RepositoryError::NotFound { .. })
        ));
    }
}
