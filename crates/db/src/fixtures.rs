use chrono::Utc;
use rust_decimal::Decimal;

use tollgate_core::approvals::hierarchy::{build_hierarchy, HierarchyDraft, LevelDraft};
use tollgate_core::domain::directory::{Center, Department, DirectoryUser};
use tollgate_core::domain::hierarchy::{HierarchyId, SystemRole};
use tollgate_core::domain::UserId;

use crate::connection::DbPool;
use crate::repositories::{
    HierarchyRepository, RepositoryError, SqlApproverDirectory, SqlHierarchyRepository,
};

const SEED_HIERARCHY_ID: &str = "ah-standard-po";

const SEED_USERS: &[SeedUser] = &[
    SeedUser { id: "u-director-north", role: SystemRole::CenterDirector, manager: None },
    SeedUser { id: "u-head-science", role: SystemRole::DepartmentHead, manager: None },
    SeedUser { id: "u-manager-ops", role: SystemRole::Manager, manager: None },
    SeedUser { id: "u-finance-1", role: SystemRole::FinanceTeam, manager: None },
    SeedUser { id: "u-finance-2", role: SystemRole::FinanceTeam, manager: None },
    SeedUser { id: "u-hr-1", role: SystemRole::HrTeam, manager: None },
    SeedUser {
        id: "u-procurement-1",
        role: SystemRole::ProcurementOfficer,
        manager: Some("u-manager-ops"),
    },
    SeedUser { id: "u-teacher-1", role: SystemRole::Teacher, manager: Some("u-manager-ops") },
];

const SEED_DEPARTMENT_ID: &str = "dept-science";
const SEED_CENTER_ID: &str = "center-north";

/// Demo org chart plus the "Standard PO Approval" hierarchy.
///
/// Loading twice leaves the same rows behind: directory rows are upserted and
/// the hierarchy is only inserted when missing.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let directory = SqlApproverDirectory::new(pool.clone());
        directory
            .save_department(&Department {
                id: SEED_DEPARTMENT_ID.to_string(),
                name: "Science".to_string(),
                head_user_id: Some(UserId::new("u-head-science")),
            })
            .await?;
        directory
            .save_center(&Center {
                id: SEED_CENTER_ID.to_string(),
                name: "North campus".to_string(),
                director_user_id: Some(UserId::new("u-director-north")),
            })
            .await?;
        for user in SEED_USERS {
            directory.save_user(&user.to_directory_user()).await?;
        }

        let hierarchies = SqlHierarchyRepository::new(pool.clone());
        let id = HierarchyId(SEED_HIERARCHY_ID.to_string());
        let hierarchy_created = if hierarchies.find_by_id(&id).await?.is_none() {
            let hierarchy = build_hierarchy(id, standard_po_draft(), Utc::now())
                .map_err(|errors| RepositoryError::Decode(format!("seed hierarchy: {errors}")))?;
            hierarchies.insert(hierarchy).await?;
            true
        } else {
            false
        };

        Ok(SeedResult {
            users_seeded: SEED_USERS.len(),
            hierarchy_id: SEED_HIERARCHY_ID,
            hierarchy_created,
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let users: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM directory_user WHERE id IN {}",
            sql_array_from_ids(&SEED_USERS.iter().map(|user| user.id).collect::<Vec<_>>())
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("directory-users", users == SEED_USERS.len() as i64));

        let levels: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM approval_level WHERE hierarchy_id = ?")
                .bind(SEED_HIERARCHY_ID)
                .fetch_one(pool)
                .await?;
        checks.push(("standard-po-levels", levels == 2));

        let default_id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM approval_hierarchy
             WHERE entity_type = 'PURCHASE_ORDER' AND is_active = 1 AND is_default = 1",
        )
        .fetch_optional(pool)
        .await?;
        checks.push(("standard-po-default", default_id.as_deref() == Some(SEED_HIERARCHY_ID)));

        Ok(VerificationResult { all_present: checks.iter().all(|(_, ok)| *ok), checks })
    }

    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;
        let user_ids = sql_array_from_ids(&SEED_USERS.iter().map(|user| user.id).collect::<Vec<_>>());

        sqlx::query("DELETE FROM approval_hierarchy WHERE id = ?")
            .bind(SEED_HIERARCHY_ID)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM directory_user WHERE id IN {user_ids}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM directory_department WHERE id = ?")
            .bind(SEED_DEPARTMENT_ID)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM directory_center WHERE id = ?")
            .bind(SEED_CENTER_ID)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn standard_po_draft() -> HierarchyDraft {
    HierarchyDraft {
        name: "Standard PO Approval".to_string(),
        description: Some("Center director above 10,000, then finance".to_string()),
        entity_type: Some("PURCHASE_ORDER".to_string()),
        is_active: Some(true),
        is_default: true,
        levels: vec![
            LevelDraft {
                level_name: "Center Director".to_string(),
                approver_type: "ROLE_BASED".to_string(),
                approver_role: Some("CENTER_DIRECTOR".to_string()),
                auto_approve_amount: Some(Decimal::new(10_000, 0)),
                timeout_hours: Some(72),
                ..LevelDraft::default()
            },
            LevelDraft {
                level_name: "Finance".to_string(),
                approver_type: "ROLE_BASED".to_string(),
                approver_role: Some("FINANCE_TEAM".to_string()),
                timeout_hours: Some(72),
                ..LevelDraft::default()
            },
        ],
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedUser {
    id: &'static str,
    role: SystemRole,
    manager: Option<&'static str>,
}

impl SeedUser {
    fn to_directory_user(self) -> DirectoryUser {
        DirectoryUser {
            id: UserId::new(self.id),
            display_name: self.id.trim_start_matches("u-").replace('-', " "),
            role: self.role,
            manager_id: self.manager.map(UserId::new),
            department_id: Some(SEED_DEPARTMENT_ID.to_string()),
            center_id: Some(SEED_CENTER_ID.to_string()),
            active: true,
        }
    }
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{}'", id)).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug)]
pub struct SeedResult {
    pub users_seeded: usize,
    pub hierarchy_id: &'static str,
    pub hierarchy_created: bool,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use tollgate_core::approvals::directory::ApproverDirectory;
    use tollgate_core::domain::UserId;

    use super::*;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn seed_is_idempotent_and_verifiable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");

        let first = DemoSeedDataset::load(&pool).await.expect("load");
        assert!(first.hierarchy_created);
        let second = DemoSeedDataset::load(&pool).await.expect("reload");
        assert!(!second.hierarchy_created);

        let verification = DemoSeedDataset::verify(&pool).await.expect("verify");
        assert!(verification.all_present, "{:?}", verification.checks);

        let directory = SqlApproverDirectory::new(pool.clone());
        assert_eq!(
            directory.center_director(&UserId::new("u-procurement-1")).await.expect("director"),
            Some(UserId::new("u-director-north"))
        );
    }

    #[tokio::test]
    async fn clean_removes_seeded_rows() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");

        DemoSeedDataset::load(&pool).await.expect("load");
        DemoSeedDataset::clean(&pool).await.expect("clean");

        let verification = DemoSeedDataset::verify(&pool).await.expect("verify");
        assert!(!verification.all_present);
        assert!(verification.checks.iter().all(|(_, ok)| !ok));
    }
}
