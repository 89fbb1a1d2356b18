use std::str::FromStr;

use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};

use tollgate_core::domain::hierarchy::{EntityType, HierarchyId};
use tollgate_core::domain::request::{
    ApprovalRequest, ApprovalRequestId, EntityRef, LevelProgress, RejectionPolicy, RequestFilter,
    RequestStatus, RequestTransition, RequestTransitionId, TransitionReason,
};
use tollgate_core::domain::UserId;

use super::{
    parse_optional_timestamp, parse_optional_u32, parse_timestamp, parse_u32,
    ApprovalRequestRepository, RepositoryError,
};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, hierarchy_id, hierarchy_version, entity_type, entity_id, amount,
    requester_id, status, current_level, level_entered_at, rejection_policy, levels_json,
    state_version, created_at, updated_at, completed_at";

pub struct SqlApprovalRequestRepository {
    pool: DbPool,
}

impl SqlApprovalRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ApprovalRequestRepository for SqlApprovalRequestRepository {
    async fn find_by_id(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM approval_request WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        // ?3 matches approvers at the current level who have not decided yet
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request r
             WHERE (?1 IS NULL OR r.status = ?1)
               AND (?2 IS NULL OR r.hierarchy_id = ?2)
               AND (?3 IS NULL OR (
                   r.status = 'IN_PROGRESS'
                   AND EXISTS (
                       SELECT 1
                       FROM json_each(r.levels_json) AS lvl,
                            json_each(lvl.value, '$.eligibleApprovers') AS eligible
                       WHERE json_extract(lvl.value, '$.levelNumber') = r.current_level
                         AND eligible.value = ?3
                         AND NOT EXISTS (
                             SELECT 1 FROM json_each(lvl.value, '$.decisions') AS decided
                             WHERE json_extract(decided.value, '$.approverId') = ?3
                         )
                   )
               ))
             ORDER BY r.created_at ASC, r.id ASC"
        ))
        .bind(filter.status.map(|status| status.as_str()))
        .bind(filter.hierarchy_id.as_ref().map(|id| id.0.as_str()))
        .bind(filter.approver_id.as_ref().map(|id| id.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(request_from_row).collect()
    }

    async fn list_in_progress(
        &self,
        after: Option<&ApprovalRequestId>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request
             WHERE status = 'IN_PROGRESS' AND (?1 IS NULL OR id > ?1)
             ORDER BY id ASC
             LIMIT ?2"
        ))
        .bind(after.map(|id| id.0.as_str()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(request_from_row).collect()
    }

    async fn insert(
        &self,
        request: ApprovalRequest,
        transitions: Vec<RequestTransition>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // the hierarchy check and the write are one statement, so a
        // concurrent hierarchy delete either sees this row or blocks it
        let inserted = sqlx::query(&format!(
            "INSERT INTO approval_request ({REQUEST_COLUMNS})
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
             WHERE EXISTS (SELECT 1 FROM approval_hierarchy WHERE id = ?)"
        ))
        .bind(&request.id.0)
        .bind(&request.hierarchy_id.0)
        .bind(i64::from(request.hierarchy_version))
        .bind(request.entity.entity_type.as_str())
        .bind(&request.entity.entity_id)
        .bind(request.entity.amount.to_string())
        .bind(request.entity.requester_id.as_str())
        .bind(request.status.as_str())
        .bind(request.current_level.map(i64::from))
        .bind(request.level_entered_at.map(|at| at.to_rfc3339()))
        .bind(request.rejection_policy.as_str())
        .bind(serde_json::to_string(&request.levels)?)
        .bind(i64::from(request.state_version))
        .bind(request.created_at.to_rfc3339())
        .bind(request.updated_at.to_rfc3339())
        .bind(request.completed_at.map(|at| at.to_rfc3339()))
        .bind(&request.hierarchy_id.0)
        .execute(&mut *tx)
        .await
        .map_err(|error| {
            RepositoryError::from_write(error, || {
                format!("approval request `{}` already exists", request.id)
            })
        })?;
        if inserted.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "approval hierarchy",
                id: request.hierarchy_id.0.clone(),
            });
        }

        insert_transitions(&mut tx, &transitions).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update(
        &self,
        request: ApprovalRequest,
        expected_state_version: u32,
        transitions: Vec<RequestTransition>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE approval_request
             SET status = ?, current_level = ?, level_entered_at = ?, levels_json = ?,
                 state_version = ?, updated_at = ?, completed_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(request.status.as_str())
        .bind(request.current_level.map(i64::from))
        .bind(request.level_entered_at.map(|at| at.to_rfc3339()))
        .bind(serde_json::to_string(&request.levels)?)
        .bind(i64::from(request.state_version))
        .bind(request.updated_at.to_rfc3339())
        .bind(request.completed_at.map(|at| at.to_rfc3339()))
        .bind(&request.id.0)
        .bind(i64::from(expected_state_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT state_version FROM approval_request WHERE id = ?")
                    .bind(&request.id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match current {
                Some(current) => RepositoryError::Conflict(format!(
                    "approval request `{}` is at state version {current}, expected {expected_state_version}",
                    request.id
                )),
                None => RepositoryError::NotFound {
                    entity: "approval request",
                    id: request.id.0.clone(),
                },
            });
        }

        insert_transitions(&mut tx, &transitions).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_transitions(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Vec<RequestTransition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, request_id, from_status, to_status, level_number, reason, actor_id,
                    context_json, state_version, occurred_at
             FROM approval_request_transition
             WHERE request_id = ?
             ORDER BY state_version ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transition_from_row).collect()
    }
}

async fn insert_transitions(
    tx: &mut Transaction<'_, Sqlite>,
    transitions: &[RequestTransition],
) -> Result<(), RepositoryError> {
    for transition in transitions {
        sqlx::query(
            "INSERT INTO approval_request_transition
                (id, request_id, from_status, to_status, level_number, reason, actor_id,
                 context_json, state_version, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transition.id.0)
        .bind(&transition.request_id.0)
        .bind(transition.from_status.map(|status| status.as_str()))
        .bind(transition.to_status.as_str())
        .bind(transition.level_number.map(i64::from))
        .bind(transition.reason.as_str())
        .bind(&transition.actor_id)
        .bind(&transition.context_json)
        .bind(i64::from(transition.state_version))
        .bind(transition.occurred_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn parse_status(column: &str, raw: &str) -> Result<RequestStatus, RepositoryError> {
    RequestStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown status in `{column}`: `{raw}`")))
}

fn request_from_row(row: &SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let entity_type_raw: String = row.try_get("entity_type")?;
    let entity_type = EntityType::parse(&entity_type_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown entity type `{entity_type_raw}`"))
    })?;
    let amount_raw: String = row.try_get("amount")?;
    let amount = Decimal::from_str(&amount_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid amount `{amount_raw}` ({error})"))
    })?;
    let policy_raw: String = row.try_get("rejection_policy")?;
    let rejection_policy = RejectionPolicy::parse(&policy_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown rejection policy `{policy_raw}`"))
    })?;
    let levels_raw: String = row.try_get("levels_json")?;
    let levels: Vec<LevelProgress> = serde_json::from_str(&levels_raw)?;

    Ok(ApprovalRequest {
        id: ApprovalRequestId(row.try_get("id")?),
        hierarchy_id: HierarchyId(row.try_get("hierarchy_id")?),
        hierarchy_version: parse_u32("hierarchy_version", row.try_get("hierarchy_version")?)?,
        entity: EntityRef {
            entity_type,
            entity_id: row.try_get("entity_id")?,
            amount,
            requester_id: UserId(row.try_get("requester_id")?),
        },
        status: parse_status("status", &row.try_get::<String, _>("status")?)?,
        current_level: parse_optional_u32("current_level", row.try_get("current_level")?)?,
        level_entered_at: parse_optional_timestamp(
            "level_entered_at",
            row.try_get("level_entered_at")?,
        )?,
        levels,
        rejection_policy,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

fn transition_from_row(row: &SqliteRow) -> Result<RequestTransition, RepositoryError> {
    let from_status = row
        .try_get::<Option<String>, _>("from_status")?
        .map(|raw| parse_status("from_status", &raw))
        .transpose()?;
    let reason_raw: String = row.try_get("reason")?;
    let reason = TransitionReason::parse(&reason_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown transition reason `{reason_raw}`"))
    })?;

    Ok(RequestTransition {
        id: RequestTransitionId(row.try_get("id")?),
        request_id: ApprovalRequestId(row.try_get("request_id")?),
        from_status,
        to_status: parse_status("to_status", &row.try_get::<String, _>("to_status")?)?,
        level_number: parse_optional_u32("level_number", row.try_get("level_number")?)?,
        reason,
        actor_id: row.try_get("actor_id")?,
        context_json: row.try_get("context_json")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
