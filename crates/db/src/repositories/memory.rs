use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;

use tollgate_core::domain::hierarchy::{
    ApprovalHierarchy, EntityType, HierarchyFilter, HierarchyId, HierarchySummary,
};
use tollgate_core::domain::request::{
    ApprovalRequest, ApprovalRequestId, RequestFilter, RequestStatus, RequestTransition,
};

use super::{ApprovalRequestRepository, HierarchyRepository, RepositoryError};

/// Both repositories over shared maps, so hierarchy deletes can see live
/// requests. Locks are always taken hierarchies first.
#[derive(Default)]
pub struct InMemoryApprovalStore {
    hierarchies: RwLock<HashMap<String, ApprovalHierarchy>>,
    requests: RwLock<BTreeMap<String, ApprovalRequest>>,
    transitions: RwLock<HashMap<String, Vec<RequestTransition>>>,
}

impl InMemoryApprovalStore {
    fn clear_competing_defaults(
        hierarchies: &mut HashMap<String, ApprovalHierarchy>,
        winner: &ApprovalHierarchy,
    ) {
        if !winner.is_active_default() {
            return;
        }
        for other in hierarchies.values_mut() {
            if other.id != winner.id && other.entity_type == winner.entity_type && other.is_default
            {
                other.is_default = false;
                other.updated_at = winner.updated_at;
            }
        }
    }
}

#[async_trait::async_trait]
impl HierarchyRepository for InMemoryApprovalStore {
    async fn find_by_id(
        &self,
        id: &HierarchyId,
    ) -> Result<Option<ApprovalHierarchy>, RepositoryError> {
        let hierarchies = self.hierarchies.read().await;
        Ok(hierarchies.get(&id.0).cloned())
    }

    async fn find_active_default(
        &self,
        entity_type: EntityType,
    ) -> Result<Option<ApprovalHierarchy>, RepositoryError> {
        let hierarchies = self.hierarchies.read().await;
        Ok(hierarchies
            .values()
            .find(|hierarchy| hierarchy.entity_type == entity_type && hierarchy.is_active_default())
            .cloned())
    }

    async fn list(
        &self,
        filter: &HierarchyFilter,
    ) -> Result<Vec<HierarchySummary>, RepositoryError> {
        let hierarchies = self.hierarchies.read().await;
        let requests = self.requests.read().await;

        let mut listed: Vec<HierarchySummary> = hierarchies
            .values()
            .filter(|hierarchy| filter.matches(hierarchy))
            .map(|hierarchy| HierarchySummary {
                hierarchy: hierarchy.clone(),
                request_count: requests
                    .values()
                    .filter(|request| request.hierarchy_id == hierarchy.id)
                    .count() as u64,
            })
            .collect();
        listed.sort_by(|a, b| {
            a.hierarchy
                .name
                .cmp(&b.hierarchy.name)
                .then_with(|| a.hierarchy.id.0.cmp(&b.hierarchy.id.0))
        });
        Ok(listed)
    }

    async fn insert(&self, hierarchy: ApprovalHierarchy) -> Result<(), RepositoryError> {
        let mut hierarchies = self.hierarchies.write().await;
        if hierarchies.contains_key(&hierarchy.id.0) {
            return Err(RepositoryError::Conflict(format!(
                "approval hierarchy `{}` already exists",
                hierarchy.id
            )));
        }
        Self::clear_competing_defaults(&mut hierarchies, &hierarchy);
        hierarchies.insert(hierarchy.id.0.clone(), hierarchy);
        Ok(())
    }

    async fn update(&self, hierarchy: ApprovalHierarchy) -> Result<(), RepositoryError> {
        let mut hierarchies = self.hierarchies.write().await;
        let Some(stored) = hierarchies.get(&hierarchy.id.0) else {
            return Err(RepositoryError::NotFound {
                entity: "approval hierarchy",
                id: hierarchy.id.0.clone(),
            });
        };
        if stored.version.saturating_add(1) != hierarchy.version {
            return Err(RepositoryError::Conflict(format!(
                "approval hierarchy `{}` was modified concurrently",
                hierarchy.id
            )));
        }
        Self::clear_competing_defaults(&mut hierarchies, &hierarchy);
        hierarchies.insert(hierarchy.id.0.clone(), hierarchy);
        Ok(())
    }

    async fn delete(&self, id: &HierarchyId) -> Result<(), RepositoryError> {
        let mut hierarchies = self.hierarchies.write().await;
        let requests = self.requests.read().await;

        let live = requests
            .values()
            .filter(|request| &request.hierarchy_id == id && !request.is_terminal())
            .count();
        if live > 0 {
            return Err(RepositoryError::Conflict(format!(
                "approval hierarchy `{id}` has {live} request(s) still awaiting decisions"
            )));
        }
        match hierarchies.remove(&id.0) {
            Some(_) => Ok(()),
            None => Err(RepositoryError::NotFound { entity: "approval hierarchy", id: id.0.clone() }),
        }
    }
}

#[async_trait::async_trait]
impl ApprovalRequestRepository for InMemoryApprovalStore {
    async fn find_by_id(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).cloned())
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        let mut listed: Vec<ApprovalRequest> =
            requests.values().filter(|request| filter.matches(request)).cloned().collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(listed)
    }

    async fn list_in_progress(
        &self,
        after: Option<&ApprovalRequestId>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|request| request.status == RequestStatus::InProgress)
            .filter(|request| after.map_or(true, |after| request.id.0 > after.0))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn insert(
        &self,
        request: ApprovalRequest,
        transitions: Vec<RequestTransition>,
    ) -> Result<(), RepositoryError> {
        let hierarchies = self.hierarchies.read().await;
        if !hierarchies.contains_key(&request.hierarchy_id.0) {
            return Err(RepositoryError::NotFound {
                entity: "approval hierarchy",
                id: request.hierarchy_id.0.clone(),
            });
        }
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id.0) {
            return Err(RepositoryError::Conflict(format!(
                "approval request `{}` already exists",
                request.id
            )));
        }
        let mut history = self.transitions.write().await;
        history.entry(request.id.0.clone()).or_default().extend(transitions);
        requests.insert(request.id.0.clone(), request);
        Ok(())
    }

    async fn update(
        &self,
        request: ApprovalRequest,
        expected_state_version: u32,
        transitions: Vec<RequestTransition>,
    ) -> Result<(), RepositoryError> {
        let mut requests = self.requests.write().await;
        let Some(stored) = requests.get(&request.id.0) else {
            return Err(RepositoryError::NotFound {
                entity: "approval request",
                id: request.id.0.clone(),
            });
        };
        if stored.state_version != expected_state_version {
            return Err(RepositoryError::Conflict(format!(
                "approval request `{}` is at state version {}, expected {expected_state_version}",
                request.id, stored.state_version
            )));
        }
        let mut history = self.transitions.write().await;
        history.entry(request.id.0.clone()).or_default().extend(transitions);
        requests.insert(request.id.0.clone(), request);
        Ok(())
    }

    async fn list_transitions(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Vec<RequestTransition>, RepositoryError> {
        let history = self.transitions.read().await;
        let mut transitions = history.get(&id.0).cloned().unwrap_or_default();
        transitions.sort_by_key(|transition| transition.state_version);
        Ok(transitions)
    }
}
