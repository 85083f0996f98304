// 🎟️ Registration service - the boundary the HTTP layer and CLI call into

use crate::approval::ApprovalTracker;
use crate::db::{RegistryStore, StatusChange};
use crate::error::{RegistryError, RegistryResult};
use crate::model::{AdminFilter, AdminFilters, AdminRow, GroupStatus, RawArea};
use crate::registrar::{AreaRule, BatchRegistrar};
use crate::sync::SyncHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Body of a registration submission
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub area: RawArea,
    #[serde(default)]
    pub church: String,
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RegisterResponse {
    Success { group_id: String },
    Error { message: String },
}

pub struct RegistrationService {
    store: Arc<RegistryStore>,
    registrar: BatchRegistrar,
    tracker: ApprovalTracker,
}

impl RegistrationService {
    pub fn new(store: Arc<RegistryStore>, sync: SyncHandle, area_rule: AreaRule) -> Self {
        RegistrationService {
            registrar: BatchRegistrar::new(Arc::clone(&store), sync.clone(), area_rule),
            tracker: ApprovalTracker::new(Arc::clone(&store), sync),
            store,
        }
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// Typed registration result; returns the new group id.
    pub fn try_register(
        &self,
        area: &RawArea,
        church: &str,
        names: &[String],
    ) -> RegistryResult<String> {
        self.registrar.register(area, church, names)
    }

    /// Registration in the `{status, group_id | message}` shape callers expect.
    pub fn register(&self, request: &RegisterRequest) -> RegisterResponse {
        match self.try_register(&request.area, &request.church, &request.names) {
            Ok(group_id) => RegisterResponse::Success { group_id },
            Err(e) if e.is_user_error() => {
                warn!(error = %e, "registration rejected");
                RegisterResponse::Error {
                    message: e.to_string(),
                }
            }
            Err(e) => {
                error!(error = %e, "registration failed");
                RegisterResponse::Error {
                    message: "Registration could not be saved. Please try again.".to_string(),
                }
            }
        }
    }

    pub fn approve(&self, full_name: &str) -> RegistryResult<StatusChange> {
        self.tracker.approve(full_name)
    }

    pub fn group_status(&self, group_id: &str) -> RegistryResult<GroupStatus> {
        self.tracker.group_status(group_id)
    }

    pub fn admin_list(&self) -> RegistryResult<Vec<AdminRow>> {
        Ok(self
            .store
            .list_all()?
            .into_iter()
            .map(AdminRow::from)
            .collect())
    }

    pub fn admin_list_filtered(&self, filter: &AdminFilter) -> RegistryResult<Vec<AdminRow>> {
        Ok(self
            .admin_list()?
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect())
    }

    pub fn admin_filters(&self) -> RegistryResult<AdminFilters> {
        Ok(AdminFilters {
            churches: self.store.distinct_churches()?,
            areas: self.store.distinct_areas()?,
        })
    }

    /// Wipe the local store. The mirror is left as is so it can seed a later recovery.
    pub fn erase(&self) -> RegistryResult<usize> {
        let removed = self.store.clear_all()?;
        info!(removed, "registry erased");
        Ok(removed)
    }
}

/// Lets callers turn a not-found approval into their own response without matching on errors.
pub fn is_not_found(err: &RegistryError) -> bool {
    matches!(err, RegistryError::NotFound(_))
}
