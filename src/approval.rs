// ✅ Approval State Tracker - Pending -> Approved, plus group-level views

use crate::db::{RegistryStore, StatusChange};
use crate::error::RegistryResult;
use crate::model::{GroupStatus, MemberStatus, Status};
use crate::sync::SyncHandle;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ApprovalTracker {
    store: Arc<RegistryStore>,
    sync: SyncHandle,
}

impl ApprovalTracker {
    pub fn new(store: Arc<RegistryStore>, sync: SyncHandle) -> Self {
        ApprovalTracker { store, sync }
    }

    /// Idempotent: approving an approved registrant succeeds without writing.
    /// The name is trimmed the same way registration trims it.
    pub fn approve(&self, full_name: &str) -> RegistryResult<StatusChange> {
        let full_name = full_name.trim();
        let change = self.store.set_status(full_name, Status::Approved)?;

        match change {
            StatusChange::Updated => {
                info!(name = %full_name, "registrant approved");
                self.sync.rows_changed();
                self.sync.status_changed(full_name, Status::Approved);
            }
            StatusChange::Unchanged => debug!(name = %full_name, "already approved"),
        }

        Ok(change)
    }

    /// Members of the group and whether all of them are approved.
    /// An unknown group yields no members and `all_approved = true`.
    pub fn group_status(&self, group_id: &str) -> RegistryResult<GroupStatus> {
        let members = self
            .store
            .list_by_group(group_id)?
            .into_iter()
            .map(|r| MemberStatus {
                name: r.full_name,
                status: r.status,
            })
            .collect();

        Ok(GroupStatus::from_members(group_id, members))
    }
}
