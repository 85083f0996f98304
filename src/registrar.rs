// 📝 Batch Registrar - admits a list of names as one all-or-nothing group

use crate::config::ValidationConfig;
use crate::db::RegistryStore;
use crate::error::{RegistryError, RegistryResult};
use crate::model::{new_group_id, RawArea, Registrant};
use crate::sync::SyncHandle;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

// ============================================================================
// VALIDATION
// ============================================================================

/// Which areas are accepted. Some deployments use 1..=7, others any integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaRule {
    pub enforce_range: bool,
    pub min: i64,
    pub max: i64,
}

impl AreaRule {
    pub fn range(min: i64, max: i64) -> Self {
        AreaRule {
            enforce_range: true,
            min,
            max,
        }
    }

    pub fn any() -> Self {
        AreaRule {
            enforce_range: false,
            min: i64::MIN,
            max: i64::MAX,
        }
    }

    pub fn from_config(config: &ValidationConfig) -> Self {
        AreaRule {
            enforce_range: config.enforce_area_range,
            min: config.area_min,
            max: config.area_max,
        }
    }

    pub fn check(&self, raw: &RawArea) -> RegistryResult<i64> {
        let area = raw
            .parse()
            .ok_or_else(|| RegistryError::Validation("Area must be a whole number.".to_string()))?;

        if self.enforce_range && !(self.min..=self.max).contains(&area) {
            return Err(RegistryError::Validation(format!(
                "Area must be between {} and {}.",
                self.min, self.max
            )));
        }
        Ok(area)
    }
}

impl Default for AreaRule {
    fn default() -> Self {
        AreaRule::from_config(&ValidationConfig::default())
    }
}

/// A batch that passed validation: trimmed church, trimmed non-empty names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBatch {
    pub area: i64,
    pub church: String,
    pub names: Vec<String>,
}

/// Checks run in order and stop at the first failure: area, church, names.
pub fn validate_batch(
    rule: &AreaRule,
    area: &RawArea,
    church: &str,
    names: &[String],
) -> RegistryResult<ValidatedBatch> {
    let area = rule.check(area)?;

    let church = church.trim();
    if church.is_empty() {
        return Err(RegistryError::Validation("Church is required.".to_string()));
    }

    let names: Vec<String> = names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Err(RegistryError::Validation(
            "At least one name is required.".to_string(),
        ));
    }

    Ok(ValidatedBatch {
        area,
        church: church.to_string(),
        names,
    })
}

// ============================================================================
// REGISTRAR
// ============================================================================

pub struct BatchRegistrar {
    store: Arc<RegistryStore>,
    sync: SyncHandle,
    area_rule: AreaRule,
}

impl BatchRegistrar {
    pub fn new(store: Arc<RegistryStore>, sync: SyncHandle, area_rule: AreaRule) -> Self {
        BatchRegistrar {
            store,
            sync,
            area_rule,
        }
    }

    /// Validate and admit the batch under a fresh group id.
    ///
    /// If any name is already registered the whole batch is rejected with
    /// `Duplicate(first offending name)` and the store is left unchanged.
    pub fn register(
        &self,
        area: &RawArea,
        church: &str,
        names: &[String],
    ) -> RegistryResult<String> {
        let batch = validate_batch(&self.area_rule, area, church, names)?;

        let now = Utc::now();
        let group_id = new_group_id(now);
        let rows: Vec<Registrant> = batch
            .names
            .iter()
            .map(|name| Registrant::new_pending(name, &batch.church, batch.area, &group_id, now))
            .collect();

        self.store.insert_batch(&rows)?;
        info!(
            group_id = %group_id,
            members = rows.len(),
            church = %batch.church,
            area = batch.area,
            "group registered"
        );

        // Mirror outcome does not affect this result
        self.sync.rows_changed();
        Ok(group_id)
    }
}
