use super::{AddedValue, AppliedMutation, ColumnMutation, PurposeScope};
use crate::catalog::Registry;
use crate::error::{GovError, Result};
use crate::retention::{DataLifeCycleState, RetentionResolver};
use crate::storage::{ColumnConsentedValue, ConsentedPurpose, UserRecord, UserStore};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Storage writes queued for one user, grouped by lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    pub insert_live: Vec<ColumnConsentedValue>,
    pub update_live: Vec<ColumnConsentedValue>,
    pub delete_live: Vec<ColumnConsentedValue>,
    pub insert_soft_deleted: Vec<ColumnConsentedValue>,
    pub update_soft_deleted: Vec<ColumnConsentedValue>,
    pub delete_soft_deleted: Vec<ColumnConsentedValue>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.insert_live.len()
            + self.update_live.len()
            + self.delete_live.len()
            + self.insert_soft_deleted.len()
            + self.update_soft_deleted.len()
            + self.delete_soft_deleted.len()
    }
}

/// Turns planned mutations and expired retention into value writes for one
/// user at a time.
///
/// Revoked purposes leave a soft-deleted shadow of the value behind unless the
/// purpose's deletion timeout is immediate.
pub struct UserValueUpdater {
    registry: Arc<Registry>,
    resolver: RetentionResolver,
    user: Option<UserRecord>,
    touched_columns: BTreeSet<Uuid>,
    changes: PendingChanges,
}

impl UserValueUpdater {
    pub fn new(registry: Arc<Registry>, resolver: RetentionResolver) -> Self {
        Self {
            registry,
            resolver,
            user: None,
            touched_columns: BTreeSet::new(),
            changes: PendingChanges::default(),
        }
    }

    /// Starts a new user; queued changes of the previous user are dropped.
    pub fn set_user(&mut self, user: UserRecord) {
        self.user = Some(user);
        self.touched_columns.clear();
        self.changes = PendingChanges::default();
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn changes(&self) -> &PendingChanges {
        &self.changes
    }

    fn current_user(&self) -> Result<&UserRecord> {
        self.user
            .as_ref()
            .ok_or_else(|| GovError::Internal("value updater has no user set".into()))
    }

    pub fn apply_mutations(&mut self, mutations: &[ColumnMutation]) -> Result<()> {
        for mutation in mutations {
            let user = self.current_user()?;
            let user_id = user.id;
            let applied =
                mutation.apply(user_id, user.values_for(DataLifeCycleState::Live, mutation.column.id))?;
            if applied.is_noop() {
                trace!(user_id = %user_id, column = %mutation.column.name, "column unchanged");
                continue;
            }
            self.record(mutation, applied)?;
        }
        self.validate_ordering()
    }

    fn record(&mut self, mutation: &ColumnMutation, applied: AppliedMutation) -> Result<()> {
        let column_id = mutation.column.id;
        self.touched_columns.insert(column_id);

        for removed in applied.removed_values.into_values() {
            let purposes = removed.purpose_ids();
            self.shadow(&removed, &purposes)?;
            self.changes.delete_live.push(removed);
        }

        for added in applied.added_values {
            let value = self.new_value(&mutation.column.name, column_id, added)?;
            self.changes.insert_live.push(value);
        }

        let updated_ordering = applied.updated_ordering_value_ids;
        for (id, mut cv) in applied.current_values {
            let current = cv.purpose_ids();
            let updated = applied
                .updated_purposes
                .get(&PurposeScope::Value(id))
                .cloned()
                .unwrap_or_default();
            if current == updated {
                if updated_ordering.contains(&id) {
                    self.changes.update_live.push(cv);
                }
                continue;
            }
            let revoked: BTreeSet<Uuid> = current.difference(&updated).copied().collect();
            self.shadow(&cv, &revoked)?;
            let mut consented = Vec::with_capacity(updated.len());
            for purpose_id in updated {
                let retention_timeout = match cv.timeout_for(purpose_id) {
                    Some(kept) => kept,
                    None => self.resolver.retention_timeout(column_id, purpose_id)?,
                };
                consented.push(ConsentedPurpose {
                    purpose_id,
                    retention_timeout,
                });
            }
            cv.consented_purposes = consented;
            self.changes.update_live.push(cv);
        }
        Ok(())
    }

    fn new_value(&mut self, column_name: &str, column_id: Uuid, added: AddedValue) -> Result<ColumnConsentedValue> {
        let mut consented_purposes = Vec::with_capacity(added.purposes.len());
        for purpose_id in added.purposes {
            consented_purposes.push(ConsentedPurpose {
                purpose_id,
                retention_timeout: self.resolver.retention_timeout(column_id, purpose_id)?,
            });
        }
        Ok(ColumnConsentedValue {
            id: Uuid::new_v4(),
            version: added.version,
            column_id,
            column_name: column_name.to_string(),
            ordering: added.ordering,
            value: added.value,
            consented_purposes,
        })
    }

    /// Queues a soft-deleted copy of `value` holding the revoked purposes that
    /// are retained after deletion.
    fn shadow(&mut self, value: &ColumnConsentedValue, revoked: &BTreeSet<Uuid>) -> Result<()> {
        let mut consented_purposes = Vec::new();
        for &purpose_id in revoked {
            let retention_timeout = self.resolver.deletion_timeout(value.column_id, purpose_id)?;
            if retention_timeout.is_immediate() {
                continue;
            }
            consented_purposes.push(ConsentedPurpose {
                purpose_id,
                retention_timeout,
            });
        }
        if consented_purposes.is_empty() {
            return Ok(());
        }
        self.changes.insert_soft_deleted.push(ColumnConsentedValue {
            consented_purposes,
            ..value.clone()
        });
        Ok(())
    }

    /// Fails when two live values of a touched column would share an ordering.
    pub fn validate_ordering(&self) -> Result<()> {
        let user = self.current_user()?;
        let deleted: HashSet<Uuid> = self.changes.delete_live.iter().map(|v| v.id).collect();
        let updated: BTreeMap<Uuid, i32> = self
            .changes
            .update_live
            .iter()
            .map(|v| (v.id, v.ordering))
            .collect();
        for &column_id in &self.touched_columns {
            let mut seen = BTreeMap::new();
            let stored = user
                .values_for(DataLifeCycleState::Live, column_id)
                .iter()
                .filter(|v| !deleted.contains(&v.id))
                .map(|v| (v.id, updated.get(&v.id).copied().unwrap_or(v.ordering)));
            let inserted = self
                .changes
                .insert_live
                .iter()
                .filter(|v| v.column_id == column_id)
                .map(|v| (v.id, v.ordering));
            for (id, ordering) in stored.chain(inserted) {
                if let Some(other) = seen.insert(ordering, id) {
                    let column = self
                        .registry
                        .find_column(column_id)
                        .map_or_else(|| column_id.to_string(), |c| c.name.clone());
                    return Err(GovError::OrderingViolation {
                        column,
                        message: format!("values {other} and {id} share ordering {ordering}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Revokes every purpose whose retention has passed at the resolver's base
    /// time, and drops soft-deleted purposes past their deletion timeout.
    pub fn remove_expired_purposes(&mut self) -> Result<()> {
        let reference = self.resolver.base_time();
        let user = self.current_user()?.clone();

        for value in user.all_values(DataLifeCycleState::Live) {
            if !self.is_user_column(value.column_id)? {
                continue;
            }
            let (expired, kept): (Vec<ConsentedPurpose>, Vec<ConsentedPurpose>) = value
                .consented_purposes
                .iter()
                .partition(|p| p.retention_timeout.has_expired(reference));
            if expired.is_empty() {
                continue;
            }
            let revoked: BTreeSet<Uuid> = expired.iter().map(|p| p.purpose_id).collect();
            self.shadow(value, &revoked)?;
            if kept.is_empty() {
                self.changes.delete_live.push(value.clone());
            } else {
                self.changes.update_live.push(ColumnConsentedValue {
                    consented_purposes: kept,
                    ..value.clone()
                });
            }
        }

        for value in user.all_values(DataLifeCycleState::SoftDeleted) {
            if !self.is_user_column(value.column_id)? {
                continue;
            }
            let kept: Vec<ConsentedPurpose> = value
                .consented_purposes
                .iter()
                .filter(|p| !p.retention_timeout.has_expired(reference))
                .copied()
                .collect();
            if kept.len() == value.consented_purposes.len() {
                continue;
            }
            if kept.is_empty() {
                self.changes.delete_soft_deleted.push(value.clone());
            } else {
                self.changes.update_soft_deleted.push(ColumnConsentedValue {
                    consented_purposes: kept,
                    ..value.clone()
                });
            }
        }
        Ok(())
    }

    fn is_user_column(&self, column_id: Uuid) -> Result<bool> {
        match self.registry.find_column(column_id) {
            Some(column) => Ok(!column.is_system()),
            None => Err(GovError::Internal(format!(
                "stored value references unknown column {column_id}"
            ))),
        }
    }

    /// Writes queued changes: live inserts, updates, deletes, then the same for
    /// soft-deleted values, then the user's updated timestamp.
    pub fn save_changes(&mut self, store: &dyn UserStore) -> Result<()> {
        if self.changes.is_empty() {
            return Ok(());
        }
        let user_id = self.current_user()?.id;
        let mut changes = std::mem::take(&mut self.changes);
        changes.insert_soft_deleted.sort_by_key(|v| v.ordering);
        debug!(
            user_id = %user_id,
            region = store.region(),
            writes = changes.len(),
            "saving user value changes"
        );

        let live = DataLifeCycleState::Live;
        let soft = DataLifeCycleState::SoftDeleted;
        // Deletes and reorders free orderings that new values may reuse.
        if !changes.delete_live.is_empty() {
            store.delete_values(user_id, live, &changes.delete_live)?;
        }
        if !changes.update_live.is_empty() {
            store.update_values(user_id, live, &changes.update_live)?;
        }
        if !changes.insert_live.is_empty() {
            store.insert_values(user_id, live, &changes.insert_live)?;
        }
        if !changes.insert_soft_deleted.is_empty() {
            store.insert_values(user_id, soft, &changes.insert_soft_deleted)?;
        }
        if !changes.update_soft_deleted.is_empty() {
            store.update_values(user_id, soft, &changes.update_soft_deleted)?;
        }
        if !changes.delete_soft_deleted.is_empty() {
            store.delete_values(user_id, soft, &changes.delete_soft_deleted)?;
        }
        store.mark_user_updated(user_id, self.resolver.base_time())
    }
}
