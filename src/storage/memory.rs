use crate::error::{GovError, ResourceType, Result};
use crate::retention::DataLifeCycleState;
use crate::storage::{ColumnConsentedValue, NewUser, UserQuery, UserRecord, UserStore};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use tracing::trace;
use uuid::Uuid;

/// One data region held in memory.
#[derive(Debug)]
pub struct MemoryUserStore {
    region: String,
    users: RwLock<BTreeMap<Uuid, UserRecord>>,
}

impl MemoryUserStore {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            users: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    fn with_user<T>(&self, user_id: Uuid, f: impl FnOnce(&mut UserRecord) -> Result<T>) -> Result<T> {
        let mut users = self.users.write();
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| GovError::not_found(ResourceType::User, user_id))?;
        f(user)
    }
}

fn find_value<'a>(
    user: &'a mut UserRecord,
    state: DataLifeCycleState,
    value: &ColumnConsentedValue,
) -> Option<&'a mut ColumnConsentedValue> {
    user.partition_mut(state)
        .get_mut(&value.column_id)
        .and_then(|values| values.iter_mut().find(|v| v.id == value.id))
}

impl UserStore for MemoryUserStore {
    fn region(&self) -> &str {
        &self.region
    }

    fn select_users(&self, query: &UserQuery) -> Result<Vec<UserRecord>> {
        let users = self.users.read();
        let matched: Vec<UserRecord> = users
            .values()
            .filter(|u| query.state == DataLifeCycleState::SoftDeleted || !u.is_deleted())
            .filter(|u| query.predicate.matches(u, query.state))
            .cloned()
            .collect();
        drop(users);
        trace!(region = %self.region, matched = matched.len(), "selected users");
        Ok(match &query.page {
            Some(window) => window.select(matched, query.state),
            None => matched,
        })
    }

    fn get_user(&self, id: Uuid) -> Result<Option<UserRecord>> {
        Ok(self.users.read().get(&id).cloned())
    }

    fn list_user_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self.users.read().keys().copied().collect())
    }

    fn insert_user(&self, user: NewUser) -> Result<()> {
        let mut users = self.users.write();
        if users.contains_key(&user.id) {
            return Err(GovError::AlreadyExists {
                resource_type: ResourceType::User,
                resource_id: user.id.to_string(),
            });
        }
        let mut record = UserRecord::new(user.id, &self.region, user.created);
        record.organization_id = user.organization_id;
        users.insert(user.id, record);
        Ok(())
    }

    fn delete_user(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut users = self.users.write();
        match users.get_mut(&id) {
            Some(user) if !user.is_deleted() => {
                user.deleted = Some(at);
                user.live.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn purge_user(&self, id: Uuid) -> Result<bool> {
        Ok(self.users.write().remove(&id).is_some())
    }

    fn insert_values(
        &self,
        user_id: Uuid,
        state: DataLifeCycleState,
        values: &[ColumnConsentedValue],
    ) -> Result<()> {
        self.with_user(user_id, |user| {
            if state == DataLifeCycleState::Live {
                let mut taken: HashSet<(Uuid, i32)> = user
                    .all_values(state)
                    .map(|v| (v.column_id, v.ordering))
                    .collect();
                for value in values {
                    if !taken.insert((value.column_id, value.ordering)) {
                        return Err(GovError::Conflict(format!(
                            "column '{}' already holds a value at ordering {}",
                            value.column_name, value.ordering
                        )));
                    }
                }
            }
            for value in values {
                if let Some(existing) = find_value(user, state, value) {
                    // Shadows of one value revoked at different times share an id.
                    if state == DataLifeCycleState::SoftDeleted {
                        for purpose in &value.consented_purposes {
                            existing
                                .consented_purposes
                                .retain(|p| p.purpose_id != purpose.purpose_id);
                            existing.consented_purposes.push(*purpose);
                        }
                        continue;
                    }
                    return Err(GovError::Conflict(format!(
                        "value {} of column '{}' already exists",
                        value.id, value.column_name
                    )));
                }
                user.push_value(state, value.clone());
            }
            Ok(())
        })
    }

    fn update_values(
        &self,
        user_id: Uuid,
        state: DataLifeCycleState,
        values: &[ColumnConsentedValue],
    ) -> Result<()> {
        self.with_user(user_id, |user| {
            for value in values {
                let existing = find_value(user, state, value).ok_or_else(|| {
                    GovError::Conflict(format!(
                        "value {} of column '{}' no longer exists",
                        value.id, value.column_name
                    ))
                })?;
                if existing.version != value.version {
                    return Err(GovError::Conflict(format!(
                        "value {} of column '{}' was modified concurrently",
                        value.id, value.column_name
                    )));
                }
                *existing = ColumnConsentedValue {
                    version: value.version + 1,
                    ..value.clone()
                };
            }
            for values in user.partition_mut(state).values_mut() {
                values.sort_by_key(|v| v.ordering);
            }
            Ok(())
        })
    }

    fn delete_values(
        &self,
        user_id: Uuid,
        state: DataLifeCycleState,
        values: &[ColumnConsentedValue],
    ) -> Result<()> {
        self.with_user(user_id, |user| {
            let partition = user.partition_mut(state);
            for value in values {
                let column = partition.get_mut(&value.column_id);
                let removed = column.is_some_and(|existing| {
                    let before = existing.len();
                    existing.retain(|v| v.id != value.id);
                    existing.len() != before
                });
                if !removed {
                    return Err(GovError::Conflict(format!(
                        "value {} of column '{}' no longer exists",
                        value.id, value.column_name
                    )));
                }
            }
            partition.retain(|_, v| !v.is_empty());
            Ok(())
        })
    }

    fn mark_user_updated(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_user(user_id, |user| {
            user.updated = at;
            Ok(())
        })
    }
}
