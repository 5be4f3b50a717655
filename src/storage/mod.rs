pub mod memory;

use crate::catalog::Registry;
use crate::catalog::types::Value;
use crate::error::Result;
use crate::query::page::PageWindow;
use crate::query::plan::Predicate;
use crate::retention::{DataLifeCycleState, RetentionTimeout};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub use memory::MemoryUserStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsentedPurpose {
    pub purpose_id: Uuid,
    pub retention_timeout: RetentionTimeout,
}

/// One stored value of one column for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnConsentedValue {
    pub id: Uuid,
    pub version: u32,
    pub column_id: Uuid,
    pub column_name: String,
    pub ordering: i32,
    pub value: Value,
    pub consented_purposes: Vec<ConsentedPurpose>,
}

impl ColumnConsentedValue {
    pub fn purpose_ids(&self) -> BTreeSet<Uuid> {
        self.consented_purposes.iter().map(|p| p.purpose_id).collect()
    }

    pub fn timeout_for(&self, purpose_id: Uuid) -> Option<RetentionTimeout> {
        self.consented_purposes
            .iter()
            .find(|p| p.purpose_id == purpose_id)
            .map(|p| p.retention_timeout)
    }

    /// Visible to a reader only when consented for every requested purpose.
    pub fn consented_for_all(&self, purposes: &BTreeSet<Uuid>) -> bool {
        let consented = self.purpose_ids();
        purposes.iter().all(|p| consented.contains(p))
    }
}

/// A user row plus its live and soft-deleted column values, keyed by column id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub region: String,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(default)]
    pub live: BTreeMap<Uuid, Vec<ColumnConsentedValue>>,
    #[serde(default)]
    pub soft_deleted: BTreeMap<Uuid, Vec<ColumnConsentedValue>>,
}

impl UserRecord {
    pub fn new(id: Uuid, region: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            region: region.to_string(),
            organization_id: None,
            created: now,
            updated: now,
            deleted: None,
            live: BTreeMap::new(),
            soft_deleted: BTreeMap::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    fn partition(&self, state: DataLifeCycleState) -> &BTreeMap<Uuid, Vec<ColumnConsentedValue>> {
        match state {
            DataLifeCycleState::Live => &self.live,
            DataLifeCycleState::SoftDeleted => &self.soft_deleted,
        }
    }

    pub(crate) fn partition_mut(
        &mut self,
        state: DataLifeCycleState,
    ) -> &mut BTreeMap<Uuid, Vec<ColumnConsentedValue>> {
        match state {
            DataLifeCycleState::Live => &mut self.live,
            DataLifeCycleState::SoftDeleted => &mut self.soft_deleted,
        }
    }

    /// Values of one column ordered by `ordering`.
    pub fn values_for(&self, state: DataLifeCycleState, column_id: Uuid) -> &[ColumnConsentedValue] {
        self.partition(state)
            .get(&column_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn push_value(&mut self, state: DataLifeCycleState, value: ColumnConsentedValue) {
        let values = self.partition_mut(state).entry(value.column_id).or_default();
        values.push(value);
        values.sort_by_key(|v| v.ordering);
    }

    pub fn all_values(&self, state: DataLifeCycleState) -> impl Iterator<Item = &ColumnConsentedValue> {
        self.partition(state).values().flatten()
    }

    pub fn system_value(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::Uuid(self.id)),
            "created" => Some(Value::Timestamp(self.created)),
            "updated" => Some(Value::Timestamp(self.updated)),
            "organization_id" => self.organization_id.map(Value::Uuid),
            _ => None,
        }
    }

    /// JSON profile of the user, limited to values consented for all of
    /// `purposes` when given.
    ///
    /// Array columns render as arrays; scalar columns as their single value.
    /// Soft-deleted profiles render every user column as an array.
    pub fn profile(
        &self,
        registry: &Registry,
        state: DataLifeCycleState,
        purposes: Option<&BTreeSet<Uuid>>,
    ) -> Map<String, JsonValue> {
        let mut profile = Map::new();
        for column in registry.columns() {
            if column.is_system() {
                if let Some(value) = self.system_value(&column.name) {
                    profile.insert(column.name.clone(), value.to_json());
                }
                continue;
            }
            let values: Vec<JsonValue> = self
                .values_for(state, column.id)
                .iter()
                .filter(|v| purposes.is_none_or(|p| v.consented_for_all(p)))
                .map(|v| v.value.to_json())
                .collect();
            let rendered = if column.is_array || state == DataLifeCycleState::SoftDeleted {
                JsonValue::Array(values)
            } else {
                values.into_iter().next().unwrap_or(JsonValue::Null)
            };
            profile.insert(column.name.clone(), rendered);
        }
        profile
    }
}

/// Candidate lookup against one region.
#[derive(Debug, Clone)]
pub struct UserQuery {
    pub predicate: Predicate,
    pub state: DataLifeCycleState,
    pub page: Option<PageWindow>,
}

/// Base row for a new user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub created: DateTime<Utc>,
}

/// Per-region user storage.
///
/// Each call is atomic for the user it touches; nothing spans users, calls or
/// regions.
pub trait UserStore: Send + Sync {
    fn region(&self) -> &str;

    fn select_users(&self, query: &UserQuery) -> Result<Vec<UserRecord>>;

    fn get_user(&self, id: Uuid) -> Result<Option<UserRecord>>;

    fn list_user_ids(&self) -> Result<Vec<Uuid>>;

    fn insert_user(&self, user: NewUser) -> Result<()>;

    /// Marks the user deleted; soft-deleted values stay until swept.
    fn delete_user(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Removes every trace of a user that never finished being created.
    fn purge_user(&self, id: Uuid) -> Result<bool>;

    fn insert_values(
        &self,
        user_id: Uuid,
        state: DataLifeCycleState,
        values: &[ColumnConsentedValue],
    ) -> Result<()>;

    fn update_values(
        &self,
        user_id: Uuid,
        state: DataLifeCycleState,
        values: &[ColumnConsentedValue],
    ) -> Result<()>;

    fn delete_values(
        &self,
        user_id: Uuid,
        state: DataLifeCycleState,
        values: &[ColumnConsentedValue],
    ) -> Result<()>;

    fn mark_user_updated(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}
