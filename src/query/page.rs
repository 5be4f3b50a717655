use crate::catalog::Registry;
use crate::catalog::types::Value;
use crate::config::EngineConfig;
use crate::query::error::QueryError;
use crate::retention::DataLifeCycleState;
use crate::storage::UserRecord;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Client-facing pagination parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationOptions {
    #[serde(default)]
    pub starting_after: Option<String>,
    #[serde(default)]
    pub ending_before: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Comma-separated column names; `id` is appended when missing.
    #[serde(default)]
    pub sort_key: Option<String>,
    #[serde(default)]
    pub sort_order: Option<SortOrder>,
}

impl PaginationOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn starting_after(mut self, cursor: impl Into<String>) -> Self {
        self.starting_after = Some(cursor.into());
        self
    }

    pub fn ending_before(mut self, cursor: impl Into<String>) -> Self {
        self.ending_before = Some(cursor.into());
        self
    }

    pub fn sorted_by(mut self, sort_key: &str, order: SortOrder) -> Self {
        self.sort_key = Some(sort_key.to_string());
        self.sort_order = Some(order);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortColumn {
    pub name: String,
    pub column_id: Uuid,
    pub system: bool,
    /// Every user has a value for this key.
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CursorToken {
    keys: Vec<String>,
    values: Vec<Option<Value>>,
}

/// Window of a sorted candidate scan handed to a region store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageWindow {
    pub keys: Vec<SortColumn>,
    pub order: SortOrder,
    pub direction: Direction,
    pub cursor: Option<Vec<Option<Value>>>,
    pub fetch_limit: usize,
}

impl PageWindow {
    pub fn sort_values(&self, user: &UserRecord, state: DataLifeCycleState) -> Vec<Option<Value>> {
        sort_values(&self.keys, user, state)
    }

    fn scans_ascending(&self) -> bool {
        matches!(
            (self.direction, self.order),
            (Direction::Forward, SortOrder::Ascending) | (Direction::Backward, SortOrder::Descending)
        )
    }

    /// Comparator in scan order: the order rows leave the store.
    pub fn scan_cmp(&self, a: &[Option<Value>], b: &[Option<Value>]) -> Ordering {
        let ordering = compare_sort_values(a, b);
        if self.scans_ascending() {
            ordering
        } else {
            ordering.reverse()
        }
    }

    /// Sorts `users` in scan order, drops rows at or before the cursor and
    /// keeps at most `fetch_limit`.
    pub fn select(&self, users: Vec<UserRecord>, state: DataLifeCycleState) -> Vec<UserRecord> {
        let mut keyed: Vec<(Vec<Option<Value>>, UserRecord)> = users
            .into_iter()
            .map(|u| (self.sort_values(&u, state), u))
            .filter(|(values, _)| match &self.cursor {
                Some(cursor) => self.scan_cmp(values, cursor).is_gt(),
                None => true,
            })
            .collect();
        keyed.sort_by(|(a, _), (b, _)| self.scan_cmp(a, b));
        keyed.truncate(self.fetch_limit);
        keyed.into_iter().map(|(_, u)| u).collect()
    }

    /// Re-sorts rows merged from several regions into scan order.
    pub fn sort_merged(&self, users: &mut [UserRecord], state: DataLifeCycleState) {
        users.sort_by_cached_key(|u| SortKeyed(self.sort_values(u, state), self.scans_ascending()));
    }
}

#[derive(PartialEq, Eq)]
struct SortKeyed(Vec<Option<Value>>, bool);

impl PartialOrd for SortKeyed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKeyed {
    fn cmp(&self, other: &Self) -> Ordering {
        let ordering = compare_sort_values(&self.0, &other.0);
        if self.1 { ordering } else { ordering.reverse() }
    }
}

/// Lexicographic comparison with missing values first.
pub fn compare_sort_values(a: &[Option<Value>], b: &[Option<Value>]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ordering = match (x, y) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

fn sort_values(keys: &[SortColumn], user: &UserRecord, state: DataLifeCycleState) -> Vec<Option<Value>> {
    keys.iter()
        .map(|key| {
            if key.system {
                user.system_value(&key.name)
            } else {
                user.values_for(state, key.column_id)
                    .first()
                    .map(|v| v.value.clone())
            }
        })
        .collect()
}

/// Resolved pagination state for one accessor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paginator {
    keys: Vec<SortColumn>,
    order: SortOrder,
    direction: Direction,
    cursor: Option<Vec<Option<Value>>>,
    limit: usize,
    limit_multiplier: usize,
}

impl Paginator {
    pub fn new(
        options: &PaginationOptions,
        registry: &Registry,
        config: &EngineConfig,
    ) -> Result<Self, QueryError> {
        let keys = resolve_sort_keys(options.sort_key.as_deref(), registry)?;
        let limit = options.limit.unwrap_or(config.default_page_size);
        if limit == 0 || limit > config.max_page_size {
            return Err(QueryError::InvalidQuery {
                reason: format!("limit must be between 1 and {}", config.max_page_size),
            });
        }
        let (direction, cursor) = match (&options.starting_after, &options.ending_before) {
            (Some(_), Some(_)) => {
                return Err(QueryError::InvalidQuery {
                    reason: "starting_after and ending_before are mutually exclusive".into(),
                });
            }
            (Some(c), None) => (Direction::Forward, Some(decode_cursor(c, &keys)?)),
            (None, Some(c)) => (Direction::Backward, Some(decode_cursor(c, &keys)?)),
            (None, None) => (Direction::Forward, None),
        };
        Ok(Self {
            keys,
            order: options.sort_order.unwrap_or_default(),
            direction,
            cursor,
            limit,
            limit_multiplier: config.limit_multiplier,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn limit_multiplier(&self) -> usize {
        self.limit_multiplier
    }

    pub fn is_initial(&self) -> bool {
        self.cursor.is_none()
    }

    pub fn is_forward(&self) -> bool {
        self.direction == Direction::Forward
    }

    pub fn sorts_by_id_only(&self) -> bool {
        self.keys.len() == 1 && self.keys[0].name == "id"
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Id the cursor points at, when paginating by id only.
    pub fn cursor_id(&self) -> Option<Uuid> {
        match self.cursor.as_deref() {
            Some([Some(Value::Uuid(id))]) if self.sorts_by_id_only() => Some(*id),
            _ => None,
        }
    }

    /// Rows scanned for one page: `limit * limit_multiplier` plus one, so the
    /// caller can tell whether more rows remain.
    pub fn fetch_limit(&self) -> usize {
        self.limit
            .saturating_mul(self.limit_multiplier)
            .saturating_add(1)
    }

    pub fn window(&self) -> PageWindow {
        PageWindow {
            keys: self.keys.clone(),
            order: self.order,
            direction: self.direction,
            cursor: self.cursor.clone(),
            fetch_limit: self.fetch_limit(),
        }
    }

    pub fn cursor_for(&self, user: &UserRecord, state: DataLifeCycleState) -> Result<String, QueryError> {
        let values = sort_values(&self.keys, user, state);
        for (key, value) in self.keys.iter().zip(values.iter()) {
            if key.required && value.is_none() {
                return Err(QueryError::InternalError(format!(
                    "user {} has no value for required sort key '{}'",
                    user.id, key.name
                )));
            }
        }
        encode_cursor(&CursorToken {
            keys: self.keys.iter().map(|k| k.name.clone()).collect(),
            values,
        })
    }
}

fn resolve_sort_keys(sort_key: Option<&str>, registry: &Registry) -> Result<Vec<SortColumn>, QueryError> {
    let mut keys = Vec::new();
    let names: Vec<&str> = sort_key
        .unwrap_or("id")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    for name in names {
        let column = registry
            .find_column_by_name(name)
            .ok_or_else(|| QueryError::ColumnNotFound {
                column: name.to_string(),
            })?;
        if column.is_array {
            return Err(QueryError::InvalidQuery {
                reason: format!("array column '{}' cannot be a sort key", column.name),
            });
        }
        if keys.iter().any(|k: &SortColumn| k.column_id == column.id) {
            return Err(QueryError::InvalidQuery {
                reason: format!("sort key '{}' repeated", column.name),
            });
        }
        keys.push(SortColumn {
            name: column.name.clone(),
            column_id: column.id,
            system: column.is_system(),
            required: column.is_system() && column.name != "organization_id",
        });
    }
    if keys.last().is_none_or(|k| k.name != "id") {
        if keys.iter().any(|k| k.name == "id") {
            return Err(QueryError::InvalidQuery {
                reason: "'id' must be the last sort key".into(),
            });
        }
        let id = registry
            .find_column_by_name("id")
            .ok_or_else(|| QueryError::InternalError("id column is not registered".into()))?;
        keys.push(SortColumn {
            name: id.name.clone(),
            column_id: id.id,
            system: true,
            required: true,
        });
    }
    Ok(keys)
}

fn encode_cursor(cursor: &CursorToken) -> Result<String, QueryError> {
    let bytes = rmp_serde::to_vec(cursor).map_err(|e| QueryError::InternalError(e.to_string()))?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

fn decode_cursor(encoded: &str, keys: &[SortColumn]) -> Result<Vec<Option<Value>>, QueryError> {
    let malformed = || QueryError::InvalidQuery {
        reason: "invalid cursor".into(),
    };
    if !encoded.len().is_multiple_of(2) || !encoded.is_ascii() {
        return Err(malformed());
    }
    let bytes = (0..encoded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&encoded[i..i + 2], 16).map_err(|_| malformed()))
        .collect::<Result<Vec<u8>, QueryError>>()?;
    let token: CursorToken = rmp_serde::from_slice(&bytes).map_err(|e| QueryError::InvalidQuery {
        reason: e.to_string(),
    })?;
    let names: Vec<&str> = keys.iter().map(|k| k.name.as_str()).collect();
    if token.keys != names || token.values.len() != keys.len() {
        return Err(QueryError::InvalidQuery {
            reason: "cursor was issued for a different sort key".into(),
        });
    }
    for (key, value) in keys.iter().zip(token.values.iter()) {
        if key.required && value.is_none() {
            return Err(QueryError::InvalidQuery {
                reason: format!("cursor is missing required key '{}'", key.name),
            });
        }
    }
    Ok(token.values)
}
