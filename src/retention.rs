use crate::catalog::ConfigStore;
use crate::error::{GovError, ResourceType, Result};
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    Indefinite,
    Year,
    Month,
    Week,
    Day,
    Hour,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetentionDuration {
    pub unit: DurationUnit,
    pub duration: u32,
}

impl RetentionDuration {
    pub fn new(unit: DurationUnit, duration: u32) -> Self {
        Self { unit, duration }
    }

    pub fn indefinite() -> Self {
        Self::new(DurationUnit::Indefinite, 0)
    }

    /// A zero-length finite duration: values are not retained at all.
    pub fn immediate_deletion() -> Self {
        Self::new(DurationUnit::Day, 0)
    }

    pub fn days(duration: u32) -> Self {
        Self::new(DurationUnit::Day, duration)
    }

    pub fn validate(&self) -> Result<()> {
        if self.unit == DurationUnit::Indefinite && self.duration != 0 {
            return Err(GovError::Validation(
                "duration must be 0 when the unit is indefinite".into(),
            ));
        }
        Ok(())
    }

    pub fn add_to_time(&self, base: DateTime<Utc>) -> Result<RetentionTimeout> {
        if self.unit == DurationUnit::Indefinite {
            return Ok(RetentionTimeout::Indefinite);
        }
        if self.duration == 0 {
            return Ok(RetentionTimeout::ImmediateDeletion);
        }
        let n = self.duration;
        let at = match self.unit {
            DurationUnit::Indefinite => None,
            DurationUnit::Year => n
                .checked_mul(12)
                .and_then(|months| base.checked_add_months(Months::new(months))),
            DurationUnit::Month => base.checked_add_months(Months::new(n)),
            DurationUnit::Week => base.checked_add_signed(Duration::weeks(i64::from(n))),
            DurationUnit::Day => base.checked_add_signed(Duration::days(i64::from(n))),
            DurationUnit::Hour => base.checked_add_signed(Duration::hours(i64::from(n))),
        };
        at.map(RetentionTimeout::At).ok_or_else(|| {
            GovError::Validation(format!(
                "retention duration {n} {:?} overflows the timestamp range",
                self.unit
            ))
        })
    }
}

/// Point at which a consented purpose stops being retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RetentionTimeout {
    ImmediateDeletion,
    At(DateTime<Utc>),
    Indefinite,
}

impl RetentionTimeout {
    pub fn is_immediate(&self) -> bool {
        matches!(self, RetentionTimeout::ImmediateDeletion)
    }

    pub fn is_indefinite(&self) -> bool {
        matches!(self, RetentionTimeout::Indefinite)
    }

    /// Whether the timeout has passed at `reference`.
    pub fn has_expired(&self, reference: DateTime<Utc>) -> bool {
        match self {
            RetentionTimeout::ImmediateDeletion => true,
            RetentionTimeout::At(at) => *at <= reference,
            RetentionTimeout::Indefinite => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLifeCycleState {
    Live,
    SoftDeleted,
}

impl std::fmt::Display for DataLifeCycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataLifeCycleState::Live => write!(f, "live"),
            DataLifeCycleState::SoftDeleted => write!(f, "softdeleted"),
        }
    }
}

/// A configured retention duration for one lifecycle state.
///
/// `column_id: None, purpose_id: None` is the tenant-wide default;
/// `column_id: None, purpose_id: Some(..)` applies to a purpose on every column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionDurationOverride {
    pub id: Uuid,
    pub state: DataLifeCycleState,
    pub column_id: Option<Uuid>,
    pub purpose_id: Option<Uuid>,
    pub duration: RetentionDuration,
}

impl RetentionDurationOverride {
    pub fn validate(&self) -> Result<()> {
        if self.column_id.is_some() && self.purpose_id.is_none() {
            return Err(GovError::Validation(
                "column retention durations must name a purpose".into(),
            ));
        }
        self.duration.validate()
    }
}

type RetentionKey = (DataLifeCycleState, Option<Uuid>, Option<Uuid>);

/// Resolves live retention and deletion timeouts for (column, purpose) pairs.
///
/// One resolver serves one mutation batch: overrides are loaded on first use
/// and every resolution is memoized for the resolver's lifetime.
pub struct RetentionResolver {
    store: Arc<dyn ConfigStore>,
    base_time: DateTime<Utc>,
    default_live: RetentionDuration,
    default_soft_deleted: RetentionDuration,
    durations: Option<HashMap<RetentionKey, RetentionDuration>>,
    timeouts: HashMap<(DataLifeCycleState, Uuid, Uuid), RetentionTimeout>,
}

impl RetentionResolver {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        base_time: DateTime<Utc>,
        default_live: RetentionDuration,
        default_soft_deleted: RetentionDuration,
    ) -> Self {
        Self {
            store,
            base_time,
            default_live,
            default_soft_deleted,
            durations: None,
            timeouts: HashMap::new(),
        }
    }

    pub fn base_time(&self) -> DateTime<Utc> {
        self.base_time
    }

    pub fn retention_timeout(&mut self, column_id: Uuid, purpose_id: Uuid) -> Result<RetentionTimeout> {
        self.timeout(DataLifeCycleState::Live, column_id, purpose_id)
    }

    pub fn deletion_timeout(&mut self, column_id: Uuid, purpose_id: Uuid) -> Result<RetentionTimeout> {
        self.timeout(DataLifeCycleState::SoftDeleted, column_id, purpose_id)
    }

    fn timeout(
        &mut self,
        state: DataLifeCycleState,
        column_id: Uuid,
        purpose_id: Uuid,
    ) -> Result<RetentionTimeout> {
        if let Some(timeout) = self.timeouts.get(&(state, column_id, purpose_id)) {
            return Ok(*timeout);
        }
        let duration = self.resolve_duration(state, column_id, purpose_id)?;
        let timeout = duration.add_to_time(self.base_time)?;
        self.timeouts.insert((state, column_id, purpose_id), timeout);
        Ok(timeout)
    }

    fn resolve_duration(
        &mut self,
        state: DataLifeCycleState,
        column_id: Uuid,
        purpose_id: Uuid,
    ) -> Result<RetentionDuration> {
        let durations = self.load()?;
        let candidates = [
            (state, Some(column_id), Some(purpose_id)),
            (state, None, Some(purpose_id)),
            (state, None, None),
        ];
        candidates
            .iter()
            .find_map(|key| durations.get(key).copied())
            .ok_or_else(|| {
                GovError::Internal(format!(
                    "no default {state} retention duration configured"
                ))
            })
    }

    fn load(&mut self) -> Result<&HashMap<RetentionKey, RetentionDuration>> {
        if self.durations.is_none() {
            let mut durations = HashMap::new();
            durations.insert((DataLifeCycleState::Live, None, None), self.default_live);
            durations.insert(
                (DataLifeCycleState::SoftDeleted, None, None),
                self.default_soft_deleted,
            );
            for entry in self.store.list_retention_durations()? {
                durations.insert((entry.state, entry.column_id, entry.purpose_id), entry.duration);
            }
            self.durations = Some(durations);
        }
        self.durations
            .as_ref()
            .ok_or_else(|| GovError::Internal("retention durations not loaded".into()))
    }
}
