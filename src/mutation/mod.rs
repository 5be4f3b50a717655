pub mod full;
pub mod partial;
pub mod updater;

use crate::catalog::schema::{Column, DataType, Mutator};
use crate::catalog::types::Value;
use crate::catalog::{ConfigStore, Registry};
use crate::error::{GovError, Result};
use crate::storage::ColumnConsentedValue;
use crate::transform::{Provenance, TransformBatch, Transformer, TransformerExecutor};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub use updater::{PendingChanges, UserValueUpdater};

/// Requested value of a full-update column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestValue {
    /// Nothing given; treated like `Null`.
    #[default]
    Absent,
    /// Revoke every named purpose from the current values.
    Null,
    /// Keep the current values and only adjust purposes.
    KeepCurrent,
    /// Write the column's configured default value.
    UseDefault,
    Json(JsonValue),
}

/// Requested member set of a partial-update column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestValueSet {
    /// Every current value.
    KeepCurrent,
    Json(JsonValue),
}

/// One column of a mutator's row data. Purposes are referenced by id or name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueAndPurposes {
    #[serde(default)]
    pub value: RequestValue,
    #[serde(default)]
    pub value_additions: Option<RequestValueSet>,
    #[serde(default)]
    pub value_deletions: Option<RequestValueSet>,
    #[serde(default)]
    pub purpose_additions: Vec<String>,
    #[serde(default)]
    pub purpose_deletions: Vec<String>,
}

impl ValueAndPurposes {
    pub fn value(value: JsonValue) -> Self {
        Self {
            value: RequestValue::Json(value),
            ..Self::default()
        }
    }

    pub fn null() -> Self {
        Self {
            value: RequestValue::Null,
            ..Self::default()
        }
    }

    pub fn keep_current() -> Self {
        Self {
            value: RequestValue::KeepCurrent,
            ..Self::default()
        }
    }

    pub fn use_default() -> Self {
        Self {
            value: RequestValue::UseDefault,
            ..Self::default()
        }
    }

    pub fn additions(values: RequestValueSet) -> Self {
        Self {
            value_additions: Some(values),
            ..Self::default()
        }
    }

    pub fn with_deletions(mut self, values: RequestValueSet) -> Self {
        self.value_deletions = Some(values);
        self
    }

    pub fn adding_purposes(mut self, purposes: &[&str]) -> Self {
        self.purpose_additions = purposes.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn deleting_purposes(mut self, purposes: &[&str]) -> Self {
        self.purpose_deletions = purposes.iter().map(|p| p.to_string()).collect();
        self
    }
}

/// Typed intent for a full-update column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullIntent {
    KeepCurrent,
    Clear,
    Replace(Vec<Value>),
}

/// Typed member set for a partial-update column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberSet {
    KeepCurrent,
    Values(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnChange {
    Full(FullIntent),
    Partial {
        additions: Option<MemberSet>,
        deletions: Option<MemberSet>,
    },
}

/// A validated, typed change to one column, shared by every target user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMutation {
    pub column: Column,
    pub data_type: DataType,
    pub change: ColumnChange,
    pub purpose_additions: Vec<Uuid>,
    pub purpose_deletions: Vec<Uuid>,
}

impl ColumnMutation {
    pub fn validate(&self) -> Result<()> {
        let name = &self.column.name;
        let additions: BTreeSet<Uuid> = self.purpose_additions.iter().copied().collect();
        if additions.len() != self.purpose_additions.len() {
            return Err(GovError::Validation(format!(
                "column '{name}' mutation has duplicate purpose additions"
            )));
        }
        let deletions: BTreeSet<Uuid> = self.purpose_deletions.iter().copied().collect();
        if deletions.len() != self.purpose_deletions.len() {
            return Err(GovError::Validation(format!(
                "column '{name}' mutation has duplicate purpose deletions"
            )));
        }
        match &self.change {
            ColumnChange::Partial {
                additions: value_additions,
                deletions: value_deletions,
            } => {
                if !self.column.constraints().partial_updates {
                    return Err(GovError::Validation(format!(
                        "column '{name}' does not support partial updates"
                    )));
                }
                match value_additions {
                    Some(MemberSet::Values(_)) if additions.is_empty() => {
                        return Err(GovError::Validation(format!(
                            "column '{name}' mutation has value addition with no purpose additions"
                        )));
                    }
                    None if !additions.is_empty() => {
                        return Err(GovError::Validation(format!(
                            "column '{name}' mutation has purpose additions with no value addition"
                        )));
                    }
                    _ => {}
                }
                if value_deletions.is_none() && !deletions.is_empty() {
                    return Err(GovError::Validation(format!(
                        "column '{name}' mutation has purpose deletions with no value deletion"
                    )));
                }
                if value_additions.is_none() && value_deletions.is_none() {
                    return Err(GovError::Validation(format!(
                        "column '{name}' mutation has no value addition or deletion"
                    )));
                }
            }
            ColumnChange::Full(_) => {
                if self.column.constraints().partial_updates {
                    return Err(GovError::Validation(format!(
                        "column '{name}' only accepts partial updates"
                    )));
                }
                if !additions.is_disjoint(&deletions) {
                    return Err(GovError::Validation(format!(
                        "column '{name}' mutation is trying to add and delete the same purpose"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Plans this mutation against one user's current live values.
    pub fn apply(&self, user_id: Uuid, existing: &[ColumnConsentedValue]) -> Result<AppliedMutation> {
        match &self.change {
            ColumnChange::Full(intent) => full::apply(self, intent, user_id, existing),
            ColumnChange::Partial {
                additions,
                deletions,
            } => partial::apply(self, additions.as_ref(), deletions.as_ref(), existing),
        }
    }
}

/// Purpose-set slot of an [`AppliedMutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PurposeScope {
    /// Purposes shared by every value of a full-update column.
    Shared,
    Value(Uuid),
}

/// A value the plan creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedValue {
    pub value: Value,
    pub ordering: i32,
    pub version: u32,
    pub purposes: BTreeSet<Uuid>,
}

/// Value and purpose changes one column mutation implies for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedMutation {
    pub added_values: Vec<AddedValue>,
    pub current_values: BTreeMap<Uuid, ColumnConsentedValue>,
    pub removed_values: BTreeMap<Uuid, ColumnConsentedValue>,
    pub current_purposes: BTreeMap<PurposeScope, BTreeSet<Uuid>>,
    pub updated_purposes: BTreeMap<PurposeScope, BTreeSet<Uuid>>,
    pub updated_ordering_value_ids: BTreeSet<Uuid>,
}

impl AppliedMutation {
    pub fn is_noop(&self) -> bool {
        self.added_values.is_empty()
            && self.removed_values.is_empty()
            && self.updated_ordering_value_ids.is_empty()
            && self.current_values.keys().all(|id| {
                let scope = PurposeScope::Value(*id);
                self.current_purposes.get(&scope) == self.updated_purposes.get(&scope)
            })
    }
}

/// Fails when two values of the resulting set share a key.
pub(crate) fn ensure_unique<'a>(
    mutation: &ColumnMutation,
    values: impl IntoIterator<Item = &'a Value>,
) -> Result<()> {
    let constraints = mutation.column.constraints();
    if !constraints.unique_required && !constraints.unique_id_required {
        return Ok(());
    }
    let mut seen = BTreeSet::new();
    for value in values {
        let key = if constraints.unique_required {
            mutation.data_type.comparable_key(value)
        } else {
            mutation.data_type.unique_key(value, true)?
        };
        if !seen.insert(key.clone()) {
            return Err(GovError::UniqueViolation {
                column: mutation.column.name.clone(),
                message: format!("value '{}' is not unique", value.to_plain_string()),
            });
        }
    }
    Ok(())
}

enum Pending {
    Keep,
    Clear,
    Default,
    Slots(Vec<usize>),
}

struct PendingColumn {
    column: Column,
    data_type: DataType,
    value: Option<Pending>,
    additions: Option<Pending>,
    deletions: Option<Pending>,
    purpose_additions: Vec<Uuid>,
    purpose_deletions: Vec<Uuid>,
}

fn push_inputs(
    batch: &mut TransformBatch,
    normalizer: &Transformer,
    column: &Column,
    raw: &JsonValue,
    array: bool,
) -> Result<Pending> {
    let items: Vec<&JsonValue> = match (array, raw) {
        (true, JsonValue::Array(items)) => items.iter().collect(),
        (true, _) => {
            return Err(GovError::Validation(format!(
                "column '{}' expects an array",
                column.name
            )));
        }
        (false, JsonValue::Array(_) | JsonValue::Null) => {
            return Err(GovError::Validation(format!(
                "column '{}' expects a single value",
                column.name
            )));
        }
        (false, single) => vec![single],
    };
    let slots = items
        .into_iter()
        .map(|item| {
            let input = match item {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            batch.push(
                normalizer,
                input,
                Provenance {
                    user_id: None,
                    column_id: column.id,
                    token_access_policy_id: None,
                },
            )
        })
        .collect();
    Ok(Pending::Slots(slots))
}

/// Turns a mutator's row data into typed column mutations.
///
/// All normalizer inputs across columns go to the transformer executor in one
/// call; outputs are parsed back through each column's data type.
pub fn prepare_mutations(
    mutator: &Mutator,
    row_data: &BTreeMap<String, ValueAndPurposes>,
    registry: &Registry,
    config: &dyn ConfigStore,
    executor: &dyn TransformerExecutor,
) -> Result<Vec<ColumnMutation>> {
    let mut batch = TransformBatch::new();
    let mut pending = Vec::with_capacity(mutator.columns.len());

    for mutator_column in &mutator.columns {
        let column = registry
            .find_column(mutator_column.column_id)
            .ok_or_else(|| {
                GovError::invalid_config(format!(
                    "column '{}' of mutator '{}' does not exist",
                    mutator_column.column_id, mutator.name
                ))
            })?;
        if column.attributes.immutable {
            return Err(GovError::Validation(format!(
                "column '{}' is immutable",
                column.name
            )));
        }
        let request = row_data
            .get(&column.name)
            .or_else(|| {
                row_data
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(&column.name))
                    .map(|(_, v)| v)
            })
            .ok_or_else(|| {
                let keys: Vec<&str> = row_data.keys().map(String::as_str).collect();
                GovError::Validation(format!(
                    "row data is missing column '{}': got keys {keys:?}",
                    column.name
                ))
            })?;
        let normalizer = config
            .transformer(mutator_column.normalizer_id)?
            .ok_or_else(|| {
                GovError::invalid_config(format!(
                    "normalizer '{}' of mutator '{}' does not exist",
                    mutator_column.normalizer_id, mutator.name
                ))
            })?;
        let data_type = registry.column_data_type(column)?.clone();
        let partial = column.constraints().partial_updates;

        let set = |batch: &mut TransformBatch,
                       requested: &Option<RequestValueSet>|
         -> Result<Option<Pending>> {
            Ok(match requested {
                None => None,
                Some(RequestValueSet::KeepCurrent) => Some(Pending::Keep),
                Some(RequestValueSet::Json(raw)) => {
                    Some(push_inputs(batch, &normalizer, column, raw, true)?)
                }
            })
        };

        let (value, additions, deletions) = if partial {
            if request.value != RequestValue::Absent {
                return Err(GovError::Validation(format!(
                    "column '{}' takes value additions and deletions, not a value",
                    column.name
                )));
            }
            (
                None,
                set(&mut batch, &request.value_additions)?,
                set(&mut batch, &request.value_deletions)?,
            )
        } else {
            if request.value_additions.is_some() || request.value_deletions.is_some() {
                return Err(GovError::Validation(format!(
                    "column '{}' does not support partial updates",
                    column.name
                )));
            }
            let value = match &request.value {
                RequestValue::Absent | RequestValue::Null => Pending::Clear,
                RequestValue::KeepCurrent => Pending::Keep,
                RequestValue::UseDefault => {
                    if column.default_value.is_none() {
                        return Err(GovError::Validation(format!(
                            "column '{}' does not have a default value",
                            column.name
                        )));
                    }
                    Pending::Default
                }
                RequestValue::Json(raw) => {
                    push_inputs(&mut batch, &normalizer, column, raw, column.is_array)?
                }
            };
            (Some(value), None, None)
        };

        let resolve = |refs: &[String]| -> Result<Vec<Uuid>> {
            refs.iter()
                .map(|r| registry.resolve_purpose(r).map(|p| p.id))
                .collect()
        };
        pending.push(PendingColumn {
            column: column.clone(),
            data_type,
            value,
            additions,
            deletions,
            purpose_additions: resolve(&request.purpose_additions)?,
            purpose_deletions: resolve(&request.purpose_deletions)?,
        });
    }

    if pending.len() != row_data.len() {
        return Err(GovError::Validation(format!(
            "row data has {} columns but mutator '{}' writes {}",
            row_data.len(),
            mutator.name,
            pending.len()
        )));
    }

    let normalized = batch.run(executor)?;
    let mut mutations = Vec::with_capacity(pending.len());
    for p in pending {
        let typed = |slots: &[usize]| -> Result<Vec<Value>> {
            slots
                .iter()
                .map(|&slot| {
                    let raw = normalized.get(slot).ok_or_else(|| {
                        GovError::Internal(format!("missing normalizer output {slot}"))
                    })?;
                    p.data_type.parse_str(raw).map_err(|e| {
                        GovError::Validation(format!("column '{}': {e}", p.column.name))
                    })
                })
                .collect()
        };
        let default_values = || -> Result<Vec<Value>> {
            let raw = p.column.default_value.clone().unwrap_or(JsonValue::Null);
            let items = match raw {
                JsonValue::Array(items) => items,
                single => vec![single],
            };
            items
                .iter()
                .map(|item| {
                    p.data_type.coerce_json(item).map_err(|e| {
                        GovError::invalid_config(format!(
                            "default value of column '{}': {e}",
                            p.column.name
                        ))
                    })
                })
                .collect()
        };
        let member_set = |pending: &Option<Pending>| -> Result<Option<MemberSet>> {
            Ok(match pending {
                None => None,
                Some(Pending::Slots(slots)) => Some(MemberSet::Values(typed(slots)?)),
                Some(_) => Some(MemberSet::KeepCurrent),
            })
        };
        let change = match &p.value {
            Some(Pending::Keep) => ColumnChange::Full(FullIntent::KeepCurrent),
            Some(Pending::Clear) => ColumnChange::Full(FullIntent::Clear),
            Some(Pending::Default) => ColumnChange::Full(FullIntent::Replace(default_values()?)),
            Some(Pending::Slots(slots)) => ColumnChange::Full(FullIntent::Replace(typed(slots)?)),
            None => ColumnChange::Partial {
                additions: member_set(&p.additions)?,
                deletions: member_set(&p.deletions)?,
            },
        };
        let mutation = ColumnMutation {
            column: p.column.clone(),
            data_type: p.data_type.clone(),
            change,
            purpose_additions: p.purpose_additions.clone(),
            purpose_deletions: p.purpose_deletions.clone(),
        };
        mutation.validate()?;
        mutations.push(mutation);
    }
    Ok(mutations)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::catalog::InMemoryConfigStore;
    use crate::catalog::schema::{MutatorColumn, Purpose};
    use crate::query::plan::Selector;
    use crate::policy::ALLOW_ALL_POLICY_ID;
    use crate::transform::{
        BuiltinTransformerExecutor, PASSTHROUGH_TRANSFORMER_ID, TransformFunction, TransformType,
        Transformer,
    };
    use serde_json::json;

    fn setup() -> (InMemoryConfigStore, Column, Column, Purpose, Transformer) {
        let store = InMemoryConfigStore::new();
        let nickname = nickname();
        let roles = roles();
        let marketing = Purpose::new("marketing");
        let lower = Transformer::new("lower", TransformType::Transform, TransformFunction::Lowercase);
        store.create_column(nickname.clone()).expect("nickname");
        store.create_column(roles.clone()).expect("roles");
        store.create_purpose(marketing.clone()).expect("purpose");
        store.create_transformer(lower.clone()).expect("transformer");
        (store, nickname, roles, marketing, lower)
    }

    fn mutator(columns: Vec<MutatorColumn>) -> Mutator {
        Mutator {
            id: Uuid::new_v4(),
            name: "profile_writer".into(),
            version: 1,
            selector: Selector::by_id(),
            columns,
            access_policy_id: ALLOW_ALL_POLICY_ID,
        }
    }

    #[test]
    fn row_data_is_normalized_in_one_batch() {
        let (store, nickname, roles, marketing, lower) = setup();
        let registry = Registry::load(&store).expect("registry");
        let writer = mutator(vec![
            MutatorColumn {
                column_id: nickname.id,
                normalizer_id: lower.id,
            },
            MutatorColumn {
                column_id: roles.id,
                normalizer_id: PASSTHROUGH_TRANSFORMER_ID,
            },
        ]);
        let row_data = BTreeMap::from([
            (
                "nickname".to_string(),
                ValueAndPurposes::value(json!("BOB")).adding_purposes(&["Marketing"]),
            ),
            (
                "roles".to_string(),
                ValueAndPurposes::additions(RequestValueSet::Json(json!(["admin"])))
                    .adding_purposes(&[&marketing.id.to_string()]),
            ),
        ]);
        let mutations =
            prepare_mutations(&writer, &row_data, &registry, &store, &BuiltinTransformerExecutor)
                .expect("prepare");
        assert_eq!(
            mutations[0].change,
            ColumnChange::Full(FullIntent::Replace(strings(&["bob"])))
        );
        assert_eq!(mutations[0].purpose_additions, vec![marketing.id]);
        assert_eq!(
            mutations[1].change,
            ColumnChange::Partial {
                additions: Some(MemberSet::Values(strings(&["admin"]))),
                deletions: None,
            }
        );
    }

    #[test]
    fn malformed_row_data_is_rejected() {
        let (store, nickname, roles, _, _) = setup();
        let registry = Registry::load(&store).expect("registry");
        let writer = mutator(vec![
            MutatorColumn {
                column_id: nickname.id,
                normalizer_id: PASSTHROUGH_TRANSFORMER_ID,
            },
            MutatorColumn {
                column_id: roles.id,
                normalizer_id: PASSTHROUGH_TRANSFORMER_ID,
            },
        ]);
        let cases = vec![
            // missing column
            BTreeMap::from([("nickname".to_string(), ValueAndPurposes::value(json!("a")))]),
            // array for a scalar column
            BTreeMap::from([
                ("nickname".to_string(), ValueAndPurposes::value(json!(["a"]))),
                ("roles".to_string(), ValueAndPurposes::additions(RequestValueSet::KeepCurrent)),
            ]),
            // value additions without purpose additions
            BTreeMap::from([
                ("nickname".to_string(), ValueAndPurposes::null()),
                (
                    "roles".to_string(),
                    ValueAndPurposes::additions(RequestValueSet::Json(json!(["x"]))),
                ),
            ]),
            // unknown purpose
            BTreeMap::from([
                (
                    "nickname".to_string(),
                    ValueAndPurposes::keep_current().adding_purposes(&["nope"]),
                ),
                ("roles".to_string(), ValueAndPurposes::additions(RequestValueSet::KeepCurrent)),
            ]),
            // no default value
            BTreeMap::from([
                ("nickname".to_string(), ValueAndPurposes::use_default()),
                ("roles".to_string(), ValueAndPurposes::additions(RequestValueSet::KeepCurrent)),
            ]),
        ];
        for row_data in cases {
            let err = prepare_mutations(
                &writer,
                &row_data,
                &registry,
                &store,
                &BuiltinTransformerExecutor,
            )
            .expect_err("invalid row data");
            assert_eq!(err.status(), 400, "{err}");
        }
    }

    #[test]
    fn full_columns_reject_adding_and_deleting_one_purpose() {
        let p = Uuid::new_v4();
        let m = mutation(nickname(), ColumnChange::Full(FullIntent::KeepCurrent), &[p], &[p]);
        assert!(m.validate().is_err());
        let dup = mutation(nickname(), ColumnChange::Full(FullIntent::KeepCurrent), &[p, p], &[]);
        assert!(dup.validate().is_err());
    }
}
