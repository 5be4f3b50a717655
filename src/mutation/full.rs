use super::{
    AddedValue, AppliedMutation, ColumnMutation, FullIntent, PurposeScope, ensure_unique,
};
use crate::catalog::types::{Value, ValueKey};
use crate::error::{GovError, Result};
use crate::storage::ColumnConsentedValue;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::warn;
use uuid::Uuid;

/// Requested values grouped by comparable key, in first-seen order.
///
/// Each key holds the 1-based request positions still waiting for a match.
#[derive(Default)]
struct RequestedValues {
    index: HashMap<ValueKey, usize>,
    entries: Vec<(Value, VecDeque<i32>)>,
}

impl RequestedValues {
    fn new(mutation: &ColumnMutation, values: &[Value]) -> Self {
        let mut requested = Self::default();
        for (pos, value) in values.iter().enumerate() {
            let key = mutation.data_type.comparable_key(value);
            let ordering = pos as i32 + 1;
            match requested.index.get(&key) {
                Some(&i) => requested.entries[i].1.push_back(ordering),
                None => {
                    requested.index.insert(key, requested.entries.len());
                    requested
                        .entries
                        .push((value.clone(), VecDeque::from([ordering])));
                }
            }
        }
        requested
    }

    fn take(&mut self, key: &ValueKey) -> Option<i32> {
        let i = *self.index.get(key)?;
        self.entries[i].1.pop_front()
    }

    fn remaining(self) -> impl Iterator<Item = (Value, i32)> {
        self.entries
            .into_iter()
            .flat_map(|(value, orderings)| orderings.into_iter().map(move |o| (value.clone(), o)))
    }
}

/// Plans a full update: the request is the column's complete new value list.
///
/// Every value of a full-update column shares one purpose set. Stored values
/// that disagree are narrowed to the purposes they have in common.
pub(super) fn apply(
    mutation: &ColumnMutation,
    intent: &FullIntent,
    user_id: Uuid,
    existing: &[ColumnConsentedValue],
) -> Result<AppliedMutation> {
    let (keep_current, additions, deletions): (bool, BTreeSet<Uuid>, BTreeSet<Uuid>) =
        match intent {
            FullIntent::Clear => (
                false,
                BTreeSet::new(),
                mutation
                    .purpose_additions
                    .iter()
                    .chain(&mutation.purpose_deletions)
                    .copied()
                    .collect(),
            ),
            _ => (
                matches!(intent, FullIntent::KeepCurrent),
                mutation.purpose_additions.iter().copied().collect(),
                mutation.purpose_deletions.iter().copied().collect(),
            ),
        };
    let requested_values: &[Value] = match intent {
        FullIntent::Replace(values) => values,
        _ => &[],
    };

    let mut sorted: Vec<&ColumnConsentedValue> = existing.iter().collect();
    sorted.sort_by_key(|v| v.ordering);

    if !keep_current {
        check_immutable(mutation, requested_values, &sorted)?;
    }

    let mut requested = RequestedValues::new(mutation, requested_values);
    let mut applied = AppliedMutation::default();
    applied
        .current_purposes
        .insert(PurposeScope::Shared, BTreeSet::new());

    for cv in sorted {
        let purposes = cv.purpose_ids();
        if purposes.len() != cv.consented_purposes.len() {
            return Err(GovError::Internal(format!(
                "value {} of column '{}' has duplicate consented purposes",
                cv.id, mutation.column.name
            )));
        }

        let shared = applied
            .current_purposes
            .get(&PurposeScope::Shared)
            .cloned()
            .unwrap_or_default();
        if shared.is_empty() {
            applied
                .current_purposes
                .insert(PurposeScope::Shared, purposes.clone());
            applied
                .current_purposes
                .insert(PurposeScope::Value(cv.id), purposes);
        } else if shared != purposes {
            warn!(
                user_id = %user_id,
                column = %mutation.column.name,
                value_id = %cv.id,
                "values of a full-update column disagree on purposes; narrowing to the common set"
            );
            let common: BTreeSet<Uuid> = shared.intersection(&purposes).copied().collect();
            applied
                .current_purposes
                .insert(PurposeScope::Value(cv.id), common.clone());
            for scoped in applied.current_purposes.values_mut() {
                *scoped = common.clone();
            }
        } else {
            applied
                .current_purposes
                .insert(PurposeScope::Value(cv.id), purposes);
        }

        if keep_current {
            applied.current_values.insert(cv.id, cv.clone());
            continue;
        }
        let key = mutation.data_type.comparable_key(&cv.value);
        match requested.take(&key) {
            None => {
                applied.removed_values.insert(cv.id, cv.clone());
            }
            Some(ordering) => {
                let mut current = cv.clone();
                if ordering != cv.ordering {
                    applied.updated_ordering_value_ids.insert(cv.id);
                    current.ordering = ordering;
                }
                applied.current_values.insert(cv.id, current);
            }
        }
    }

    let updated = |current: &BTreeSet<Uuid>| -> BTreeSet<Uuid> {
        current
            .union(&additions)
            .filter(|p| !deletions.contains(p))
            .copied()
            .collect()
    };

    let shared_updated = updated(
        applied
            .current_purposes
            .get(&PurposeScope::Shared)
            .unwrap_or(&BTreeSet::new()),
    );
    applied
        .updated_purposes
        .insert(PurposeScope::Shared, shared_updated.clone());

    let current_ids: Vec<Uuid> = applied.current_values.keys().copied().collect();
    for id in current_ids {
        let scope = PurposeScope::Value(id);
        let purposes = updated(applied.current_purposes.get(&scope).unwrap_or(&BTreeSet::new()));
        if purposes.is_empty() {
            if let Some(cv) = applied.current_values.remove(&id) {
                applied.updated_ordering_value_ids.remove(&id);
                applied.removed_values.insert(id, cv);
            }
            continue;
        }
        applied.updated_purposes.insert(scope, purposes);
    }

    if !keep_current && !shared_updated.is_empty() {
        for (value, ordering) in requested.remaining() {
            applied.added_values.push(AddedValue {
                value,
                ordering,
                version: 0,
                purposes: shared_updated.clone(),
            });
        }
    }

    ensure_unique(
        mutation,
        applied
            .current_values
            .values()
            .map(|cv| &cv.value)
            .chain(applied.added_values.iter().map(|a| &a.value)),
    )?;
    Ok(applied)
}

/// Values keeping their unique id must keep their content, fields ignored
/// for uniqueness included.
fn check_immutable(
    mutation: &ColumnMutation,
    requested: &[Value],
    existing: &[&ColumnConsentedValue],
) -> Result<()> {
    let constraints = mutation.column.constraints();
    if !constraints.immutable_required
        || !constraints.unique_id_required
        || !mutation.data_type.is_composite()
        || requested.is_empty()
        || existing.is_empty()
    {
        return Ok(());
    }
    let mut stored: HashMap<ValueKey, &Value> = HashMap::with_capacity(existing.len());
    for cv in existing {
        stored.insert(mutation.data_type.unique_key(&cv.value, true)?, &cv.value);
    }
    for value in requested {
        let id = mutation.data_type.unique_key(value, true)?;
        if let Some(&content) = stored.get(&id)
            && content != value
        {
            return Err(GovError::ImmutableViolation {
                column: mutation.column.name.clone(),
                message: format!("value with {id} cannot change"),
            });
        }
    }
    Ok(())
}
