use super::{AddedValue, AppliedMutation, ColumnMutation, MemberSet, PurposeScope, ensure_unique};
use crate::catalog::types::{Value, ValueKey};
use crate::error::{GovError, Result};
use crate::storage::ColumnConsentedValue;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

enum Members {
    None,
    All,
    Keyed(HashMap<ValueKey, usize>),
}

impl Members {
    fn new(mutation: &ColumnMutation, set: Option<&MemberSet>, what: &str) -> Result<Self> {
        let values = match set {
            None => return Ok(Members::None),
            Some(MemberSet::KeepCurrent) => return Ok(Members::All),
            Some(MemberSet::Values(values)) => values,
        };
        let unique_id = mutation.column.constraints().unique_id_required;
        let mut keyed = HashMap::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            let key = mutation.data_type.unique_key(value, unique_id)?;
            if keyed.insert(key, i).is_some() {
                return Err(GovError::Validation(format!(
                    "column '{}' value {what} contain '{}' twice",
                    mutation.column.name,
                    value.to_plain_string()
                )));
            }
        }
        Ok(Members::Keyed(keyed))
    }

    fn lookup(&self, key: &ValueKey) -> Option<usize> {
        match self {
            Members::Keyed(keyed) => keyed.get(key).copied(),
            _ => None,
        }
    }
}

/// Plans a partial update: the request adds and removes individual members,
/// each carrying its own purposes.
pub(super) fn apply(
    mutation: &ColumnMutation,
    additions: Option<&MemberSet>,
    deletions: Option<&MemberSet>,
    existing: &[ColumnConsentedValue],
) -> Result<AppliedMutation> {
    let added_members: &[Value] = match additions {
        Some(MemberSet::Values(values)) => values,
        _ => &[],
    };
    let to_add = Members::new(mutation, additions, "additions")?;
    let to_delete = Members::new(mutation, deletions, "deletions")?;
    let purpose_additions: BTreeSet<Uuid> = mutation.purpose_additions.iter().copied().collect();
    let purpose_deletions: BTreeSet<Uuid> = mutation.purpose_deletions.iter().copied().collect();
    let unique_id = mutation.column.constraints().unique_id_required;

    let mut sorted: Vec<&ColumnConsentedValue> = existing.iter().collect();
    sorted.sort_by_key(|v| v.ordering);

    let mut applied = AppliedMutation::default();
    let mut consumed = vec![false; added_members.len()];

    for cv in &sorted {
        let current = cv.purpose_ids();
        let mut updated = current.clone();
        let key = mutation.data_type.unique_key(&cv.value, unique_id)?;

        let deleting = matches!(to_delete, Members::All) || to_delete.lookup(&key).is_some();
        if deleting {
            if purpose_deletions.is_empty() {
                updated.clear();
            } else {
                updated.retain(|p| !purpose_deletions.contains(p));
            }
        }

        if matches!(to_add, Members::All) {
            updated.extend(purpose_additions.iter().copied());
        } else if let Some(i) = to_add.lookup(&key) {
            consumed[i] = true;
            updated.extend(purpose_additions.iter().copied());
            let requested = &added_members[i];
            if *requested != cv.value {
                if mutation.column.constraints().immutable_required {
                    return Err(GovError::ImmutableViolation {
                        column: mutation.column.name.clone(),
                        message: format!("value with {key} cannot change"),
                    });
                }
                applied.added_values.push(AddedValue {
                    value: requested.clone(),
                    ordering: cv.ordering,
                    version: cv.version,
                    purposes: std::mem::take(&mut updated),
                });
            }
        }

        if updated.is_empty() {
            applied.removed_values.insert(cv.id, (*cv).clone());
        } else {
            applied.current_values.insert(cv.id, (*cv).clone());
            applied
                .current_purposes
                .insert(PurposeScope::Value(cv.id), current);
            applied
                .updated_purposes
                .insert(PurposeScope::Value(cv.id), updated);
        }
    }

    let mut next_ordering = sorted.last().map_or(1, |cv| cv.ordering + 1);
    for (value, _) in added_members
        .iter()
        .zip(&consumed)
        .filter(|(_, consumed)| !**consumed)
    {
        applied.added_values.push(AddedValue {
            value: value.clone(),
            ordering: next_ordering,
            version: 0,
            purposes: purpose_additions.clone(),
        });
        next_ordering += 1;
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
