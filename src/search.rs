use crate::catalog::Registry;
use crate::error::Result;
use crate::query::plan::{Operand, Selector};
use crate::retention::DataLifeCycleState;
use crate::storage::UserRecord;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Substring query against one indexed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub column_id: Uuid,
    /// Lower-cased search term without wildcards.
    pub term: String,
}

impl SearchQuery {
    /// Derives a query from a `column LIKE ?` selector over a search-indexed
    /// column. Returns `None` when the selector has another shape.
    pub fn from_selector(selector: &Selector, values: &[JsonValue], registry: &Registry) -> Option<Self> {
        let (column, operand) = match selector {
            Selector::Like(column, operand) | Selector::ILike(column, operand) => (column, operand),
            _ => return None,
        };
        let column = registry.find_column_by_name(column)?;
        if !column.search_indexed {
            return None;
        }
        let pattern = match operand {
            Operand::Bind(idx) => values.get(*idx)?.as_str()?,
            Operand::Literal(JsonValue::String(s)) => s.as_str(),
            Operand::Literal(_) => return None,
        };
        let term = pattern.trim_start_matches('%').trim_end_matches('%');
        if term.is_empty() || term.contains(['%', '_']) {
            return None;
        }
        Some(Self {
            column_id: column.id,
            term: term.to_lowercase(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHits {
    pub user_ids: Vec<Uuid>,
    /// More users matched than the index returns.
    pub truncated: bool,
}

pub trait SearchIndex: Send + Sync {
    fn search(&self, query: &SearchQuery) -> Result<SearchHits>;

    /// Replaces everything indexed for `user`.
    fn index_user(&self, user: &UserRecord, registry: &Registry);

    fn remove_user(&self, user_id: Uuid);
}

/// Lower-cased live values of `search_indexed` columns, per column and user.
#[derive(Debug)]
pub struct InMemorySearchIndex {
    max_results: usize,
    entries: RwLock<BTreeMap<Uuid, BTreeMap<Uuid, Vec<String>>>>,
}

impl InMemorySearchIndex {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results,
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl SearchIndex for InMemorySearchIndex {
    /// Exact matches rank before prefix matches, which rank before other
    /// substring matches; ties break by user id.
    fn search(&self, query: &SearchQuery) -> Result<SearchHits> {
        let entries = self.entries.read();
        let Some(per_user) = entries.get(&query.column_id) else {
            return Ok(SearchHits::default());
        };
        let mut ranked: Vec<(u8, Uuid)> = per_user
            .iter()
            .filter_map(|(user_id, values)| {
                values
                    .iter()
                    .filter_map(|v| {
                        if *v == query.term {
                            Some(0)
                        } else if v.starts_with(&query.term) {
                            Some(1)
                        } else if v.contains(&query.term) {
                            Some(2)
                        } else {
                            None
                        }
                    })
                    .min()
                    .map(|rank| (rank, *user_id))
            })
            .collect();
        ranked.sort_unstable();
        let truncated = ranked.len() > self.max_results;
        Ok(SearchHits {
            user_ids: ranked
                .into_iter()
                .take(self.max_results)
                .map(|(_, id)| id)
                .collect(),
            truncated,
        })
    }

    fn index_user(&self, user: &UserRecord, registry: &Registry) {
        let mut entries = self.entries.write();
        for per_user in entries.values_mut() {
            per_user.remove(&user.id);
        }
        if user.is_deleted() {
            return;
        }
        for column in registry.columns().iter().filter(|c| c.search_indexed) {
            let values: Vec<String> = if column.is_system() {
                user.system_value(&column.name)
                    .map(|v| v.to_plain_string().to_lowercase())
                    .into_iter()
                    .collect()
            } else {
                user.values_for(DataLifeCycleState::Live, column.id)
                    .iter()
                    .map(|v| v.value.to_plain_string().to_lowercase())
                    .collect()
            };
            if !values.is_empty() {
                entries.entry(column.id).or_default().insert(user.id, values);
            }
        }
    }

    fn remove_user(&self, user_id: Uuid) {
        for per_user in self.entries.write().values_mut() {
            per_user.remove(&user_id);
        }
    }
}

/// Orders search hits by id in scan direction and keeps the `take` ids after
/// `cursor`, so id-sorted pages over search results stay stable.
pub fn reslice_after_cursor(
    user_ids: Vec<Uuid>,
    cursor: Option<Uuid>,
    ascending: bool,
    take: usize,
) -> Vec<Uuid> {
    let mut ids: BTreeSet<Uuid> = user_ids.into_iter().collect();
    if let Some(cursor) = cursor {
        ids.insert(cursor);
    }
    let mut ordered: Vec<Uuid> = ids.into_iter().collect();
    if !ascending {
        ordered.reverse();
    }
    let first = match cursor {
        Some(cursor) => ordered
            .iter()
            .position(|id| *id == cursor)
            .map_or(0, |pos| pos + 1),
        None => 0,
    };
    ordered.into_iter().skip(first).take(take).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::{Column, DataType, STRING_TYPE_ID};
    use crate::catalog::types::Value;
    use crate::retention::RetentionTimeout;
    use crate::storage::{ColumnConsentedValue, ConsentedPurpose};
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;

    fn registry() -> (Registry, Column) {
        let email = Column::new("email", STRING_TYPE_ID, false).searchable();
        let mut columns = Column::system_columns();
        columns.push(email.clone());
        columns.push(Column::new("nickname", STRING_TYPE_ID, false));
        (Registry::from_parts(columns, vec![], DataType::natives()), email)
    }

    fn user_with_email(email: &Column, address: &str) -> UserRecord {
        let mut user = UserRecord::new(Uuid::new_v4(), "eu", Utc::now());
        user.push_value(
            DataLifeCycleState::Live,
            ColumnConsentedValue {
                id: Uuid::new_v4(),
                version: 0,
                column_id: email.id,
                column_name: email.name.clone(),
                ordering: 1,
                value: Value::String(address.into()),
                consented_purposes: vec![ConsentedPurpose {
                    purpose_id: Uuid::new_v4(),
                    retention_timeout: RetentionTimeout::Indefinite,
                }],
            },
        );
        user
    }

    #[test]
    fn like_selectors_on_indexed_columns_become_queries() {
        let (registry, email) = registry();
        let selector = Selector::ILike("EMAIL".into(), Operand::Bind(0));
        let query = SearchQuery::from_selector(&selector, &[json!("%Alice%")], &registry)
            .expect("searchable");
        assert_eq!(query.column_id, email.id);
        assert_eq!(query.term, "alice");

        let unindexed = Selector::Like("nickname".into(), Operand::Bind(0));
        assert!(SearchQuery::from_selector(&unindexed, &[json!("%a%")], &registry).is_none());
        assert!(SearchQuery::from_selector(&selector, &[json!("a_c")], &registry).is_none());
    }

    #[test]
    fn hits_are_ranked_and_truncated() {
        let (registry, email) = registry();
        let index = InMemorySearchIndex::new(2);
        let exact = user_with_email(&email, "ann@x.io");
        let prefix = user_with_email(&email, "ann@x.io.backup");
        let inner = user_with_email(&email, "joann@x.io");
        for user in [&inner, &prefix, &exact] {
            index.index_user(user, &registry);
        }
        let query = SearchQuery {
            column_id: email.id,
            term: "ann@x.io".into(),
        };
        let hits = index.search(&query).expect("search");
        assert_eq!(hits.user_ids, vec![exact.id, prefix.id]);
        assert!(hits.truncated);

        index.remove_user(exact.id);
        let hits = index.search(&query).expect("search");
        assert_eq!(hits.user_ids, vec![prefix.id, inner.id]);
        assert!(!hits.truncated);
    }

    #[test]
    fn reslice_starts_after_the_cursor() {
        let ids: Vec<Uuid> = (1..=5u128).map(Uuid::from_u128).collect();
        let page = reslice_after_cursor(ids.clone(), Some(ids[1]), true, 2);
        assert_eq!(page, vec![ids[2], ids[3]]);
        let back = reslice_after_cursor(ids.clone(), Some(ids[3]), false, 10);
        assert_eq!(back, vec![ids[2], ids[1], ids[0]]);
        // A cursor that is no longer a hit still positions the slice.
        let gone = Uuid::from_u128(3);
        let without: Vec<Uuid> = ids.iter().copied().filter(|id| *id != gone).collect();
        assert_eq!(
            reslice_after_cursor(without, Some(gone), true, 5),
            vec![ids[3], ids[4]]
        );
    }

    proptest! {
        #[test]
        fn reslice_never_returns_the_cursor(raw in proptest::collection::vec(any::<u128>(), 0..40), pick in any::<prop::sample::Index>(), take in 0usize..50) {
            let ids: Vec<Uuid> = raw.iter().copied().map(Uuid::from_u128).collect();
            let cursor = if ids.is_empty() { None } else { Some(ids[pick.index(ids.len())]) };
            let out = reslice_after_cursor(ids, cursor, true, take);
            prop_assert!(out.len() <= take);
            prop_assert!(cursor.is_none_or(|c| out.iter().all(|id| *id > c)));
            prop_assert!(out.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
