use crate::catalog::Registry;
use crate::catalog::schema::Column;
use crate::catalog::types::Value;
use crate::error::{GovError, Result};
use crate::retention::DataLifeCycleState;
use crate::storage::UserRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use uuid::Uuid;

pub const MAX_SELECTOR_DEPTH: usize = 32;

/// Right-hand side of a selector comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Literal(JsonValue),
    /// Index into the request's selector values.
    Bind(usize),
}

/// Filter expression choosing the users an accessor or mutator acts on.
///
/// Column names resolve case-insensitively against user and system columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    All,
    IdIn(Vec<Uuid>),
    Eq(String, Operand),
    Ne(String, Operand),
    Lt(String, Operand),
    Lte(String, Operand),
    Gt(String, Operand),
    Gte(String, Operand),
    /// Operand must bind to a JSON array.
    In(String, Operand),
    Like(String, Operand),
    ILike(String, Operand),
    IsNull(String),
    And(Box<Selector>, Box<Selector>),
    Or(Box<Selector>, Box<Selector>),
    Not(Box<Selector>),
}

impl Selector {
    pub fn and(self, rhs: Selector) -> Selector {
        Selector::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Selector) -> Selector {
        Selector::Or(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Selector {
        Selector::Not(Box::new(self))
    }

    /// `id = ?`, the selector form used to address a single user.
    pub fn by_id() -> Selector {
        Selector::Eq("id".into(), Operand::Bind(0))
    }

    pub fn is_single_id_lookup(&self) -> bool {
        matches!(self, Selector::Eq(column, Operand::Bind(0)) if column.eq_ignore_ascii_case("id"))
    }

    pub fn depth(&self) -> usize {
        match self {
            Selector::And(a, b) | Selector::Or(a, b) => 1 + a.depth().max(b.depth()),
            Selector::Not(inner) => 1 + inner.depth(),
            _ => 1,
        }
    }

    pub fn validate_depth(&self, max_depth: usize) -> Result<()> {
        let depth = self.depth();
        if depth > max_depth {
            return Err(GovError::Validation(format!(
                "selector depth {depth} exceeds maximum allowed depth of {max_depth}"
            )));
        }
        Ok(())
    }

    fn bind_count(&self, max: &mut Option<usize>) {
        match self {
            Selector::Eq(_, o)
            | Selector::Ne(_, o)
            | Selector::Lt(_, o)
            | Selector::Lte(_, o)
            | Selector::Gt(_, o)
            | Selector::Gte(_, o)
            | Selector::In(_, o)
            | Selector::Like(_, o)
            | Selector::ILike(_, o) => {
                if let Operand::Bind(idx) = o {
                    *max = Some(max.map_or(*idx, |m| m.max(*idx)));
                }
            }
            Selector::And(a, b) | Selector::Or(a, b) => {
                a.bind_count(max);
                b.bind_count(max);
            }
            Selector::Not(inner) => inner.bind_count(max),
            Selector::All | Selector::IdIn(_) | Selector::IsNull(_) => {}
        }
    }

    /// Resolves columns and bind parameters into a typed [`Predicate`].
    pub fn bind(
        &self,
        values: &[JsonValue],
        registry: &Registry,
        max_depth: usize,
    ) -> Result<Predicate> {
        self.validate_depth(max_depth)?;
        let mut max = None;
        self.bind_count(&mut max);
        let expected = max.map_or(0, |m| m + 1);
        if expected != values.len() {
            return Err(GovError::Validation(format!(
                "selector expects {expected} values, got {}",
                values.len()
            )));
        }
        self.bind_inner(values, registry)
    }

    fn bind_inner(&self, values: &[JsonValue], registry: &Registry) -> Result<Predicate> {
        let compare = |name: &str, op: CompareOp, operand: &Operand| -> Result<Predicate> {
            let column = resolve_column(registry, name)?;
            let raw = operand_value(operand, values)?;
            let value = coerce_scalar(registry, column, raw)?;
            Ok(Predicate::Compare {
                column: ColumnRef::of(column),
                op,
                value,
            })
        };
        Ok(match self {
            Selector::All => Predicate::All,
            Selector::IdIn(ids) => Predicate::IdIn(ids.iter().copied().collect()),
            Selector::Eq(c, o) => compare(c, CompareOp::Eq, o)?,
            Selector::Ne(c, o) => compare(c, CompareOp::Ne, o)?,
            Selector::Lt(c, o) => compare(c, CompareOp::Lt, o)?,
            Selector::Lte(c, o) => compare(c, CompareOp::Lte, o)?,
            Selector::Gt(c, o) => compare(c, CompareOp::Gt, o)?,
            Selector::Gte(c, o) => compare(c, CompareOp::Gte, o)?,
            Selector::In(name, operand) => {
                let column = resolve_column(registry, name)?;
                let raw = operand_value(operand, values)?;
                let JsonValue::Array(items) = raw else {
                    return Err(GovError::Validation(format!(
                        "IN on column '{}' requires an array value",
                        column.name
                    )));
                };
                let values = items
                    .iter()
                    .map(|item| coerce_scalar(registry, column, item))
                    .collect::<Result<Vec<_>>>()?;
                Predicate::In {
                    column: ColumnRef::of(column),
                    values,
                }
            }
            Selector::Like(name, operand) | Selector::ILike(name, operand) => {
                let column = resolve_column(registry, name)?;
                let JsonValue::String(pattern) = operand_value(operand, values)? else {
                    return Err(GovError::Validation(format!(
                        "LIKE on column '{}' requires a string pattern",
                        column.name
                    )));
                };
                let case_insensitive = matches!(self, Selector::ILike(..));
                Predicate::Like {
                    column: ColumnRef::of(column),
                    pattern: if case_insensitive {
                        pattern.to_lowercase()
                    } else {
                        pattern.clone()
                    },
                    case_insensitive,
                }
            }
            Selector::IsNull(name) => {
                Predicate::IsNull(ColumnRef::of(resolve_column(registry, name)?))
            }
            Selector::And(a, b) => Predicate::And(
                Box::new(a.bind_inner(values, registry)?),
                Box::new(b.bind_inner(values, registry)?),
            ),
            Selector::Or(a, b) => Predicate::Or(
                Box::new(a.bind_inner(values, registry)?),
                Box::new(b.bind_inner(values, registry)?),
            ),
            Selector::Not(inner) => Predicate::Not(Box::new(inner.bind_inner(values, registry)?)),
        })
    }
}

fn resolve_column<'a>(registry: &'a Registry, name: &str) -> Result<&'a Column> {
    registry
        .find_column_by_name(name)
        .ok_or_else(|| GovError::Validation(format!("selector references unknown column '{name}'")))
}

fn operand_value<'a>(operand: &'a Operand, values: &'a [JsonValue]) -> Result<&'a JsonValue> {
    match operand {
        Operand::Literal(v) => Ok(v),
        Operand::Bind(idx) => values
            .get(*idx)
            .ok_or_else(|| GovError::Validation(format!("missing selector value {idx}"))),
    }
}

fn coerce_scalar(registry: &Registry, column: &Column, raw: &JsonValue) -> Result<Value> {
    let data_type = registry.column_data_type(column)?;
    data_type.coerce_json(raw).map_err(|e| {
        GovError::Validation(format!("selector value for column '{}': {e}", column.name))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    fn holds(self, ordering: std::cmp::Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering.is_eq(),
            CompareOp::Ne => !ordering.is_eq(),
            CompareOp::Lt => ordering.is_lt(),
            CompareOp::Lte => ordering.is_le(),
            CompareOp::Gt => ordering.is_gt(),
            CompareOp::Gte => ordering.is_ge(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub id: Uuid,
    pub name: String,
    pub system: bool,
}

impl ColumnRef {
    fn of(column: &Column) -> Self {
        Self {
            id: column.id,
            name: column.name.clone(),
            system: column.is_system(),
        }
    }
}

/// Selector with columns resolved and parameters bound, ready to evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    All,
    IdIn(BTreeSet<Uuid>),
    Compare {
        column: ColumnRef,
        op: CompareOp,
        value: Value,
    },
    In {
        column: ColumnRef,
        values: Vec<Value>,
    },
    Like {
        column: ColumnRef,
        pattern: String,
        case_insensitive: bool,
    },
    IsNull(ColumnRef),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Multi-valued columns match when any of their values matches.
    pub fn matches(&self, user: &UserRecord, state: DataLifeCycleState) -> bool {
        match self {
            Predicate::All => true,
            Predicate::IdIn(ids) => ids.contains(&user.id),
            Predicate::Compare { column, op, value } => column_values(user, column, state)
                .iter()
                .any(|v| same_kind(v, value) && op.holds(v.cmp(value))),
            Predicate::In { column, values } => column_values(user, column, state)
                .iter()
                .any(|v| values.contains(v)),
            Predicate::Like {
                column,
                pattern,
                case_insensitive,
            } => column_values(user, column, state).iter().any(|v| {
                let text = v.to_plain_string();
                if *case_insensitive {
                    like_match(&text.to_lowercase(), pattern)
                } else {
                    like_match(&text, pattern)
                }
            }),
            Predicate::IsNull(column) => column_values(user, column, state).is_empty(),
            Predicate::And(a, b) => a.matches(user, state) && b.matches(user, state),
            Predicate::Or(a, b) => a.matches(user, state) || b.matches(user, state),
            Predicate::Not(inner) => !inner.matches(user, state),
        }
    }
}

fn column_values(user: &UserRecord, column: &ColumnRef, state: DataLifeCycleState) -> Vec<Value> {
    if column.system {
        return user.system_value(&column.name).into_iter().collect();
    }
    user.values_for(state, column.id)
        .iter()
        .map(|v| v.value.clone())
        .collect()
}

fn same_kind(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

/// SQL LIKE with `%` and `_` wildcards.
pub fn like_match(value: &str, pattern: &str) -> bool {
    let text: Vec<char> = value.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    let mut ti = 0usize;
    let mut pi = 0usize;
    let mut star_pi: Option<usize> = None;
    let mut star_ti = 0usize;

    while ti < text.len() {
        if pi < pat.len() && (pat[pi] == '_' || pat[pi] == text[ti]) {
            ti += 1;
            pi += 1;
            continue;
        }
        if pi < pat.len() && pat[pi] == '%' {
            star_pi = Some(pi);
            pi += 1;
            star_ti = ti;
            continue;
        }
        if let Some(saved_pi) = star_pi {
            pi = saved_pi + 1;
            star_ti += 1;
            ti = star_ti;
            continue;
        }
        return false;
    }

    while pi < pat.len() && pat[pi] == '%' {
        pi += 1;
    }

    pi == pat.len()
}
