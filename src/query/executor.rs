use crate::EngineContext;
use crate::catalog::schema::{Accessor, Column};
use crate::catalog::types::Value;
use crate::catalog::{MissingReference, Registry};
use crate::context::per_region;
use crate::error::{GovError, ResourceType, Result};
use crate::policy::{AccessPolicy, GLOBAL_ACCESSOR_POLICY_ID, PolicyAction, PolicyContext};
use crate::query::page::{PaginationOptions, Paginator, SortOrder};
use crate::query::plan::Predicate;
use crate::retention::DataLifeCycleState;
use crate::search::{SearchQuery, reslice_after_cursor};
use crate::storage::{UserQuery, UserRecord};
use crate::transform::{
    PASSTHROUGH_TRANSFORMER_ID, Provenance, TransformBatch, TransformType, Transformer,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeSet, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessorRequest {
    pub accessor_id: Uuid,
    /// Latest version when unset.
    #[serde(default)]
    pub accessor_version: Option<u32>,
    /// Client-supplied context handed to access policies.
    #[serde(default)]
    pub context: Map<String, JsonValue>,
    #[serde(default)]
    pub selector_values: Vec<JsonValue>,
    /// Restricts the read to one data region.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub pagination: PaginationOptions,
    #[serde(default)]
    pub debug: bool,
}

impl AccessorRequest {
    pub fn new(accessor_id: Uuid, selector_values: Vec<JsonValue>) -> Self {
        Self {
            accessor_id,
            selector_values,
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: Map<String, JsonValue>) -> Self {
        self.context = context;
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationOptions) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn debugging(mut self) -> Self {
        self.debug = true;
        self
    }
}

/// Counters and policy console output for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessorDebug {
    pub access_policy_console: Vec<String>,
    pub search_rows: usize,
    pub candidate_rows: usize,
    pub denied_rows: usize,
    pub returned_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessorResponse {
    pub data: Vec<Map<String, JsonValue>>,
    pub has_next: bool,
    pub next: Option<String>,
    pub has_prev: bool,
    pub prev: Option<String>,
    /// The search index returned fewer users than matched.
    pub truncated: bool,
    #[serde(default)]
    pub debug: Option<AccessorDebug>,
}

struct OutputColumn {
    column: Column,
    transformer: Transformer,
    token_access_policy_id: Option<Uuid>,
}

enum Cell {
    Literal(JsonValue),
    Slot(usize),
}

enum Rendered {
    Scalar(Cell),
    Array(Vec<Cell>),
}

/// Executes one accessor call: resolve, select, filter by policy, page and
/// transform.
pub struct AccessorExecution<'a> {
    ctx: &'a EngineContext,
    request: AccessorRequest,
    accessor: Accessor,
    registry: std::sync::Arc<Registry>,
    columns: Vec<OutputColumn>,
    purpose_ids: BTreeSet<Uuid>,
    policy: AccessPolicy,
    policy_context: PolicyContext,
    paginator: Paginator,
    debug: AccessorDebug,
    truncated: bool,
}

impl<'a> AccessorExecution<'a> {
    pub fn prepare(ctx: &'a EngineContext, request: AccessorRequest) -> Result<Self> {
        let store = ctx.config_store.as_ref();
        let accessor = store
            .accessor(request.accessor_id, request.accessor_version)?
            .ok_or_else(|| GovError::not_found(ResourceType::Accessor, request.accessor_id))?;
        let registry = ctx.registry()?;

        let column_ids: Vec<Uuid> = accessor.columns.iter().map(|c| c.column_id).collect();
        let resolved = registry.resolve_columns(&column_ids, MissingReference::Fail)?;
        let mut columns = Vec::with_capacity(resolved.len());
        for (spec, column) in accessor.columns.iter().zip(resolved) {
            let (transformer_id, token_access_policy_id) = match spec.transformer_id {
                Some(id) => (id, spec.token_access_policy_id),
                None => (
                    column
                        .default_transformer_id
                        .unwrap_or(PASSTHROUGH_TRANSFORMER_ID),
                    column.default_token_access_policy_id,
                ),
            };
            let transformer = store.transformer(transformer_id)?.ok_or_else(|| {
                GovError::invalid_config(format!(
                    "transformer '{transformer_id}' of column '{}' does not exist",
                    column.name
                ))
            })?;
            columns.push(OutputColumn {
                column: column.clone(),
                transformer,
                token_access_policy_id,
            });
        }

        let purposes = registry.resolve_purposes(&accessor.purpose_ids, MissingReference::Fail)?;
        let purpose_names = purposes.iter().map(|p| p.name.clone()).collect();
        let purpose_ids = purposes.iter().map(|p| p.id).collect();

        let policy = Self::composite_policy(ctx, &accessor, &columns)?;
        let paginator = Paginator::new(&request.pagination, &registry, &ctx.config)?;
        let policy_context =
            PolicyContext::new(PolicyAction::Read, request.context.clone(), purpose_names);

        Ok(Self {
            ctx,
            request,
            accessor,
            registry,
            columns,
            purpose_ids,
            policy,
            policy_context,
            paginator,
            debug: AccessorDebug::default(),
            truncated: false,
        })
    }

    /// AND of the global accessor policy, the accessor's own policy and each
    /// distinct column policy unless the accessor overrides column policies.
    fn composite_policy(
        ctx: &EngineContext,
        accessor: &Accessor,
        columns: &[OutputColumn],
    ) -> Result<AccessPolicy> {
        let load = |id: Uuid| -> Result<AccessPolicy> {
            ctx.config_store.access_policy(id, None)?.ok_or_else(|| {
                GovError::invalid_config(format!(
                    "access policy '{id}' of accessor '{}' does not exist",
                    accessor.name
                ))
            })
        };
        let own = load(accessor.access_policy_id)?;
        let mut components = vec![load(GLOBAL_ACCESSOR_POLICY_ID)?, own.clone()];
        if !accessor.are_column_access_policies_overridden {
            let mut seen = HashSet::new();
            for column in columns {
                if let Some(id) = column.column.access_policy_id
                    && seen.insert(id)
                {
                    components.push(load(id)?);
                }
            }
        }
        Ok(AccessPolicy::composite_and(&own, components))
    }

    fn state(&self) -> DataLifeCycleState {
        self.accessor.data_life_cycle_state
    }

    fn empty_response(&self) -> AccessorResponse {
        AccessorResponse {
            debug: self.request.debug.then(|| self.debug.clone()),
            ..AccessorResponse::default()
        }
    }

    pub async fn run(mut self) -> Result<AccessorResponse> {
        let started = Instant::now();

        if self.paginator.is_initial()
            && !self
                .ctx
                .evaluator
                .check_rate_threshold(&self.policy, self.accessor.id, Utc::now())?
        {
            warn!(accessor_id = %self.accessor.id, "accessor execution hit its rate threshold");
            if self.policy.thresholds.announce_max_execution_failure {
                return Err(GovError::RateThresholdExceeded {
                    policy: self.policy.name.clone(),
                });
            }
            return Ok(self.empty_response());
        }

        let Some(predicate) = self.candidate_predicate()? else {
            return Ok(self.empty_response());
        };
        let candidates = self.select_candidates(predicate).await?;
        self.debug.candidate_rows = candidates.len();

        let Some(page) = self.filter_allowed(candidates)? else {
            return Ok(self.empty_response());
        };
        let (next, prev) = self.cursors(&page)?;
        let data = self.transform(&page.users)?;
        self.debug.returned_rows = data.len();

        info!(
            accessor_id = %self.accessor.id,
            version = self.accessor.version,
            candidates = self.debug.candidate_rows,
            denied = self.debug.denied_rows,
            returned = data.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "accessor executed"
        );
        Ok(AccessorResponse {
            data,
            has_next: next.is_some(),
            next,
            has_prev: prev.is_some(),
            prev,
            truncated: self.truncated,
            debug: self.request.debug.then(|| self.debug.clone()),
        })
    }

    fn scans_ascending(&self) -> bool {
        self.paginator.is_forward() == (self.paginator.order() == SortOrder::Ascending)
    }

    /// `None` when a search returned no users.
    fn candidate_predicate(&mut self) -> Result<Option<Predicate>> {
        let search = match (&self.ctx.search, self.accessor.use_search_index) {
            (Some(index), true) => SearchQuery::from_selector(
                &self.accessor.selector,
                &self.request.selector_values,
                &self.registry,
            )
            .map(|query| (index, query)),
            _ => None,
        };
        let Some((index, query)) = search else {
            return self
                .accessor
                .selector
                .bind(
                    &self.request.selector_values,
                    &self.registry,
                    self.ctx.config.max_selector_depth,
                )
                .map(Some);
        };

        let hits = index.search(&query)?;
        self.debug.search_rows = hits.user_ids.len();
        self.truncated = hits.truncated;
        if hits.user_ids.is_empty() {
            return Ok(None);
        }
        let ids = if self.paginator.sorts_by_id_only() {
            reslice_after_cursor(
                hits.user_ids,
                self.paginator.cursor_id(),
                self.scans_ascending(),
                self.paginator.fetch_limit(),
            )
        } else {
            hits.user_ids
        };
        debug!(
            accessor_id = %self.accessor.id,
            hits = self.debug.search_rows,
            kept = ids.len(),
            truncated = self.truncated,
            "resolved candidates via search"
        );
        Ok(Some(Predicate::IdIn(ids.into_iter().collect())))
    }

    async fn select_candidates(&self, predicate: Predicate) -> Result<Vec<UserRecord>> {
        let window = self.paginator.window();
        let query = UserQuery {
            predicate,
            state: self.state(),
            page: Some(window.clone()),
        };
        let stores = self.ctx.target_regions(self.request.region.as_deref())?;
        let results = per_region(stores, move |store| store.select_users(&query)).await;

        let mut candidates = Vec::new();
        let mut contributing = 0;
        for (region, result) in results {
            let users = result.inspect_err(|e| {
                warn!(region = %region, error = ?e, "candidate selection failed");
            })?;
            if !users.is_empty() {
                contributing += 1;
            }
            candidates.extend(users);
        }
        if contributing > 1 {
            window.sort_merged(&mut candidates, self.state());
        }
        Ok(candidates)
    }

    /// Applies the access policy to candidates in scan order. `None` when the
    /// result threshold was exceeded without being announced.
    fn filter_allowed(&mut self, mut candidates: Vec<UserRecord>) -> Result<Option<Page>> {
        let limit = self.paginator.limit();
        let max_results = self.policy.thresholds.max_results.unwrap_or(0);
        let mut has_more = false;

        let cap = limit.saturating_mul(self.paginator.limit_multiplier());
        if candidates.len() > cap {
            has_more = true;
            candidates.truncate(cap);
        }
        let mut first = candidates.first().cloned();
        let mut last = candidates.last().cloned();

        let total = candidates.len();
        let mut allowed: Vec<UserRecord> = Vec::new();
        let mut num_allowed = 0usize;
        for (i, user) in candidates.into_iter().enumerate() {
            let profile = user.profile(&self.registry, self.state(), Some(&self.purpose_ids));
            let decision = self
                .ctx
                .evaluator
                .evaluate(&self.policy, &self.policy_context.for_user(profile))?;
            if self.request.debug && !decision.console.is_empty() {
                self.debug.access_policy_console.push(decision.console);
            }
            if !decision.allowed {
                if allowed.len() < limit {
                    self.debug.denied_rows += 1;
                }
                continue;
            }

            if allowed.len() < limit {
                allowed.push(user);
                if allowed.len() == limit {
                    last = allowed.last().cloned();
                    has_more = has_more || i + 1 < total;
                    if max_results == 0 {
                        break;
                    }
                }
            }

            num_allowed += 1;
            if max_results > 0 && num_allowed > max_results {
                warn!(
                    accessor_id = %self.accessor.id,
                    num_allowed,
                    max_results,
                    announce = self.policy.thresholds.announce_max_result_failure,
                    "accessor execution hit its result threshold"
                );
                if self.policy.thresholds.announce_max_result_failure {
                    return Err(GovError::ResultThresholdExceeded {
                        policy: self.policy.name.clone(),
                        max_results,
                    });
                }
                return Ok(None);
            }
        }

        if !self.paginator.is_forward() {
            allowed.reverse();
            std::mem::swap(&mut first, &mut last);
        }
        Ok(Some(Page {
            users: allowed,
            first,
            last,
            has_more,
        }))
    }

    fn cursor_of(&self, user: Option<&UserRecord>) -> Result<Option<String>> {
        match user {
            Some(user) => Ok(Some(self.paginator.cursor_for(user, self.state())?)),
            None => Ok(None),
        }
    }

    /// `(next, prev)` cursors for the page.
    fn cursors(&self, page: &Page) -> Result<(Option<String>, Option<String>)> {
        if self.paginator.is_forward() {
            let next = if page.has_more {
                self.cursor_of(page.last.as_ref())?
            } else {
                None
            };
            let prev = if self.paginator.is_initial() || page.users.is_empty() {
                None
            } else {
                self.cursor_of(page.first.as_ref())?
            };
            Ok((next, prev))
        } else {
            let prev = if page.has_more {
                self.cursor_of(page.first.as_ref())?
            } else {
                None
            };
            let next = if page.users.is_empty() {
                None
            } else {
                self.cursor_of(page.last.as_ref())?
            };
            Ok((next, prev))
        }
    }

    fn transform(&self, users: &[UserRecord]) -> Result<Vec<Map<String, JsonValue>>> {
        let state = self.state();
        let mut batch = TransformBatch::new();
        let mut rows: Vec<Vec<(String, bool, Option<Rendered>)>> = Vec::with_capacity(users.len());

        for user in users {
            let mut row = Vec::with_capacity(self.columns.len());
            for out in &self.columns {
                let column = &out.column;
                let values: Vec<_> = if column.is_system() {
                    user.system_value(&column.name).into_iter().collect()
                } else {
                    user.values_for(state, column.id)
                        .iter()
                        .filter(|v| v.consented_for_all(&self.purpose_ids))
                        .map(|v| v.value.clone())
                        .collect()
                };
                let as_array = column.is_array
                    || (state == DataLifeCycleState::SoftDeleted && !column.is_system());
                if values.is_empty() {
                    row.push((column.name.clone(), as_array, None));
                    continue;
                }
                let provenance = Provenance {
                    user_id: Some(user.id),
                    column_id: column.id,
                    token_access_policy_id: out.token_access_policy_id,
                };
                let mut cell = |value: &Value| -> Cell {
                    if out.transformer.is_passthrough() {
                        Cell::Literal(value.to_json())
                    } else {
                        Cell::Slot(batch.push(
                            &out.transformer,
                            value.to_plain_string(),
                            provenance.clone(),
                        ))
                    }
                };
                let by_reference =
                    out.transformer.transform_type == TransformType::TokenizeByReference;
                let rendered = if by_reference {
                    // One token stands for the whole column.
                    let token = cell(&values[0]);
                    if as_array {
                        Rendered::Array(vec![token])
                    } else {
                        Rendered::Scalar(token)
                    }
                } else if as_array {
                    Rendered::Array(values.iter().map(&mut cell).collect())
                } else {
                    Rendered::Scalar(cell(&values[0]))
                };
                row.push((column.name.clone(), as_array, Some(rendered)));
            }
            rows.push(row);
        }

        if batch.remote_len() > 0 {
            debug!(
                accessor_id = %self.accessor.id,
                values = batch.remote_len(),
                "transforming accessor output"
            );
        }
        let mut outputs = batch.run(self.ctx.transformers.as_ref())?;
        let mut take = |cell: Cell| -> JsonValue {
            match cell {
                Cell::Literal(json) => json,
                Cell::Slot(slot) => outputs
                    .get_mut(slot)
                    .map(|s| JsonValue::String(std::mem::take(s)))
                    .unwrap_or(JsonValue::Null),
            }
        };

        let mut data = Vec::with_capacity(rows.len());
        for row in rows {
            let mut object = Map::new();
            for (name, as_array, rendered) in row {
                let value = match rendered {
                    None if as_array => JsonValue::Array(Vec::new()),
                    None => JsonValue::Null,
                    Some(Rendered::Scalar(cell)) => take(cell),
                    Some(Rendered::Array(cells)) => {
                        JsonValue::Array(cells.into_iter().map(&mut take).collect())
                    }
                };
                object.insert(name, value);
            }
            data.push(object);
        }
        Ok(data)
    }
}

struct Page {
    users: Vec<UserRecord>,
    /// Boundary candidates in presentation order; cursors are taken from
    /// them even when policy filtered them out.
    first: Option<UserRecord>,
    last: Option<UserRecord>,
    has_more: bool,
}

/// Resolves and runs an accessor against the engine's collaborators.
pub async fn execute_accessor(
    ctx: &EngineContext,
    request: AccessorRequest,
) -> Result<AccessorResponse> {
    let accessor_id = request.accessor_id;
    let execution = AccessorExecution::prepare(ctx, request).inspect_err(|e| {
        debug!(accessor_id = %accessor_id, error = %e, "accessor could not be prepared");
    })?;
    execution.run().await
}
