use crate::EngineContext;
use crate::catalog::Registry;
use crate::catalog::schema::Mutator;
use crate::context::per_region;
use crate::error::{GovError, ResourceType, Result};
use crate::mutation::{
    ColumnChange, ColumnMutation, FullIntent, MemberSet, UserValueUpdater, ValueAndPurposes,
    prepare_mutations,
};
use crate::policy::{AccessPolicy, GLOBAL_MUTATOR_POLICY_ID, PolicyAction, PolicyContext};
use crate::retention::{DataLifeCycleState, RetentionResolver};
use crate::search::SearchIndex;
use crate::storage::{NewUser, UserQuery, UserRecord, UserStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutatorRequest {
    pub mutator_id: Uuid,
    /// Latest version when unset.
    #[serde(default)]
    pub mutator_version: Option<u32>,
    #[serde(default)]
    pub context: Map<String, JsonValue>,
    #[serde(default)]
    pub selector_values: Vec<JsonValue>,
    #[serde(default)]
    pub region: Option<String>,
    /// Keyed by column name, matched case-insensitively.
    pub row_data: BTreeMap<String, ValueAndPurposes>,
}

impl MutatorRequest {
    pub fn new(mutator_id: Uuid, selector_values: Vec<JsonValue>) -> Self {
        Self {
            mutator_id,
            selector_values,
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: Map<String, JsonValue>) -> Self {
        self.context = context;
        self
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn set(mut self, column: &str, value: ValueAndPurposes) -> Self {
        self.row_data.insert(column.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutatorResponse {
    /// Users the selector matched.
    pub matched_users: usize,
    /// Matched users the access policy let through.
    pub approved_users: usize,
    /// Approved users whose stored values changed.
    pub updated_users: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateUserRequest {
    /// Generated when unset.
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
    /// Its region selects where the user lives; its selector values are
    /// replaced by the new user's id.
    pub mutator: MutatorRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserResponse {
    pub user_id: Uuid,
    pub region: String,
    pub mutation: MutatorResponse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub regions: usize,
    pub users_scanned: usize,
    pub users_updated: usize,
    pub writes: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.regions += other.regions;
        self.users_scanned += other.users_scanned;
        self.users_updated += other.users_updated;
        self.writes += other.writes;
    }
}

/// Collects per-region outcomes from concurrent tasks. The first error wins;
/// successful counts are summed.
#[derive(Debug, Default)]
pub struct ResultAccumulator {
    state: Mutex<AccumulatorState>,
}

#[derive(Debug, Default)]
struct AccumulatorState {
    first_error: Option<(String, GovError)>,
    total: usize,
    failed_regions: usize,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, region: &str, outcome: Result<usize>) {
        match outcome {
            Ok(count) => self.state.lock().total += count,
            Err(e) => {
                warn!(region, error = %e, "region task failed");
                let mut state = self.state.lock();
                state.failed_regions += 1;
                if state.first_error.is_none() {
                    state.first_error = Some((region.to_string(), e));
                }
            }
        }
    }

    pub fn failed_regions(&self) -> usize {
        self.state.lock().failed_regions
    }

    /// The summed count, or the first recorded error. Resets the accumulator.
    pub fn finish(&self) -> Result<usize> {
        let state = std::mem::take(&mut *self.state.lock());
        match state.first_error {
            Some((_, e)) => Err(e),
            None => Ok(state.total),
        }
    }
}

type Compensation = Box<dyn FnOnce() -> Result<()> + Send>;

/// Named undo actions for partially applied work. Actions run newest first;
/// failures are logged and never propagated.
#[derive(Default)]
pub struct CompensationQueue {
    actions: Mutex<Vec<(String, Compensation)>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub attempted: usize,
    pub failed: usize,
}

impl CompensationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.actions.lock().push((name.into(), Box::new(action)));
    }

    pub fn pending(&self) -> Vec<String> {
        self.actions.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops queued actions once the work they guard has succeeded.
    pub fn discard(&self) {
        self.actions.lock().clear();
    }

    pub async fn run(&self) -> CompensationReport {
        let actions = std::mem::take(&mut *self.actions.lock());
        let attempted = actions.len();
        if attempted == 0 {
            return CompensationReport::default();
        }
        let joined = tokio::task::spawn_blocking(move || {
            let mut failed = 0;
            for (name, action) in actions.into_iter().rev() {
                match action() {
                    Ok(()) => debug!(action = %name, "compensation applied"),
                    Err(e) => {
                        failed += 1;
                        warn!(action = %name, error = %e, "compensation failed");
                    }
                }
            }
            failed
        })
        .await;
        let failed = match joined {
            Ok(failed) => failed,
            Err(e) => {
                error!(error = ?e, "compensation task failed to complete");
                attempted
            }
        };
        CompensationReport { attempted, failed }
    }
}

struct MutatorPlan {
    mutator: Mutator,
    registry: Arc<Registry>,
    mutations: Arc<Vec<ColumnMutation>>,
    policy: AccessPolicy,
    policy_context: PolicyContext,
}

impl MutatorPlan {
    fn prepare(ctx: &EngineContext, request: &MutatorRequest) -> Result<Self> {
        let store = ctx.config_store.as_ref();
        let mutator = load_mutator(ctx, request.mutator_id, request.mutator_version)?;
        let registry = ctx.registry()?;
        let mutations = prepare_mutations(
            &mutator,
            &request.row_data,
            &registry,
            store,
            ctx.transformers.as_ref(),
        )?;

        let load = |id: Uuid| -> Result<AccessPolicy> {
            store.access_policy(id, None)?.ok_or_else(|| {
                GovError::invalid_config(format!(
                    "access policy '{id}' of mutator '{}' does not exist",
                    mutator.name
                ))
            })
        };
        let own = load(mutator.access_policy_id)?;
        let policy = AccessPolicy::composite_and(&own, vec![load(GLOBAL_MUTATOR_POLICY_ID)?, own.clone()]);
        let policy_context =
            PolicyContext::new(PolicyAction::Write, request.context.clone(), Vec::new());

        Ok(Self {
            mutator,
            registry,
            mutations: Arc::new(mutations),
            policy,
            policy_context,
        })
    }

    /// Matched users the policy approves, grouped by region. `None` when the
    /// result threshold was exceeded without being announced.
    fn approve(
        &self,
        ctx: &EngineContext,
        candidates: Vec<UserRecord>,
        response: &mut MutatorResponse,
    ) -> Result<Option<BTreeMap<String, Vec<UserRecord>>>> {
        let max_results = self.policy.thresholds.max_results.unwrap_or(0);
        let mut approved: BTreeMap<String, Vec<UserRecord>> = BTreeMap::new();
        for user in candidates {
            let profile = user.profile(&self.registry, DataLifeCycleState::Live, None);
            let decision = ctx
                .evaluator
                .evaluate(&self.policy, &self.policy_context.for_user(profile))?;
            if !decision.allowed {
                debug!(mutator_id = %self.mutator.id, user_id = %user.id, "user denied by policy");
                continue;
            }
            response.approved_users += 1;
            if max_results > 0 && response.approved_users > max_results {
                warn!(
                    mutator_id = %self.mutator.id,
                    approved = response.approved_users,
                    max_results,
                    announce = self.policy.thresholds.announce_max_result_failure,
                    "mutator execution hit its result threshold"
                );
                if self.policy.thresholds.announce_max_result_failure {
                    return Err(GovError::ResultThresholdExceeded {
                        policy: self.policy.name.clone(),
                        max_results,
                    });
                }
                return Ok(None);
            }
            approved.entry(user.region.clone()).or_default().push(user);
        }
        Ok(Some(approved))
    }
}

fn load_mutator(ctx: &EngineContext, id: Uuid, version: Option<u32>) -> Result<Mutator> {
    ctx.config_store
        .mutator(id, version)?
        .ok_or_else(|| GovError::not_found(ResourceType::Mutator, id))
}

/// Selects, authorizes and updates the users a mutator targets.
pub async fn execute_mutator(ctx: &EngineContext, request: MutatorRequest) -> Result<MutatorResponse> {
    let started = Instant::now();
    let plan = MutatorPlan::prepare(ctx, &request)?;
    let mut response = MutatorResponse::default();

    if !ctx
        .evaluator
        .check_rate_threshold(&plan.policy, plan.mutator.id, Utc::now())?
    {
        warn!(mutator_id = %plan.mutator.id, "mutator execution hit its rate threshold");
        if plan.policy.thresholds.announce_max_execution_failure {
            return Err(GovError::RateThresholdExceeded {
                policy: plan.policy.name.clone(),
            });
        }
        return Ok(response);
    }

    let predicate = plan.mutator.selector.bind(
        &request.selector_values,
        &plan.registry,
        ctx.config.max_selector_depth,
    )?;
    let query = UserQuery {
        predicate,
        state: DataLifeCycleState::Live,
        page: None,
    };
    let stores = ctx.target_regions(request.region.as_deref())?;
    let mut candidates = Vec::new();
    for (_, result) in per_region(stores, move |store| store.select_users(&query)).await {
        candidates.extend(result?);
    }
    response.matched_users = candidates.len();

    let Some(approved) = plan.approve(ctx, candidates, &mut response)? else {
        return Ok(response);
    };
    if approved.is_empty() {
        return Ok(response);
    }

    let stores = approved
        .keys()
        .map(|region| ctx.region(region))
        .collect::<Result<Vec<_>>>()?;
    let accumulator = Arc::new(ResultAccumulator::new());
    let approved = Arc::new(approved);
    let task_accumulator = Arc::clone(&accumulator);
    let registry = Arc::clone(&plan.registry);
    let mutations = Arc::clone(&plan.mutations);
    let task_ctx = ctx.clone();
    let results = per_region(stores, move |store| {
        let users = approved
            .get(store.region())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let outcome = write_users(
            store.as_ref(),
            users,
            &registry,
            &mutations,
            task_ctx.resolver(Utc::now()),
            task_ctx.search.as_deref(),
        );
        task_accumulator.record(store.region(), outcome);
        Ok(())
    })
    .await;
    for (region, result) in results {
        if let Err(e) = result {
            accumulator.record(&region, Err(e));
        }
    }
    response.updated_users = accumulator.finish()?;

    info!(
        mutator_id = %plan.mutator.id,
        version = plan.mutator.version,
        matched = response.matched_users,
        approved = response.approved_users,
        updated = response.updated_users,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "mutator executed"
    );
    Ok(response)
}

fn write_users(
    store: &dyn UserStore,
    users: &[UserRecord],
    registry: &Arc<Registry>,
    mutations: &[ColumnMutation],
    resolver: RetentionResolver,
    search: Option<&dyn SearchIndex>,
) -> Result<usize> {
    let mut updater = UserValueUpdater::new(Arc::clone(registry), resolver);
    let mut updated = 0;
    for user in users {
        updater.set_user(user.clone());
        updater.apply_mutations(mutations)?;
        if !updater.has_changes() {
            continue;
        }
        updater.save_changes(store)?;
        updated += 1;
        reindex(store, search, registry, user.id)?;
    }
    Ok(updated)
}

fn reindex(
    store: &dyn UserStore,
    search: Option<&dyn SearchIndex>,
    registry: &Registry,
    user_id: Uuid,
) -> Result<()> {
    if let Some(search) = search {
        match store.get_user(user_id)? {
            Some(user) => search.index_user(&user, registry),
            None => search.remove_user(user_id),
        }
    }
    Ok(())
}

/// Creates a user and seeds it through a mutator that selects by id. The
/// half-created user is purged again when the mutator fails or the policy
/// does not approve it.
pub async fn create_user_with_mutator(
    ctx: &EngineContext,
    request: CreateUserRequest,
) -> Result<CreateUserResponse> {
    let CreateUserRequest {
        user_id,
        organization_id,
        mut mutator,
    } = request;
    let definition = load_mutator(ctx, mutator.mutator_id, mutator.mutator_version)?;
    if !definition.usable_for_create() {
        return Err(GovError::Validation(format!(
            "mutator '{}' cannot create users: its selector must be `id = ?`",
            definition.name
        )));
    }

    let region = mutator
        .region
        .clone()
        .unwrap_or_else(|| ctx.config.primary_region.clone());
    let store = ctx.region(&region)?;
    let user_id = user_id.unwrap_or_else(Uuid::new_v4);
    store.insert_user(NewUser {
        id: user_id,
        organization_id,
        created: Utc::now(),
    })?;

    let compensation = CompensationQueue::new();
    let purge_store = Arc::clone(&store);
    compensation.push(format!("purge user {user_id} in {region}"), move || {
        purge_store.purge_user(user_id).map(|_| ())
    });

    mutator.region = Some(region.clone());
    mutator.selector_values = vec![JsonValue::String(user_id.to_string())];
    let outcome = execute_mutator(ctx, mutator).await.and_then(|response| {
        if response.approved_users == 1 {
            Ok(response)
        } else {
            Err(GovError::Forbidden(format!(
                "mutator '{}' is not allowed to create user {user_id}",
                definition.name
            )))
        }
    });

    match outcome {
        Ok(mutation) => {
            compensation.discard();
            info!(user_id = %user_id, region = %region, "user created");
            Ok(CreateUserResponse {
                user_id,
                region,
                mutation,
            })
        }
        Err(e) => {
            let report = compensation.run().await;
            if let Some(search) = &ctx.search {
                search.remove_user(user_id);
            }
            warn!(
                user_id = %user_id,
                error = %e,
                compensations = report.attempted,
                failed = report.failed,
                "user creation rolled back"
            );
            Err(e)
        }
    }
}

/// Finds a live user in the requested region, or in every region the
/// engine would fan out to.
async fn locate_user(ctx: &EngineContext, user_id: Uuid, region: Option<&str>) -> Result<UserRecord> {
    let stores = ctx.target_regions(region)?;
    for (_, result) in per_region(stores, move |store| store.get_user(user_id)).await {
        if let Some(user) = result?
            && !user.is_deleted()
        {
            return Ok(user);
        }
    }
    Err(GovError::not_found(ResourceType::User, user_id))
}

/// Mutations that revoke every purpose of every stored user value.
fn revocation_mutations(registry: &Registry, user: &UserRecord) -> Result<Vec<ColumnMutation>> {
    let mut mutations = Vec::new();
    for column in registry.columns().iter().filter(|c| !c.is_system()) {
        let values = user.values_for(DataLifeCycleState::Live, column.id);
        if values.is_empty() {
            continue;
        }
        let data_type = registry.column_data_type(column)?.clone();
        let mutation = if column.constraints().partial_updates {
            ColumnMutation {
                column: column.clone(),
                data_type,
                change: ColumnChange::Partial {
                    additions: None,
                    deletions: Some(MemberSet::KeepCurrent),
                },
                purpose_additions: Vec::new(),
                purpose_deletions: Vec::new(),
            }
        } else {
            let purposes: BTreeSet<Uuid> = values.iter().flat_map(|v| v.purpose_ids()).collect();
            ColumnMutation {
                column: column.clone(),
                data_type,
                change: ColumnChange::Full(FullIntent::Clear),
                purpose_additions: Vec::new(),
                purpose_deletions: purposes.into_iter().collect(),
            }
        };
        mutation.validate()?;
        mutations.push(mutation);
    }
    Ok(mutations)
}

/// Revokes all of a user's values, leaving soft-deleted shadows where
/// retention asks for them, then deletes the user.
pub async fn delete_user(ctx: &EngineContext, user_id: Uuid, region: Option<&str>) -> Result<()> {
    let user = locate_user(ctx, user_id, region).await?;
    let registry = ctx.registry()?;
    let store = ctx.region(&user.region)?;
    let mutations = revocation_mutations(&registry, &user)?;
    let now = Utc::now();
    let resolver = ctx.resolver(now);
    let region = user.region.clone();

    let writes = tokio::task::spawn_blocking(move || -> Result<usize> {
        let mut updater = UserValueUpdater::new(registry, resolver);
        updater.set_user(user);
        updater.apply_mutations(&mutations)?;
        let writes = updater.changes().len();
        updater.save_changes(store.as_ref())?;
        store.delete_user(user_id, now)?;
        Ok(writes)
    })
    .await
    .map_err(|e| GovError::Internal(format!("user deletion task failed: {e}")))??;

    if let Some(search) = &ctx.search {
        search.remove_user(user_id);
    }
    info!(user_id = %user_id, region = %region, writes, "user deleted");
    Ok(())
}

/// Revokes every purpose whose retention has passed at `reference`, in every
/// region.
pub async fn sweep_expired(ctx: &EngineContext, reference: DateTime<Utc>) -> Result<SweepReport> {
    let started = Instant::now();
    let registry = ctx.registry()?;
    let stores: Vec<Arc<dyn UserStore>> = ctx.regions.values().cloned().collect();
    let task_ctx = ctx.clone();
    let results = per_region(stores, move |store| {
        sweep_region(
            store.as_ref(),
            &registry,
            task_ctx.resolver(reference),
            task_ctx.search.as_deref(),
        )
    })
    .await;

    let mut report = SweepReport::default();
    let mut first_error = None;
    for (region, result) in results {
        match result {
            Ok(region_report) => report.merge(region_report),
            Err(e) => {
                warn!(region = %region, error = %e, "expired purpose sweep failed");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    info!(
        regions = report.regions,
        scanned = report.users_scanned,
        updated = report.users_updated,
        writes = report.writes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "expired purposes swept"
    );
    Ok(report)
}

fn sweep_region(
    store: &dyn UserStore,
    registry: &Arc<Registry>,
    resolver: RetentionResolver,
    search: Option<&dyn SearchIndex>,
) -> Result<SweepReport> {
    let mut report = SweepReport {
        regions: 1,
        ..SweepReport::default()
    };
    let mut updater = UserValueUpdater::new(Arc::clone(registry), resolver);
    for user_id in store.list_user_ids()? {
        let Some(user) = store.get_user(user_id)? else {
            continue;
        };
        report.users_scanned += 1;
        updater.set_user(user);
        updater.remove_expired_purposes()?;
        if !updater.has_changes() {
            continue;
        }
        report.writes += updater.changes().len();
        updater.save_changes(store)?;
        report.users_updated += 1;
        reindex(store, search, registry, user_id)?;
    }
    Ok(report)
}

/// Union of purposes consented across a user's live values, per column name.
/// `columns` narrows the result to the named columns.
pub async fn consented_purposes_for_user(
    ctx: &EngineContext,
    user_id: Uuid,
    columns: Option<&[String]>,
    region: Option<&str>,
) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let user = locate_user(ctx, user_id, region).await?;
    let registry = ctx.registry()?;
    let selected = match columns {
        Some(names) => names
            .iter()
            .map(|name| registry.column_by_name(name))
            .collect::<Result<Vec<_>>>()?,
        None => registry.columns().iter().collect(),
    };

    let mut out = BTreeMap::new();
    for column in selected.into_iter().filter(|c| !c.is_system()) {
        let mut purposes = BTreeSet::new();
        for value in user.values_for(DataLifeCycleState::Live, column.id) {
            for purpose_id in value.purpose_ids() {
                let purpose = registry.purpose(purpose_id)?;
                purposes.insert(purpose.name.clone());
            }
        }
        out.insert(column.name.clone(), purposes);
    }
    Ok(out)
}
