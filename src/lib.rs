pub mod catalog;
pub mod commit;
pub mod config;
pub mod context;
pub mod error;
pub mod mutation;
pub mod policy;
pub mod query;
pub mod retention;
pub mod search;
pub mod storage;
pub mod transform;

use crate::catalog::ConfigStore;
use crate::commit::{
    CreateUserRequest, CreateUserResponse, MutatorRequest, MutatorResponse, SweepReport,
};
use crate::config::EngineConfig;
use crate::error::{GovError, Result};
use crate::policy::{AccessPolicyEvaluator, RuleEvaluator};
use crate::query::{AccessorRequest, AccessorResponse};
use crate::search::{InMemorySearchIndex, SearchIndex};
use crate::storage::UserStore;
use crate::transform::{BuiltinTransformerExecutor, TransformerExecutor};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub use context::EngineContext;

/// Handle over one tenant's configuration, policy evaluation, transformers and
/// regional user stores.
pub struct GovernanceEngine {
    ctx: EngineContext,
}

impl GovernanceEngine {
    /// Opens an engine over `regions`. The primary region named by `config`
    /// must be among them and region names must be distinct.
    pub fn open(
        config: EngineConfig,
        config_store: Arc<dyn ConfigStore>,
        regions: Vec<Arc<dyn UserStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let mut by_name = BTreeMap::new();
        for store in regions {
            let name = store.region().to_string();
            if by_name.insert(name.clone(), store).is_some() {
                return Err(GovError::invalid_config(format!(
                    "region '{name}' is configured twice"
                )));
            }
        }
        if !by_name.contains_key(&config.primary_region) {
            return Err(GovError::invalid_config(format!(
                "primary region '{}' has no user store",
                config.primary_region
            )));
        }
        info!(
            primary_region = %config.primary_region,
            regions = by_name.len(),
            region_fanout = config.region_fanout,
            default_page_size = config.default_page_size,
            max_page_size = config.max_page_size,
            limit_multiplier = config.limit_multiplier,
            "governance engine opened"
        );
        Ok(Self {
            ctx: EngineContext {
                config,
                config_store,
                regions: by_name,
                evaluator: Arc::new(RuleEvaluator::new()),
                transformers: Arc::new(BuiltinTransformerExecutor),
                search: None,
            },
        })
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn AccessPolicyEvaluator>) -> Self {
        self.ctx.evaluator = evaluator;
        self
    }

    pub fn with_transformer_executor(mut self, executor: Arc<dyn TransformerExecutor>) -> Self {
        self.ctx.transformers = executor;
        self
    }

    pub fn with_search_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.ctx.search = Some(index);
        self
    }

    /// Installs an [`InMemorySearchIndex`] seeded from every stored user.
    pub fn with_in_memory_search(mut self) -> Result<Self> {
        let index = InMemorySearchIndex::new(self.ctx.config.search_max_results);
        let registry = self.ctx.registry()?;
        for store in self.ctx.regions.values() {
            for user_id in store.list_user_ids()? {
                if let Some(user) = store.get_user(user_id)? {
                    index.index_user(&user, &registry);
                }
            }
        }
        self.ctx.search = Some(Arc::new(index));
        Ok(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn region_names(&self) -> Vec<&str> {
        self.ctx.regions.keys().map(String::as_str).collect()
    }

    pub async fn execute_accessor(&self, request: AccessorRequest) -> Result<AccessorResponse> {
        query::execute_accessor(&self.ctx, request).await
    }

    pub async fn execute_mutator(&self, request: MutatorRequest) -> Result<MutatorResponse> {
        commit::execute_mutator(&self.ctx, request).await
    }

    pub async fn create_user_with_mutator(
        &self,
        request: CreateUserRequest,
    ) -> Result<CreateUserResponse> {
        commit::create_user_with_mutator(&self.ctx, request).await
    }

    pub async fn delete_user(&self, user_id: Uuid, region: Option<&str>) -> Result<()> {
        commit::delete_user(&self.ctx, user_id, region).await
    }

    pub async fn sweep_expired(&self, reference: DateTime<Utc>) -> Result<SweepReport> {
        commit::sweep_expired(&self.ctx, reference).await
    }

    pub async fn consented_purposes_for_user(
        &self,
        user_id: Uuid,
        columns: Option<&[String]>,
    ) -> Result<BTreeMap<String, BTreeSet<String>>> {
        commit::consented_purposes_for_user(&self.ctx, user_id, columns, None).await
    }
}
